//! # vmem - Fork-Safe Region Allocation for Persistent-Memory Pools
//!
//! `vmem-rs` provides two pieces a persistent-memory runtime needs before it
//! can trust a pool file and start carving memory out of it:
//!
//! - **Architecture certification**: a 16-byte descriptor of the machine a
//!   pool was created on, and a check that the running process matches it
//! - **Fork-safe arenas**: a thread-safe allocator over a caller-supplied
//!   region whose locks survive `fork()` in both parent and child
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use memmap2::MmapMut;
//! use vmem_rs::{ArchCertifier, ArchDescriptor, Arena, Region, Result};
//!
//! # fn main() -> Result<()> {
//! // Stamp the descriptor into a new pool, then verify it on reopen
//! let stored = ArchDescriptor::current()?;
//! let bytes = stored.to_bytes();
//! assert!(ArchCertifier::new().certify(&ArchDescriptor::from_bytes(&bytes)?)?);
//!
//! // Allocate from a region
//! let mut map = MmapMut::map_anon(1 << 20)?;
//! let arena = Arena::create(unsafe { Region::from_mmap(&mut map)? })?;
//!
//! let handle = arena.allocate(100)?;
//! assert!(arena.usable_size(handle)? >= 100);
//! arena.free(handle)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Fork Behaviour
//!
//! Every fork-safe arena registers with a process-wide fork protocol. Around
//! each `fork()` all arena locks are taken in a fixed order, then released
//! in the parent and reset in the child. The child inherits a copy-on-write
//! view of every region and can keep allocating immediately, even if other
//! parent threads were inside the allocator at the moment of the fork.

#[cfg(not(unix))]
compile_error!("vmem-rs requires a unix platform");

pub mod allocator;
pub mod arch;
pub mod error;
pub mod fork;

pub use allocator::{
    Arena, ArenaBuilder, ArenaConfig, ArenaStats, Handle, Region, MIN_REGION_SIZE, REGION_ALIGN,
    UNIT_SIZE,
};
pub use arch::{
    layout_descriptor, probe, ArchCertifier, ArchDescriptor, ArchProbe, ByteOrder, FileProbe,
    ImageProbe, Machine, Mismatch, WordClass,
};
pub use error::{Result, VmemError};
pub use fork::{ForkAware, ForkGuard};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
