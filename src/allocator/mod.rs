//! Region-backed allocation
//!
//! - [`Region`] - caller-owned span of memory an arena allocates from
//! - [`extent`] - free-space bookkeeping in fixed units
//! - [`arena`] - the thread-safe, fork-safe allocator over one region
//! - [`config`] - arena configuration and builder

pub mod arena;
pub mod config;
pub mod extent;

use crate::error::{Result, VmemError};
use memmap2::MmapMut;
use std::ptr::NonNull;

pub use arena::{Arena, ArenaStats};
pub use config::{ArenaBuilder, ArenaConfig};

/// Allocation granularity in bytes; also the minimum alignment of every allocation
pub const UNIT_SIZE: usize = 64;

/// Required alignment of a region's base address
pub const REGION_ALIGN: usize = UNIT_SIZE;

/// Smallest region an arena accepts (16KB)
pub const MIN_REGION_SIZE: usize = 16 * 1024;

/// A contiguous span of memory backing one arena
///
/// The region only describes the memory; whoever created the mapping keeps
/// ownership of it and must keep it mapped for as long as an arena uses it.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: a region is an address range; access to the memory behind it is
// serialized by the arena that owns it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Describe the span `[base, base + len)`
    ///
    /// # Safety
    ///
    /// The span must be valid for reads and writes, must not be used by
    /// anything else while an arena allocates from it, and must outlive
    /// every arena built on it.
    pub unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Result<Self> {
        let base = NonNull::new(base).ok_or_else(|| VmemError::InvalidRegion {
            base: 0,
            len,
            reason: "null base address".to_string(),
        })?;
        Ok(Region { base, len })
    }

    /// Describe the whole of a writable mapping
    ///
    /// # Safety
    ///
    /// The mapping must not be dropped, remapped or otherwise accessed while
    /// an arena built on this region is alive.
    pub unsafe fn from_mmap(map: &mut MmapMut) -> Result<Self> {
        Self::from_raw_parts(map.as_mut_ptr(), map.len())
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[addr, addr + size)` lies entirely inside this region
    pub fn contains(&self, addr: usize, size: usize) -> bool {
        match addr.checked_add(size) {
            Some(end) => addr >= self.addr() && end <= self.addr() + self.len,
            None => false,
        }
    }
}

/// A live allocation returned by an [`Arena`]
///
/// Handles are plain addresses. Passing one to an arena that did not hand it
/// out, or after it was freed, is detected and rejected with
/// [`VmemError::InvalidHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonNull<u8>);

// SAFETY: a handle is an address; it grants no access on its own.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub fn from_non_null(ptr: NonNull<u8>) -> Self {
        Handle(ptr)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        self.0
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}
