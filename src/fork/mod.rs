//! Fork-safety protocol
//!
//! Every [`ForkGuard`] places one [`ForkAware`] participant in a
//! process-wide registry. A single `pthread_atfork` registration, installed
//! the first time a guard is created, drives all participants:
//!
//! ```text
//! prepare  lock registry -> prepare(id 0) -> prepare(id 1) -> ...
//! parent   ... -> release_parent(id 1) -> release_parent(id 0) -> unlock registry
//! child    ... -> reinit_child(id 1) -> reinit_child(id 0) -> reinit registry
//! ```
//!
//! Ascending ids give every participant a fixed global lock order. Handlers
//! never allocate, log or call back into an allocator.

pub mod mutex;

pub use mutex::{ForkSafeMutex, ForkSafeMutexGuard, ForkSafeRawMutex};

use crate::error::{Result, VmemError};
use parking_lot::lock_api::RawMutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// A component that must stay consistent across `fork()`
///
/// Implementations run inside the fork critical window: they may only take
/// or release their own locks and update plain atomic state.
pub trait ForkAware: Send + Sync {
    /// Acquire every internal lock, in a fixed order
    fn prepare(&self);

    /// Release the locks taken by `prepare`, in reverse order (parent)
    fn release_parent(&self);

    /// Reset the locks taken by `prepare` and refresh per-process state (child)
    fn reinit_child(&self);
}

type Registry = BTreeMap<u64, Arc<dyn ForkAware>>;

static REGISTRY: ForkSafeMutex<Registry> =
    ForkSafeMutex::const_new(ForkSafeRawMutex::INIT, BTreeMap::new());

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

static HANDLERS: OnceLock<libc::c_int> = OnceLock::new();

extern "C" fn prepare_fork() {
    // SAFETY: released by `parent_after_fork` or reset by `child_after_fork`.
    unsafe { REGISTRY.raw().lock() };

    // SAFETY: the registry lock is held.
    let registry = unsafe { &*REGISTRY.data_ptr() };
    for participant in registry.values() {
        participant.prepare();
    }
}

extern "C" fn parent_after_fork() {
    // SAFETY: `prepare_fork` left the registry locked.
    let registry = unsafe { &*REGISTRY.data_ptr() };
    for participant in registry.values().rev() {
        participant.release_parent();
    }

    // SAFETY: locked by `prepare_fork` on this thread.
    unsafe { REGISTRY.force_unlock() };
}

extern "C" fn child_after_fork() {
    // SAFETY: the child runs only the forking thread, which holds the lock.
    let registry = unsafe { &*REGISTRY.data_ptr() };
    for participant in registry.values().rev() {
        participant.reinit_child();
    }

    // SAFETY: no other thread exists in the child.
    unsafe { REGISTRY.raw().reinit() };
}

fn install_handlers() -> Result<()> {
    let rc = *HANDLERS.get_or_init(|| {
        // SAFETY: the handlers are plain extern "C" functions with 'static lifetime.
        unsafe {
            libc::pthread_atfork(
                Some(prepare_fork),
                Some(parent_after_fork),
                Some(child_after_fork),
            )
        }
    });

    if rc != 0 {
        return Err(VmemError::ForkRegistration(rc));
    }
    Ok(())
}

/// Registration of one participant with the fork protocol
///
/// Deregisters on drop, so the participant's lifetime bounds its
/// participation in forks.
#[derive(Debug)]
pub struct ForkGuard {
    id: u64,
}

impl ForkGuard {
    /// Register `participant` to be driven around every `fork()`
    pub fn register(participant: Arc<dyn ForkAware>) -> Result<Self> {
        install_handlers()?;

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        REGISTRY.lock().insert(id, participant);

        debug!(id, "fork guard registered");
        Ok(ForkGuard { id })
    }

    /// Position of this participant in the global lock order
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this guard is still present in the registry
    pub fn is_registered(&self) -> bool {
        REGISTRY.lock().contains_key(&self.id)
    }
}

impl Drop for ForkGuard {
    fn drop(&mut self) {
        // Drop the participant outside the registry lock
        let removed = REGISTRY.lock().remove(&self.id);
        drop(removed);
        debug!(id = self.id, "fork guard deregistered");
    }
}
