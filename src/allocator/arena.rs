//! Thread-safe, fork-safe allocator over a single region
//!
//! All bookkeeping sits behind one [`ForkSafeMutex`]. When the arena is
//! fork-safe it registers itself with the fork protocol, so that:
//!
//! - before `fork()` the lock is taken, meaning no thread is mid-update;
//! - in the parent the lock is released again;
//! - in the child the lock is reset to unlocked, the cached pid refreshed
//!   and the fork generation bumped.
//!
//! The region itself is private memory, so after a fork parent and child
//! each see their own copy-on-write view of it and evolve independently.

use super::config::ArenaConfig;
use super::extent::ExtentMap;
use super::{Handle, Region, MIN_REGION_SIZE, REGION_ALIGN, UNIT_SIZE};
use crate::error::{Result, VmemError};
use crate::fork::{ForkAware, ForkGuard, ForkSafeMutex, ForkSafeMutexGuard};
use parking_lot::lock_api::RawMutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of an arena's usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Size of the backing region in bytes
    pub region_len: usize,
    /// Bytes held by live allocations (usable sizes)
    pub allocated: usize,
    /// Bytes available for allocation
    pub free: usize,
    /// Highest offset ever handed out, in bytes from the region base
    pub high_water: usize,
    /// Number of live allocations
    pub live_allocations: usize,
    /// Number of free extents (fragmentation indicator)
    pub free_extents: usize,
    /// Number of forks this copy of the arena has been inherited through
    pub forks: u64,
}

/// Bookkeeping protected by the arena lock
struct ArenaState {
    extents: ExtentMap,
    /// Live allocations: start unit -> length in units
    live: BTreeMap<usize, usize>,
    /// One past the highest unit ever allocated
    high_water: usize,
}

/// State shared between the arena and the fork protocol
struct ArenaShared {
    region: Region,
    state: ForkSafeMutex<ArenaState>,
    pid: AtomicU32,
    forks: AtomicU64,
}

impl ForkAware for ArenaShared {
    fn prepare(&self) {
        // SAFETY: released by `release_parent` or reset by `reinit_child`.
        unsafe { self.state.raw().lock() };
    }

    fn release_parent(&self) {
        // SAFETY: locked by `prepare` on this thread.
        unsafe { self.state.force_unlock() };
    }

    fn reinit_child(&self) {
        self.pid.store(std::process::id(), Ordering::Relaxed);
        self.forks.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the forking thread is the only thread in the child.
        unsafe { self.state.raw().reinit() };
    }
}

/// Allocator instance managing one [`Region`]
///
/// `allocate`, `free` and `usable_size` may be called from any number of
/// threads concurrently. Dropping or [destroying](Arena::destroy) the arena
/// invalidates every outstanding handle; the region stays mapped.
pub struct Arena {
    guard: Option<ForkGuard>,
    shared: Arc<ArenaShared>,
    config: ArenaConfig,
}

impl Arena {
    /// Create an arena with the default configuration
    pub fn create(region: Region) -> Result<Self> {
        Self::with_config(region, ArenaConfig::default())
    }

    /// Create an arena with a custom configuration
    pub fn with_config(region: Region, config: ArenaConfig) -> Result<Self> {
        if region.len() < MIN_REGION_SIZE {
            return Err(VmemError::InvalidRegion {
                base: region.addr(),
                len: region.len(),
                reason: format!("smaller than minimum of {} bytes", MIN_REGION_SIZE),
            });
        }

        if region.addr() % REGION_ALIGN != 0 {
            return Err(VmemError::InvalidRegion {
                base: region.addr(),
                len: region.len(),
                reason: format!("base not aligned to {} bytes", REGION_ALIGN),
            });
        }

        let shared = Arc::new(ArenaShared {
            region,
            state: ForkSafeMutex::new(ArenaState {
                extents: ExtentMap::new(region.len() / UNIT_SIZE),
                live: BTreeMap::new(),
                high_water: 0,
            }),
            pid: AtomicU32::new(std::process::id()),
            forks: AtomicU64::new(0),
        });

        let guard = if config.fork_safe {
            Some(ForkGuard::register(shared.clone())?)
        } else {
            None
        };

        debug!(
            name = %config.name,
            base = format_args!("{:#x}", region.addr()),
            len = region.len(),
            fork_safe = config.fork_safe,
            "arena created"
        );

        Ok(Arena {
            guard,
            shared,
            config,
        })
    }

    fn lock(&self) -> ForkSafeMutexGuard<'_, ArenaState> {
        self.shared.state.lock()
    }

    fn base(&self) -> usize {
        self.shared.region.addr()
    }

    fn handle_at(&self, unit: usize) -> Handle {
        let ptr = (self.base() + unit * UNIT_SIZE) as *mut u8;
        // SAFETY: offsets are inside a region with a non-null base.
        Handle::from_non_null(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Map a handle back to its start unit, without checking liveness
    fn unit_of(&self, handle: Handle) -> Result<usize> {
        let addr = handle.addr();
        let base = self.base();
        let limit = base + self.shared.region.len();

        if addr < base || addr >= limit || (addr - base) % UNIT_SIZE != 0 {
            return Err(VmemError::InvalidHandle(addr));
        }
        Ok((addr - base) / UNIT_SIZE)
    }

    fn units_for(size: usize) -> Result<usize> {
        if size == 0 {
            return Err(VmemError::InvalidArgument(
                "zero-size allocation".to_string(),
            ));
        }
        Ok(size / UNIT_SIZE + usize::from(size % UNIT_SIZE != 0))
    }

    fn allocate_locked(
        &self,
        state: &mut ArenaState,
        size: usize,
        alignment: usize,
    ) -> Result<Handle> {
        let units = Self::units_for(size)?;
        let align_units = alignment.max(UNIT_SIZE) / UNIT_SIZE;
        let phase = (self.base() / UNIT_SIZE) % align_units;

        let start = state
            .extents
            .allocate(units, align_units, phase)
            .ok_or(VmemError::OutOfMemory { requested: size })?;

        state.live.insert(start, units);
        state.high_water = state.high_water.max(start + units);

        Ok(self.handle_at(start))
    }

    /// Allocate at least `size` bytes
    pub fn allocate(&self, size: usize) -> Result<Handle> {
        self.allocate_aligned(size, UNIT_SIZE)
    }

    /// Allocate at least `size` bytes at an address that is a multiple of `alignment`
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<Handle> {
        if !alignment.is_power_of_two() {
            return Err(VmemError::InvalidArgument(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }

        let mut state = self.lock();
        self.allocate_locked(&mut state, size, alignment)
    }

    /// Allocate at least `size` zeroed bytes
    pub fn allocate_zeroed(&self, size: usize) -> Result<Handle> {
        let handle = self.allocate(size)?;
        // SAFETY: the allocation is live, inside the region and owned by the caller.
        unsafe { ptr::write_bytes(handle.as_ptr(), 0, size) };
        Ok(handle)
    }

    /// Usable size of a live allocation; never less than what was requested
    pub fn usable_size(&self, handle: Handle) -> Result<usize> {
        let unit = self.unit_of(handle)?;
        let state = self.lock();
        state
            .live
            .get(&unit)
            .map(|units| units * UNIT_SIZE)
            .ok_or(VmemError::InvalidHandle(handle.addr()))
    }

    /// Return an allocation to free space
    ///
    /// Double frees and foreign handles are rejected with `InvalidHandle`.
    pub fn free(&self, handle: Handle) -> Result<()> {
        let unit = self.unit_of(handle)?;
        let mut state = self.lock();

        let units = match state.live.remove(&unit) {
            Some(units) => units,
            None => {
                drop(state);
                warn!(
                    name = %self.config.name,
                    addr = format_args!("{:#x}", handle.addr()),
                    "free of a handle that is not live"
                );
                return Err(VmemError::InvalidHandle(handle.addr()));
            }
        };

        self.release_locked(&mut state, unit, units);
        Ok(())
    }

    /// Return `[unit, unit + units)` to the extent map, poisoning it if configured
    ///
    /// The span must be owned by the caller and no longer recorded as live.
    fn release_locked(&self, state: &mut ArenaState, unit: usize, units: usize) {
        if let Some(byte) = self.config.poison_on_free {
            // SAFETY: the span lies inside the region and nobody else can
            // obtain it before it goes back to the extent map below.
            unsafe {
                ptr::write_bytes(self.handle_at(unit).as_ptr(), byte, units * UNIT_SIZE)
            };
        }

        state.extents.free(unit, units);
    }

    /// Resize an allocation, moving it if it cannot change size in place
    ///
    /// On success the old handle must no longer be used unless it equals the
    /// returned one. On failure the existing allocation is untouched.
    pub fn reallocate(&self, handle: Handle, new_size: usize) -> Result<Handle> {
        let new_units = Self::units_for(new_size)?;
        let unit = self.unit_of(handle)?;
        let mut state = self.lock();

        let units = *state
            .live
            .get(&unit)
            .ok_or(VmemError::InvalidHandle(handle.addr()))?;

        if new_units <= units {
            if new_units < units {
                state.live.insert(unit, new_units);
                self.release_locked(&mut state, unit + new_units, units - new_units);
            }
            return Ok(handle);
        }

        if state.extents.extend_at(unit + units, new_units - units) {
            state.live.insert(unit, new_units);
            state.high_water = state.high_water.max(unit + new_units);
            return Ok(handle);
        }

        let moved = self.allocate_locked(&mut state, new_size, UNIT_SIZE)?;
        // SAFETY: both spans are live, disjoint and inside the region.
        unsafe {
            ptr::copy_nonoverlapping(handle.as_ptr(), moved.as_ptr(), units * UNIT_SIZE);
        }
        state.live.remove(&unit);
        self.release_locked(&mut state, unit, units);

        Ok(moved)
    }

    /// Current usage statistics
    pub fn stats(&self) -> ArenaStats {
        let state = self.lock();
        let total = state.extents.total_units();
        let free = state.extents.free_units();

        ArenaStats {
            region_len: self.shared.region.len(),
            allocated: (total - free) * UNIT_SIZE,
            free: free * UNIT_SIZE,
            high_water: state.high_water * UNIT_SIZE,
            live_allocations: state.live.len(),
            free_extents: state.extents.extent_count(),
            forks: self.fork_generation(),
        }
    }

    /// Verify that free extents and live allocations tile the region exactly
    pub fn check(&self) -> Result<()> {
        let state = self.lock();

        let free = state.extents.iter().map(|e| (e.start, e.length, true));
        let live = state.live.iter().map(|(&start, &len)| (start, len, false));
        let mut spans: Vec<_> = free.chain(live).collect();
        spans.sort_unstable_by_key(|&(start, _, _)| start);

        let mut cursor = 0;
        let mut free_units = 0;
        let mut prev_free = false;

        for (start, len, is_free) in spans {
            if len == 0 {
                return Err(VmemError::Corrupted(format!("empty span at unit {}", start)));
            }
            if start != cursor {
                return Err(VmemError::Corrupted(format!(
                    "span at unit {} does not follow unit {}",
                    start, cursor
                )));
            }
            if is_free && prev_free {
                return Err(VmemError::Corrupted(format!(
                    "uncoalesced free extents at unit {}",
                    start
                )));
            }
            if is_free {
                free_units += len;
            }
            prev_free = is_free;
            cursor = start + len;
        }

        if cursor != state.extents.total_units() {
            return Err(VmemError::Corrupted(format!(
                "spans end at unit {} of {}",
                cursor,
                state.extents.total_units()
            )));
        }

        if free_units != state.extents.free_units() {
            return Err(VmemError::Corrupted(format!(
                "free counter {} disagrees with extents {}",
                state.extents.free_units(),
                free_units
            )));
        }

        Ok(())
    }

    /// Region this arena allocates from
    pub fn region(&self) -> Region {
        self.shared.region
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Process id this copy of the arena belongs to
    pub fn owner_pid(&self) -> u32 {
        self.shared.pid.load(Ordering::Relaxed)
    }

    /// Number of forks this copy of the arena has been inherited through
    pub fn fork_generation(&self) -> u64 {
        self.shared.forks.load(Ordering::Relaxed)
    }

    /// Whether the arena takes part in the fork protocol
    pub fn is_fork_safe(&self) -> bool {
        self.guard.is_some()
    }

    /// Release the arena's bookkeeping; the region is left mapped
    pub fn destroy(self) {
        let stats = self.stats();
        debug!(
            name = %self.config.name,
            live_allocations = stats.live_allocations,
            allocated = stats.allocated,
            "arena destroyed"
        );
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.config.name)
            .field("region", &self.shared.region)
            .field("fork_safe", &self.is_fork_safe())
            .finish()
    }
}
