//! Mutex whose whole state is one atomic word
//!
//! A copy of this lock inherited by a forked child can always be put back
//! into the unlocked state with [`ForkSafeRawMutex::reinit`]. It never parks
//! waiters in a process-global table, so no other thread's bookkeeping is
//! needed to release it.

use parking_lot::lock_api::{self, GuardSend, RawMutex};
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Spins before yielding the CPU while contended
const SPIN_LIMIT: u32 = 64;

/// Spin lock with yield backoff
pub struct ForkSafeRawMutex {
    locked: AtomicBool,
}

impl ForkSafeRawMutex {
    /// Force the lock to its initial unlocked state
    ///
    /// Only sound when no live thread of this process believes it holds the
    /// lock, which is the case in a freshly forked child.
    pub fn reinit(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

unsafe impl RawMutex for ForkSafeRawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: ForkSafeRawMutex = ForkSafeRawMutex {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let mut spins = 0u32;
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPIN_LIMIT {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub type ForkSafeMutex<T> = lock_api::Mutex<ForkSafeRawMutex, T>;
pub type ForkSafeMutexGuard<'a, T> = lock_api::MutexGuard<'a, ForkSafeRawMutex, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_and_unlock() {
        let mutex = ForkSafeMutex::new(0u32);
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
        }
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn test_reinit_releases_leaked_lock() {
        let mutex = ForkSafeMutex::new(());
        std::mem::forget(mutex.lock());
        assert!(mutex.is_locked());

        // SAFETY: the forgotten guard will never unlock.
        unsafe { mutex.raw().reinit() };
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let counter = Arc::new(ForkSafeMutex::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*counter.lock(), 8000);
    }
}
