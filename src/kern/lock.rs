//! Spin locks with interrupt-save discipline
//!
//! Every shared kernel table is guarded by a [`SpinLock`]. Acquiring
//! disables interrupts on the local CPU and releasing restores the prior
//! flag, so a timer ISR can never deadlock against a lock its own CPU
//! already holds. Debug builds additionally keep a per-CPU shadow count
//! of held locks; the scheduler asserts it is zero before any context
//! switch.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::types::MAX_CPUS;

#[cfg(debug_assertions)]
static LOCKS_HELD: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

/// Number of spin locks currently held by the calling CPU (debug builds)
#[cfg(debug_assertions)]
pub fn locks_held() -> usize {
    LOCKS_HELD[crate::kern::cpu::current_index()].load(Ordering::Relaxed)
}

#[cfg(debug_assertions)]
fn audit_acquire() {
    LOCKS_HELD[crate::kern::cpu::current_index()].fetch_add(1, Ordering::Relaxed);
}

#[cfg(debug_assertions)]
fn audit_release() {
    LOCKS_HELD[crate::kern::cpu::current_index()].fetch_sub(1, Ordering::Relaxed);
}

#[cfg(not(debug_assertions))]
fn audit_acquire() {}

#[cfg(not(debug_assertions))]
fn audit_release() {}

/// A test-and-set spin lock protecting `T`.
///
/// The guard restores the saved interrupt flag on drop, which makes it
/// safe to take the same lock from interrupt and task context on the
/// same CPU.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until available. Interrupts are
    /// disabled on the local CPU for the lifetime of the guard.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let flags = arch::irq_save();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                arch::pause();
            }
        }

        audit_acquire();
        SpinLockGuard { lock: self, flags }
    }

    /// Acquire the lock without blocking
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let flags = arch::irq_save();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            audit_acquire();
            Some(SpinLockGuard { lock: self, flags })
        } else {
            arch::irq_restore(flags);
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    flags: u64,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        audit_release();
        self.lock.locked.store(false, Ordering::Release);
        arch::irq_restore(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_guard() {
        let lock = SpinLock::new(42);

        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 42);
            *guard = 100;
            assert!(lock.is_locked());
        }

        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 100);
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new(());

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_held_audit() {
        let lock = SpinLock::new(0u32);

        let before = locks_held();
        let guard = lock.lock();
        assert_eq!(locks_held(), before + 1);
        drop(guard);
        assert_eq!(locks_held(), before);
    }
}
