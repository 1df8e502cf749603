//! SMP-supported spinlock.
//!
//! The scheduler and the frame allocator guard their state with this lock.
//! Acquiring it masks interrupts in the current context, so a timer interrupt
//! can never observe a half-updated ready queue.

use crate::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// [`SpinLock::try_lock`] found the lock taken.
#[derive(Debug)]
pub struct WouldBlock;

/// A lock that busy-waits.
///
/// The protected value is reached only through the [`SpinLockGuard`] that
/// [`SpinLock::lock`] and [`SpinLock::try_lock`] hand out. Holding the guard
/// masks interrupts in the holding context, and the guard has to be given
/// back with [`SpinLockGuard::unlock`].
///
/// # Examples
///
/// ```
/// use machine::spinlock::SpinLock;
/// use std::sync::Arc;
///
/// let frames = Arc::new(SpinLock::new(Vec::new()));
/// let workers: Vec<_> = (0..4)
///     .map(|cpu| {
///         let frames = frames.clone();
///         std::thread::spawn(move || {
///             let mut guard = frames.lock();
///             guard.push(cpu);
///             guard.unlock();
///         })
///     })
///     .collect();
/// for worker in workers {
///     worker.join().unwrap();
/// }
/// let guard = frames.lock();
/// assert_eq!(guard.len(), 4);
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// An unlocked lock around `t`.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            locked: AtomicBool::new(false),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, spinning until it is able to do so.
    ///
    /// Interrupts of the current context are masked before each attempt and
    /// stay masked while the guard lives. When the guard goes out of scope
    /// without [`SpinLockGuard::unlock`], panic occurs.
    ///
    /// Locking a spinlock in the context which already holds it never
    /// returns.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        let guard = loop {
            let guard = InterruptGuard::new();

            if !self.locked.swap(true, Ordering::Acquire) {
                break guard;
            }

            drop(guard);
            backoff.snooze();
        };

        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            guard: Some(guard),
        }
    }

    /// Take the lock if it is free, without spinning.
    ///
    /// # Errors
    /// [`WouldBlock`] when someone holds the lock.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if !self.locked.swap(true, Ordering::Acquire) {
            Ok(SpinLockGuard {
                guard: Some(guard),
                caller: core::panic::Location::caller(),
                lock: self,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Whether the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// The protected value, without locking.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// Proof that a [`SpinLock`] is held, and access to its value.
///
/// Dropping a guard does not release the lock; it panics and reports where
/// the lock was taken. Call [`SpinLockGuard::unlock`] instead.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    guard: Option<InterruptGuard>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Release the lock and restore the interrupt state.
    pub fn unlock(mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.guard.take();
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Unwinding out of a critical section already reports the real failure.
        if std::thread::panicking() {
            self.lock.locked.store(false, Ordering::Release);
            return;
        }
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptState;

    #[test]
    fn lock_masks_interrupts() {
        let lock = SpinLock::new(1);
        let guard = lock.lock();
        assert_eq!(InterruptState::current(), InterruptState::Off);
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_err());
        guard.unlock();
        assert_eq!(InterruptState::current(), InterruptState::On);
        assert!(!lock.is_locked());
    }

    #[test]
    #[should_panic(expected = "must be explicitly called")]
    fn dropping_guard_panics() {
        let lock = SpinLock::new(());
        let _guard = lock.lock();
    }
}
