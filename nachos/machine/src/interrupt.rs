//! Interrupt masking.
//!
//! Each host thread that drives the simulation plays the role of one CPU
//! context and carries its own interrupt flag. Masking interrupts in a context
//! keeps raised interrupts pending on the CPU until the context unmasks them
//! and services the CPU again.
#[cfg(doc)]
use crate::spinlock::SpinLockGuard;
use core::{cell::Cell, marker::PhantomData};

thread_local! {
    static PER_CONTEXT_STATE: InterruptGuardInner = const { InterruptGuardInner::new() };
}

struct InterruptGuardInner {
    enabled: Cell<bool>,
    initial_state: Cell<bool>,
    cnt: Cell<isize>,
}

impl InterruptGuardInner {
    const fn new() -> Self {
        Self {
            enabled: Cell::new(true),
            initial_state: Cell::new(true),
            cnt: Cell::new(0),
        }
    }

    fn save_nested_interrupt_state(&self, state: InterruptState) {
        let prev = self.cnt.get();
        self.cnt.set(prev + 1);
        if prev == 0 {
            self.initial_state.set(state == InterruptState::On);
        }
    }

    fn load_nested_interrupt_state(&self) {
        let prev = self.cnt.get();
        assert!(prev > 0, "InterruptGuard dropped more often than taken.");
        self.cnt.set(prev - 1);

        if prev == 1 && self.initial_state.get() {
            self.enabled.set(true);
        }
    }
}

/// Whether the current context accepts interrupts.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Pending interrupts are delivered.
    On,
    /// Pending interrupts wait.
    Off,
}

impl InterruptState {
    /// The state of the calling context.
    pub fn current() -> Self {
        if PER_CONTEXT_STATE.with(|s| s.enabled.get()) {
            Self::On
        } else {
            Self::Off
        }
    }

    fn disable() {
        PER_CONTEXT_STATE.with(|s| s.enabled.set(false));
    }
}

/// Masks interrupts in the current context while it lives.
///
/// Guards nest: interrupts come back on when the last guard of the context
/// goes away, and only if they were on when the first one was taken. A guard
/// is usually held inside a [`SpinLockGuard`].
///
/// A guard is tied to the context that took it and is not `Send`.
pub struct InterruptGuard {
    _context: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Mask interrupts until the guard is dropped.
    ///
    /// ```rust
    /// use machine::interrupt::{InterruptGuard, InterruptState};
    ///
    /// let guard = InterruptGuard::new();
    /// assert_eq!(InterruptState::current(), InterruptState::Off);
    /// drop(guard);
    /// assert_eq!(InterruptState::current(), InterruptState::On);
    /// ```
    pub fn new() -> Self {
        let state = InterruptState::current();
        InterruptState::disable();
        PER_CONTEXT_STATE.with(|s| s.save_nested_interrupt_state(state));

        Self {
            _context: PhantomData,
        }
    }

    /// Whether the current context holds any [`InterruptGuard`].
    pub fn is_guarded() -> bool {
        PER_CONTEXT_STATE.with(|s| s.cnt.get() > 0)
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        PER_CONTEXT_STATE.with(|s| s.load_nested_interrupt_state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_restore_on_last_drop() {
        assert_eq!(InterruptState::current(), InterruptState::On);
        let outer = InterruptGuard::new();
        let inner = InterruptGuard::new();
        assert_eq!(InterruptState::current(), InterruptState::Off);
        drop(inner);
        assert_eq!(InterruptState::current(), InterruptState::Off);
        assert!(InterruptGuard::is_guarded());
        drop(outer);
        assert_eq!(InterruptState::current(), InterruptState::On);
        assert!(!InterruptGuard::is_guarded());
    }

    #[test]
    fn guard_is_per_context() {
        let _guard = InterruptGuard::new();
        let other = std::thread::spawn(InterruptState::current)
            .join()
            .unwrap();
        assert_eq!(other, InterruptState::On);
        assert_eq!(InterruptState::current(), InterruptState::Off);
    }
}
