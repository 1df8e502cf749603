//! Per-CPU periodic timer.
//!
//! A running timer raises a timer interrupt on its CPU every time the machine
//! clock advances by one interval. The kernel installs an
//! [`InterruptHandler`] that runs when the CPU services the interrupt.

use crate::cpu::Cpu;
use crate::spinlock::SpinLock;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default number of ticks between two timer interrupts.
pub const DEFAULT_INTERVAL: u64 = 100;

/// Handler of a hardware interrupt.
pub trait InterruptHandler: Send + Sync {
    /// Handle an interrupt delivered to `cpu`.
    ///
    /// Called with interrupts masked in the current context.
    fn handle_interrupt(&self, cpu: &Cpu);
}

/// A periodic timer device.
pub struct Timer {
    interval: u64,
    running: AtomicBool,
    handler: SpinLock<Option<Arc<dyn InterruptHandler>>>,
}

impl Timer {
    /// A stopped timer firing every `interval` ticks.
    pub fn new(interval: u64) -> Self {
        assert!(interval > 0, "Timer interval must be positive.");
        Self {
            interval,
            running: AtomicBool::new(false),
            handler: SpinLock::new(None),
        }
    }

    /// Install the handler that runs on each timer interrupt.
    pub fn set_handler(&self, handler: Arc<dyn InterruptHandler>) {
        let mut guard = self.handler.lock();
        *guard = Some(handler);
        guard.unlock();
    }

    /// The installed handler, if any.
    pub fn handler(&self) -> Option<Arc<dyn InterruptHandler>> {
        let guard = self.handler.lock();
        let handler = guard.clone();
        guard.unlock();
        handler
    }

    /// Start raising interrupts.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop raising interrupts.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the timer raises interrupts.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ticks between two interrupts.
    pub fn interval(&self) -> u64 {
        self.interval
    }
}
