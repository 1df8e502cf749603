//! Timer interrupt handler.
//!
//! Every CPU's timer interrupts into [`TimerInterruptHandler`], which hands
//! the tick to the scheduler. Note that the handler does not switch threads
//! itself, which would switch out the handler rather than the interrupted
//! thread. When a quantum runs out it asks the CPU to yield the interrupted
//! thread once the handler returns.

use super::scheduler::{Scheduler, SchedulerCore};
use crate::debug;
use machine::{cpu::Cpu, timer::InterruptHandler};
use std::sync::Weak;

/// Forwards timer interrupts to a scheduler.
pub struct TimerInterruptHandler {
    scheduler: Weak<SchedulerCore>,
}

impl TimerInterruptHandler {
    /// A handler driving `scheduler`.
    pub fn new(scheduler: Weak<SchedulerCore>) -> Self {
        Self { scheduler }
    }
}

impl InterruptHandler for TimerInterruptHandler {
    fn handle_interrupt(&self, cpu: &Cpu) {
        debug!(INTERRUPT, "timer interrupt on {}", cpu.id());
        // The scheduler is gone once its kernel is dropped.
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.timer_tick(cpu.id());
        }
    }
}
