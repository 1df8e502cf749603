//! Performance counters of the machine.

use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// Counters updated by the machine and by the kernel.
#[derive(Default)]
pub struct Statistics {
    total_ticks: CachePadded<AtomicU64>,
    page_faults: CachePadded<AtomicU64>,
    context_switches: CachePadded<AtomicU64>,
}

impl Statistics {
    /// Account `ticks` ticks of simulated time.
    pub fn add_ticks(&self, ticks: u64) {
        self.total_ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Account a demand page fault.
    pub fn page_fault(&self) {
        self.page_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a context switch.
    pub fn context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Simulated time elapsed, in ticks.
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks.load(Ordering::Relaxed)
    }

    /// Number of demand page faults.
    pub fn page_faults(&self) -> u64 {
        self.page_faults.load(Ordering::Relaxed)
    }

    /// Number of context switches.
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }
}

impl core::fmt::Display for Statistics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Ticks: total {}, Paging: faults {}, Scheduling: switches {}",
            self.total_ticks(),
            self.page_faults(),
            self.context_switches()
        )
    }
}
