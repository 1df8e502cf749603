//! # Multi-level feedback.
//!
//! The scheduler keeps one FIFO ready queue per priority level. Level 0 has
//! the highest priority and the shortest quantum; the quantum doubles with
//! every level:
//!
//! ```text
//! quantum(i) = 2^i * base_quantum
//! ```
//!
//! A thread is placed on the first level whose quantum covers its average CPU
//! burst. The average is an exponential moving average of the observed bursts,
//! recomputed every time the thread is made ready:
//!
//! ```text
//! average' = 0.4 * sample + 0.6 * average
//! ```
//!
//! The sample is the CPU time the thread used when it left the CPU on its own
//! before its quantum expired. When the timer preempts the thread instead, the
//! sample is twice the quantum of its level, which pushes interactive threads
//! up and CPU-bound threads down.
//!
//! Round-robin is the degenerate policy with a single level and a fixed
//! quantum.

use super::ThreadId;

/// A scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Multi-level feedback queues.
    MultiLevelFeedback {
        /// Number of priority levels.
        levels: usize,
        /// Quantum of level 0, in ticks.
        base_quantum: u64,
    },
    /// A single FIFO queue with a fixed quantum.
    RoundRobin {
        /// Quantum, in ticks.
        quantum: u64,
    },
}

impl Default for Policy {
    fn default() -> Self {
        Policy::MultiLevelFeedback {
            levels: 5,
            base_quantum: 100,
        }
    }
}

impl Policy {
    /// Number of priority levels.
    pub fn levels(&self) -> usize {
        match self {
            Policy::MultiLevelFeedback { levels, .. } => *levels,
            Policy::RoundRobin { .. } => 1,
        }
    }

    /// Quantum of `level`, in ticks.
    pub fn quantum_of(&self, level: usize) -> u64 {
        match self {
            Policy::MultiLevelFeedback { base_quantum, .. } => base_quantum << level,
            Policy::RoundRobin { quantum } => *quantum,
        }
    }

    /// The level of a thread whose average burst is `average`.
    pub fn level_for(&self, average: f64) -> usize {
        let levels = self.levels();
        (0..levels)
            .find(|level| self.quantum_of(*level) as f64 >= average)
            .unwrap_or(levels - 1)
    }

    /// Number of timer interrupts that make up the quantum of `level`.
    pub fn interrupts_per_quantum(&self, level: usize, interval: u64) -> u32 {
        (self.quantum_of(level) / interval).max(1) as u32
    }
}

/// The scheduling record of a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueObject {
    /// The thread.
    pub thread: ThreadId,
    /// The level whose queue the thread was last placed on.
    pub level: usize,
    /// The last observed CPU burst, in ticks.
    pub sample: i64,
    /// Moving average of the CPU bursts, in ticks.
    pub avg_burst: f64,
    /// Timer interrupts taken since the thread got the CPU.
    pub quantum_ticks_consumed: u32,
    /// The timer took the CPU away; `sample` already holds the penalty.
    pub preempted: bool,
}

impl QueueObject {
    /// A record for a thread never seen running.
    pub fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            level: 0,
            sample: 0,
            avg_burst: 0.0,
            quantum_ticks_consumed: 0,
            preempted: false,
        }
    }

    /// Fold the last sample into the average and pick the level.
    pub fn recompute(&mut self, policy: &Policy) -> usize {
        self.avg_burst = 0.4 * self.sample as f64 + 0.6 * self.avg_burst;
        self.level = policy.level_for(self.avg_burst);
        self.level
    }

    /// Account one timer interrupt. Returns whether the quantum ran out.
    ///
    /// When it did, the sample becomes twice the quantum of the current level.
    pub fn tick(&mut self, policy: &Policy, interval: u64) -> bool {
        self.quantum_ticks_consumed += 1;
        if self.quantum_ticks_consumed < policy.interrupts_per_quantum(self.level, interval) {
            return false;
        }
        self.quantum_ticks_consumed = 0;
        self.sample = 2 * policy.quantum_of(self.level) as i64;
        self.preempted = true;
        true
    }

    /// The thread leaves the CPU. Ends the current burst.
    ///
    /// A burst cut short by the thread itself is sampled as the time it used.
    pub fn record_burst(&mut self, interval: u64) {
        if !self.preempted {
            self.sample = self.quantum_ticks_consumed as i64 * interval as i64;
        }
        self.preempted = false;
        self.quantum_ticks_consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MLF: Policy = Policy::MultiLevelFeedback {
        levels: 3,
        base_quantum: 100,
    };

    #[test]
    fn level_covers_average_burst() {
        assert_eq!(MLF.quantum_of(2), 400);
        assert_eq!(MLF.level_for(0.0), 0);
        assert_eq!(MLF.level_for(99.5), 0);
        assert_eq!(MLF.level_for(100.0), 0);
        assert_eq!(MLF.level_for(150.0), 1);
        assert_eq!(MLF.level_for(10_000.0), 2);
        let rr = Policy::RoundRobin { quantum: 30 };
        assert_eq!(rr.level_for(10_000.0), 0);
        assert_eq!(rr.interrupts_per_quantum(0, 100), 1);
    }

    #[test]
    fn voluntary_and_preempted_bursts() {
        let mut obj = QueueObject::new(ThreadId(0));
        for _ in 0..4 {
            assert!(!obj.tick(&MLF, 10));
        }
        obj.record_burst(10);
        assert_eq!(obj.sample, 40);
        assert_eq!(obj.recompute(&MLF), 0);
        assert_eq!(obj.avg_burst, 16.0);

        let before = obj.avg_burst;
        let preempted = (0..10).map(|_| obj.tick(&MLF, 10)).filter(|p| *p).count();
        assert_eq!(preempted, 1);
        obj.record_burst(10);
        assert_eq!(obj.sample, 200);
        obj.recompute(&MLF);
        assert!(obj.avg_burst > before);
    }
}
