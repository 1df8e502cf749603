//! Thread abstraction.
//!
//! ## The threading model
//!
//! Every user program runs in one kernel thread. A thread owns a copy of the
//! user register file, saved when the thread leaves a CPU and restored when it
//! is dispatched again, and a reference to the address space it runs in.
//!
//! Threads live in a [`ThreadTable`], an arena indexed by [`ThreadId`]. The
//! [`scheduler`] refers to threads only by id. A finished thread stays in the
//! table until the scheduler destroys it.
//!
//! A thread moves through the following states:
//!
//! ```text
//! JustCreated -> Ready <-> Running -> Finished
//!                  ^          |
//!                  +-Blocked<-+
//! ```
pub mod feedback;
pub mod scheduler;
pub mod timer;

use crate::userprog::address_space::UserSpace;
use machine::{cpu::Cpu, registers::Registers, spinlock::SpinLock};
use std::sync::Arc;

/// Identifier of a thread.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ThreadId(usize);

impl ThreadId {
    /// Cast into a raw index.
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tid{}", self.0)
    }
}

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadStatus {
    /// Created but never made ready.
    JustCreated,
    /// Waiting in a ready queue.
    Ready,
    /// Running on a CPU.
    Running,
    /// Waiting for an event.
    Blocked,
    /// Done; waiting to be destroyed.
    Finished,
}

/// A thread.
pub struct Thread {
    /// Thread id.
    pub tid: ThreadId,
    /// Thread name.
    pub name: String,
    /// State of the thread.
    pub status: ThreadStatus,
    /// User registers, valid while the thread is off the CPU.
    pub user_registers: Registers,
    /// The address space the thread runs in.
    pub space: Option<Arc<UserSpace>>,
}

impl Thread {
    /// Save the user state of the thread from `cpu`.
    pub fn save_state(&mut self, cpu: &Cpu) {
        self.user_registers = cpu.registers();
        if let Some(space) = &self.space {
            space.save_state();
        }
    }

    /// Load the user state of the thread into `cpu`.
    pub fn restore_state(&self, cpu: &Cpu) {
        cpu.set_registers(&self.user_registers);
        match &self.space {
            Some(space) => space.restore_state(cpu),
            None => cpu.set_page_table(None),
        }
    }
}

/// The arena of every thread of a kernel.
///
/// Ids are never reused. Looking up an id that was never handed out, or
/// whose thread was destroyed, is a kernel bug and panics.
#[derive(Default)]
pub struct ThreadTable {
    threads: SpinLock<Vec<Option<Thread>>>,
}

impl ThreadTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a thread named `name` that runs in `space` from `registers`.
    pub fn create(
        &self,
        name: &str,
        space: Option<Arc<UserSpace>>,
        registers: Registers,
    ) -> ThreadId {
        let mut guard = self.threads.lock();
        let tid = ThreadId(guard.len());
        guard.push(Some(Thread {
            tid,
            name: name.to_string(),
            status: ThreadStatus::JustCreated,
            user_registers: registers,
            space,
        }));
        guard.unlock();
        crate::debug!(THREAD, "created {} ({})", tid, name);
        tid
    }

    /// Run `f` on thread `tid`.
    #[track_caller]
    pub fn with<R>(&self, tid: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> R {
        let mut guard = self.threads.lock();
        let Some(Some(thread)) = guard.get_mut(tid.0) else {
            guard.unlock();
            panic!("Unknown thread {tid}.");
        };
        let r = f(thread);
        guard.unlock();
        r
    }

    /// Whether thread `tid` exists.
    pub fn contains(&self, tid: ThreadId) -> bool {
        let guard = self.threads.lock();
        let exists = matches!(guard.get(tid.0), Some(Some(_)));
        guard.unlock();
        exists
    }

    /// State of thread `tid`.
    pub fn status(&self, tid: ThreadId) -> ThreadStatus {
        self.with(tid, |th| th.status)
    }

    /// Change the state of thread `tid`.
    pub fn set_status(&self, tid: ThreadId, status: ThreadStatus) {
        self.with(tid, |th| th.status = status)
    }

    /// Name of thread `tid`.
    pub fn name(&self, tid: ThreadId) -> String {
        self.with(tid, |th| th.name.clone())
    }

    /// Save the user state of thread `tid` from `cpu`.
    pub fn save_state(&self, tid: ThreadId, cpu: &Cpu) {
        self.with(tid, |th| th.save_state(cpu))
    }

    /// Load the user state of thread `tid` into `cpu`.
    pub fn restore_state(&self, tid: ThreadId, cpu: &Cpu) {
        self.with(tid, |th| th.restore_state(cpu))
    }

    /// Remove the finished thread `tid` from the table.
    ///
    /// The thread is dropped after the table is unlocked.
    #[track_caller]
    pub fn destroy(&self, tid: ThreadId) {
        let mut guard = self.threads.lock();
        let thread = guard.get_mut(tid.0).and_then(Option::take);
        guard.unlock();
        match thread {
            Some(thread) => {
                assert_eq!(
                    thread.status,
                    ThreadStatus::Finished,
                    "Destroying {} that is not finished.",
                    tid
                );
                crate::debug!(THREAD, "destroyed {} ({})", tid, thread.name);
            }
            None => panic!("Unknown thread {tid}."),
        }
    }

    /// Number of threads in the table.
    pub fn len(&self) -> usize {
        let guard = self.threads.lock();
        let len = guard.iter().filter(|th| th.is_some()).count();
        guard.unlock();
        len
    }

    /// Whether the table holds no thread.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_removes_finished_thread() {
        let table = ThreadTable::new();
        let a = table.create("a", None, Registers::new());
        let b = table.create("b", None, Registers::new());
        assert_ne!(a, b);
        assert_eq!(table.status(a), ThreadStatus::JustCreated);
        table.set_status(a, ThreadStatus::Finished);
        table.destroy(a);
        assert!(!table.contains(a));
        assert!(table.contains(b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    #[should_panic]
    fn unknown_thread_panics() {
        let table = ThreadTable::new();
        let a = table.create("a", None, Registers::new());
        table.set_status(a, ThreadStatus::Finished);
        table.destroy(a);
        table.status(a);
    }
}
