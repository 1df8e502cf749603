//! Processes.
//!
//! A process is a running user program: one user thread executing in one
//! address space. Processes form a tree through [`Process::parent`] and
//! [`Process::children`]; a parent may wait for a child with the `Join`
//! system call.
//!
//! A process that exited stays in the [`ProcessTable`] with its exit status,
//! so that a later `Join` can still collect it. Its memory is gone by then.

use super::address_space::UserSpace;
use crate::thread::ThreadId;
use std::{collections::BTreeMap, sync::Arc};

/// Identifier of a process.
///
/// Process ids are handed out from 0 in creation order and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Pid(i32);

impl Pid {
    /// The first process.
    pub const INIT: Pid = Pid(0);

    /// Create a pid from its raw value.
    pub const fn new(pid: i32) -> Self {
        Self(pid)
    }

    /// Cast into the raw value.
    pub const fn into_i32(self) -> i32 {
        self.0
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

/// A user process.
pub struct Process {
    /// Process id.
    pub pid: Pid,
    /// Name of the program.
    pub name: String,
    /// The user thread.
    pub thread: ThreadId,
    /// The process that created this one.
    pub parent: Option<Pid>,
    /// Processes created by this one.
    pub children: Vec<Pid>,
    /// Exit status, once the process exited.
    pub exit_status: Option<i32>,
    /// Threads blocked in `Join` on this process.
    pub joiners: Vec<ThreadId>,
    /// The address space. Dropped when the process exits.
    pub space: Option<Arc<UserSpace>>,
}

impl Process {
    /// Whether the process exited.
    pub fn is_exited(&self) -> bool {
        self.exit_status.is_some()
    }
}

/// Every process of a kernel.
#[derive(Default)]
pub struct ProcessTable {
    processes: BTreeMap<Pid, Process>,
    next_pid: i32,
}

impl ProcessTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process built by `f` from a fresh pid.
    ///
    /// The process becomes a child of its parent.
    pub fn insert(&mut self, f: impl FnOnce(Pid) -> Process) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        let process = f(pid);
        if let Some(parent) = process.parent.and_then(|ppid| self.processes.get_mut(&ppid)) {
            parent.children.push(pid);
        }
        self.processes.insert(pid, process);
        pid
    }

    /// The process `pid`.
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// The process `pid`, mutably.
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// The live process whose user thread is `thread`.
    pub fn by_thread(&self, thread: ThreadId) -> Option<Pid> {
        self.processes
            .values()
            .find(|p| p.thread == thread && !p.is_exited())
            .map(|p| p.pid)
    }

    /// Number of processes that did not exit.
    pub fn live_count(&self) -> usize {
        self.processes.values().filter(|p| !p.is_exited()).count()
    }

    /// Number of processes ever created.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether no process was ever created.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
