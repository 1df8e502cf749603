//! Thread scheduler.
//!
//! The [`SchedulerCore`] decides which thread runs on which CPU. It keeps
//!
//! - one FIFO ready queue per priority level (see [`super::feedback`]),
//! - the set of sleeping threads with their remaining ticks,
//! - a FIFO of idle CPUs,
//! - the thread running on each CPU, and
//! - at most one finished thread waiting to be destroyed.
//!
//! A thread is in exactly one of these places, or blocked on some waiter list
//! outside the scheduler. Every operation runs inside the critical section of
//! the scheduler lock, which also masks interrupts.
//!
//! ## Dispatching
//!
//! Whenever a thread becomes ready, ready threads are dispatched onto idle
//! CPUs, scanning the levels from the highest priority, until either runs
//! out. A running thread is never preempted because a thread of a higher
//! priority became ready; it keeps its CPU until it yields, blocks, finishes
//! or its quantum runs out.
//!
//! Dispatching a thread onto a CPU is a context switch: the registers and the
//! page table of the outgoing thread are saved, those of the incoming thread
//! are restored on the CPU.
//!
//! The machine is simulated: a call such as [`Scheduler::sleep_thread`]
//! returns to its caller right away, with the calling thread switched out.
//! The thread continues from the saved registers once it is dispatched again.

use super::{
    ThreadId, ThreadStatus, ThreadTable,
    feedback::{Policy, QueueObject},
    timer::TimerInterruptHandler,
};
use crate::debug;
use machine::{
    Machine,
    cpu::{Cpu, CpuId},
    interrupt::InterruptGuard,
    spinlock::{SpinLock, SpinLockGuard},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

/// A trait for a thread scheduler.
///
/// Threads and CPUs are named explicitly: the scheduler is told on which CPU
/// the calling thread runs.
pub trait Scheduler {
    /// Mark `thread` as ready and dispatch ready threads onto idle CPUs.
    fn ready_to_run(&self, thread: ThreadId);

    /// Give up the CPU `cpu` if another thread is ready.
    ///
    /// The yielding thread goes back to a ready queue. If nothing else is
    /// ready, it keeps running.
    fn yield_thread(&self, cpu: CpuId);

    /// Block the thread running on `cpu`.
    ///
    /// `to_release` is released inside the critical section of the scheduler,
    /// so that no wakeup can slip in between releasing it and blocking.
    /// Someone must call [`Scheduler::ready_to_run`] for the thread to run
    /// again.
    fn sleep_thread<T: ?Sized>(&self, cpu: CpuId, to_release: Option<SpinLockGuard<'_, T>>);

    /// Terminate the thread running on `cpu`.
    ///
    /// The thread is destroyed later, by the next thread that finishes.
    fn finish_thread(&self, cpu: CpuId);

    /// Block the thread running on `cpu` for `ticks` ticks.
    fn sleep_for(&self, cpu: CpuId, ticks: i64);

    /// Called on every timer interrupt of `cpu`.
    fn timer_tick(&self, cpu: CpuId);

    /// Stop the timers of every CPU.
    fn stop(&self);
}

struct SchedulerState {
    ready: Vec<VecDeque<ThreadId>>,
    sleeping: Vec<(ThreadId, i64)>,
    idle: VecDeque<CpuId>,
    running: Vec<Option<ThreadId>>,
    objects: Vec<Option<QueueObject>>,
    to_be_destroyed: Option<ThreadId>,
}

impl SchedulerState {
    fn object(&mut self, thread: ThreadId) -> &mut QueueObject {
        let idx = thread.into_usize();
        if idx >= self.objects.len() {
            self.objects.resize(idx + 1, None);
        }
        self.objects[idx].get_or_insert_with(|| QueueObject::new(thread))
    }

    fn pop_ready(&mut self) -> Option<ThreadId> {
        self.ready.iter_mut().find_map(VecDeque::pop_front)
    }

    fn has_ready(&self) -> bool {
        self.ready.iter().any(|q| !q.is_empty())
    }
}

/// The scheduler of a kernel.
pub struct SchedulerCore {
    policy: Policy,
    interval: u64,
    machine: Arc<Machine>,
    threads: Arc<ThreadTable>,
    state: SpinLock<SchedulerState>,
}

impl SchedulerCore {
    /// Create a scheduler with every CPU of `machine` idle.
    ///
    /// The timer handler of every CPU is set to drive the scheduler, and the
    /// timers are started.
    pub fn new(policy: Policy, machine: Arc<Machine>, threads: Arc<ThreadTable>) -> Arc<Self> {
        debug!(GENERAL, "initializing {:?} scheduler", policy);
        let interval = machine.cpu(CpuId::BOOT).timer.interval();
        let scheduler = Arc::new_cyclic(|me: &Weak<Self>| {
            for cpu in machine.cpus() {
                cpu.timer
                    .set_handler(Arc::new(TimerInterruptHandler::new(me.clone())));
            }
            Self {
                policy,
                interval,
                state: SpinLock::new(SchedulerState {
                    ready: (0..policy.levels()).map(|_| VecDeque::new()).collect(),
                    sleeping: Vec::new(),
                    idle: machine.cpus().map(Cpu::id).collect(),
                    running: vec![None; machine.num_cpus()],
                    objects: Vec::new(),
                    to_be_destroyed: None,
                }),
                machine,
                threads,
            }
        });
        for cpu in scheduler.machine.cpus() {
            cpu.timer.start();
        }
        scheduler
    }

    /// The scheduling policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn make_ready(&self, state: &mut SchedulerState, thread: ThreadId) {
        debug_assert!(InterruptGuard::is_guarded());
        let level = state.object(thread).recompute(&self.policy);
        state.ready[level].push_back(thread);
        self.threads.set_status(thread, ThreadStatus::Ready);
        debug!(READY, "putting {} on ready list {}", thread, level);
    }

    fn dispatch(&self, state: &mut SchedulerState, cpu: CpuId, thread: ThreadId) {
        debug_assert!(InterruptGuard::is_guarded());
        debug!(READY, "dispatching {} on {}", thread, cpu);
        let cpu_ref = self.machine.cpu(cpu);
        state.running[cpu.into_usize()] = Some(thread);
        state.object(thread).quantum_ticks_consumed = 0;
        self.threads.set_status(thread, ThreadStatus::Running);
        self.threads.restore_state(thread, cpu_ref);
        cpu_ref.set_idle(false);
        self.machine.stats().context_switch();
    }

    fn dispatch_idle_cpus(&self, state: &mut SchedulerState) {
        while !state.idle.is_empty() {
            let Some(thread) = state.pop_ready() else {
                break;
            };
            if let Some(cpu) = state.idle.pop_front() {
                self.dispatch(state, cpu, thread);
            }
        }
    }

    #[track_caller]
    fn switch_out(&self, state: &mut SchedulerState, cpu: CpuId) -> ThreadId {
        let Some(thread) = state.running[cpu.into_usize()].take() else {
            panic!("No thread runs on {cpu}.");
        };
        self.threads.save_state(thread, self.machine.cpu(cpu));
        state.object(thread).record_burst(self.interval);
        thread
    }

    fn relinquish(&self, state: &mut SchedulerState, cpu: CpuId) {
        match state.pop_ready() {
            Some(next) => self.dispatch(state, cpu, next),
            None => {
                debug!(READY, "{} goes idle", cpu);
                let cpu_ref = self.machine.cpu(cpu);
                cpu_ref.set_page_table(None);
                cpu_ref.set_idle(true);
                state.idle.push_back(cpu);
            }
        }
    }

    fn age_sleepers(&self, state: &mut SchedulerState) {
        let interval = self.interval as i64;
        let mut woken = Vec::new();
        state.sleeping.retain_mut(|(thread, remaining)| {
            *remaining -= interval;
            if *remaining <= 0 {
                woken.push(*thread);
                false
            } else {
                true
            }
        });
        for thread in woken {
            debug!(INTERRUPT, "waking up {}", thread);
            self.make_ready(state, thread);
        }
        self.dispatch_idle_cpus(state);
    }

    /// The thread running on `cpu`.
    pub fn running_on(&self, cpu: CpuId) -> Option<ThreadId> {
        let guard = self.state.lock();
        let thread = guard.running.get(cpu.into_usize()).copied().flatten();
        guard.unlock();
        thread
    }

    /// The CPU `thread` runs on.
    pub fn cpu_of(&self, thread: ThreadId) -> Option<CpuId> {
        let guard = self.state.lock();
        let cpu = guard
            .running
            .iter()
            .position(|t| *t == Some(thread))
            .map(CpuId::new);
        guard.unlock();
        cpu
    }

    /// Whether `thread` waits in a ready queue.
    pub fn is_ready(&self, thread: ThreadId) -> bool {
        self.level_of(thread).is_some()
    }

    /// The ready queue `thread` waits in.
    pub fn level_of(&self, thread: ThreadId) -> Option<usize> {
        let guard = self.state.lock();
        let level = guard.ready.iter().position(|q| q.contains(&thread));
        guard.unlock();
        level
    }

    /// The threads of the ready queue of `level`, in order.
    pub fn ready_queue(&self, level: usize) -> Vec<ThreadId> {
        let guard = self.state.lock();
        let queue = guard
            .ready
            .get(level)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default();
        guard.unlock();
        queue
    }

    /// Whether `thread` is in the sleep set.
    pub fn is_sleeping(&self, thread: ThreadId) -> bool {
        let guard = self.state.lock();
        let sleeping = guard.sleeping.iter().any(|(t, _)| *t == thread);
        guard.unlock();
        sleeping
    }

    /// A copy of the scheduling record of `thread`.
    pub fn queue_object(&self, thread: ThreadId) -> Option<QueueObject> {
        let guard = self.state.lock();
        let obj = guard
            .objects
            .get(thread.into_usize())
            .and_then(Option::clone);
        guard.unlock();
        obj
    }

    /// The idle CPUs, in the order they will be handed out.
    pub fn idle_cpus(&self) -> Vec<CpuId> {
        let guard = self.state.lock();
        let idle = guard.idle.iter().copied().collect();
        guard.unlock();
        idle
    }

    /// The finished thread waiting to be destroyed.
    pub fn staged_for_destruction(&self) -> Option<ThreadId> {
        let guard = self.state.lock();
        let thread = guard.to_be_destroyed;
        guard.unlock();
        thread
    }
}

impl Scheduler for SchedulerCore {
    fn ready_to_run(&self, thread: ThreadId) {
        let mut guard = self.state.lock();
        self.make_ready(&mut guard, thread);
        self.dispatch_idle_cpus(&mut guard);
        guard.unlock();
    }

    fn yield_thread(&self, cpu: CpuId) {
        let mut guard = self.state.lock();
        let Some(current) = guard.running[cpu.into_usize()] else {
            guard.unlock();
            return;
        };
        debug!(READY, "yielding {} on {}", current, cpu);
        match guard.pop_ready() {
            Some(next) => {
                self.switch_out(&mut guard, cpu);
                self.make_ready(&mut guard, current);
                debug!(READY, "switching {} from {} to {}", cpu, current, next);
                self.dispatch(&mut guard, cpu, next);
            }
            None => {
                debug!(READY, "no other thread to run, {} continuing", current);
                // The burst ends here all the same: fold it in as if the
                // thread went through the ready queue.
                let obj = guard.object(current);
                obj.record_burst(self.interval);
                obj.recompute(&self.policy);
            }
        }
        guard.unlock();
    }

    fn sleep_thread<T: ?Sized>(&self, cpu: CpuId, to_release: Option<SpinLockGuard<'_, T>>) {
        let mut guard = self.state.lock();
        if let Some(to_release) = to_release {
            to_release.unlock();
        }
        let current = self.switch_out(&mut guard, cpu);
        debug!(READY, "sleeping {}", current);
        self.threads.set_status(current, ThreadStatus::Blocked);
        self.relinquish(&mut guard, cpu);
        guard.unlock();
    }

    fn finish_thread(&self, cpu: CpuId) {
        let mut guard = self.state.lock();
        let current = self.switch_out(&mut guard, cpu);
        debug!(READY, "finishing {}", current);
        self.threads.set_status(current, ThreadStatus::Finished);
        if let Some(obj) = guard.objects.get_mut(current.into_usize()) {
            *obj = None;
        }
        if let Some(carcass) = guard.to_be_destroyed.replace(current) {
            self.threads.destroy(carcass);
        }
        self.relinquish(&mut guard, cpu);
        guard.unlock();
    }

    fn sleep_for(&self, cpu: CpuId, ticks: i64) {
        let mut guard = self.state.lock();
        let current = self.switch_out(&mut guard, cpu);
        debug!(READY, "{} sleeps for {} ticks", current, ticks);
        self.threads.set_status(current, ThreadStatus::Blocked);
        guard.sleeping.push((current, ticks));
        self.relinquish(&mut guard, cpu);
        guard.unlock();
    }

    fn timer_tick(&self, cpu: CpuId) {
        let mut guard = self.state.lock();
        if cpu == CpuId::BOOT {
            self.age_sleepers(&mut guard);
        }
        if let Some(current) = guard.running[cpu.into_usize()] {
            if guard.object(current).tick(&self.policy, self.interval) {
                debug!(INTERRUPT, "quantum of {} expired on {}", current, cpu);
                self.machine.cpu(cpu).request_yield_on_return();
            }
        }
        guard.unlock();
    }

    fn stop(&self) {
        for cpu in self.machine.cpus() {
            cpu.timer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machine::registers::Registers;

    fn setup(num_cpus: usize, policy: Policy) -> (Arc<Machine>, Arc<ThreadTable>, Arc<SchedulerCore>) {
        let machine = Arc::new(Machine::new(num_cpus, 8, 10));
        let threads = Arc::new(ThreadTable::new());
        let scheduler = SchedulerCore::new(policy, machine.clone(), threads.clone());
        (machine, threads, scheduler)
    }

    #[test]
    fn dispatch_fills_idle_cpus_in_order() {
        let (machine, threads, scheduler) = setup(2, Policy::default());
        assert_eq!(scheduler.idle_cpus(), vec![CpuId::new(0), CpuId::new(1)]);
        let a = threads.create("a", None, Registers::new());
        let b = threads.create("b", None, Registers::new());
        let c = threads.create("c", None, Registers::new());
        for t in [a, b, c] {
            scheduler.ready_to_run(t);
        }
        assert_eq!(scheduler.running_on(CpuId::new(0)), Some(a));
        assert_eq!(scheduler.running_on(CpuId::new(1)), Some(b));
        assert_eq!(scheduler.level_of(c), Some(0));
        assert!(scheduler.idle_cpus().is_empty());
        assert!(!machine.cpu(CpuId::new(0)).is_idle());
        assert_eq!(threads.status(c), ThreadStatus::Ready);
        assert_eq!(machine.stats().context_switches(), 2);
    }

    #[test]
    fn finished_threads_are_destroyed_one_behind() {
        let (_machine, threads, scheduler) = setup(1, Policy::default());
        let a = threads.create("a", None, Registers::new());
        let b = threads.create("b", None, Registers::new());
        scheduler.ready_to_run(a);
        scheduler.ready_to_run(b);
        scheduler.finish_thread(CpuId::BOOT);
        assert_eq!(scheduler.staged_for_destruction(), Some(a));
        assert!(threads.contains(a));
        assert_eq!(scheduler.running_on(CpuId::BOOT), Some(b));

        scheduler.finish_thread(CpuId::BOOT);
        assert_eq!(scheduler.staged_for_destruction(), Some(b));
        assert!(!threads.contains(a));
        assert_eq!(scheduler.idle_cpus(), vec![CpuId::BOOT]);
    }

    #[test]
    fn blocked_thread_releases_lock_and_cpu() {
        let (_machine, threads, scheduler) = setup(1, Policy::default());
        let lock = SpinLock::new(0);
        let a = threads.create("a", None, Registers::new());
        scheduler.ready_to_run(a);
        let guard = lock.lock();
        scheduler.sleep_thread(CpuId::BOOT, Some(guard));
        assert!(!lock.is_locked());
        assert_eq!(threads.status(a), ThreadStatus::Blocked);
        assert_eq!(scheduler.running_on(CpuId::BOOT), None);

        scheduler.ready_to_run(a);
        assert_eq!(scheduler.running_on(CpuId::BOOT), Some(a));
    }
}
