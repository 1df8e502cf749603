mod common;

use machine::{cpu::CpuId, interrupt::InterruptGuard, registers::RET_VALUE_REG};
use nachos::{
    kernel::Kernel,
    thread::{ThreadId, ThreadStatus, feedback::Policy},
    userprog::{process::Pid, syscall::SyscallNumber},
};

const CPU0: CpuId = CpuId::BOOT;

fn boot(policy: Policy, num_cpus: usize) -> Kernel {
    common::boot(
        common::config().scheduler(policy).num_cpus(num_cpus),
        &[("prog", common::code_only(1))],
    )
}

fn two_levels() -> Policy {
    Policy::MultiLevelFeedback {
        levels: 2,
        base_quantum: 100,
    }
}

fn thread_of(kernel: &Kernel, pid: Pid) -> ThreadId {
    let processes = kernel.processes().lock();
    let thread = processes.get(pid).map(|p| p.thread);
    processes.unlock();
    thread.unwrap()
}

fn spawn(kernel: &Kernel) -> ThreadId {
    let pid = kernel.spawn_program("prog", None).unwrap();
    thread_of(kernel, pid)
}

/// A thread that gives up the CPU after 40 ticks is sampled at 40.
#[test]
fn voluntary_yield_samples_ticks_used() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    for _ in 0..4 {
        kernel.tick();
    }
    assert_eq!(kernel.scheduler().queue_object(a).unwrap().quantum_ticks_consumed, 4);
    // Nothing else is ready: the thread keeps running.
    assert_eq!(kernel.syscall(CPU0, SyscallNumber::Yield, &[]), Some(0));
    let obj = kernel.scheduler().queue_object(a).unwrap();
    assert_eq!(obj.sample, 40);
    assert_eq!(obj.quantum_ticks_consumed, 0);
    assert_eq!(kernel.current_thread(CPU0), Some(a));
}

/// A thread that keeps using its full quantum sinks and never rises.
#[test]
fn preemption_lowers_priority() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    let b = spawn(&kernel);
    assert_eq!(kernel.scheduler().level_of(b), Some(0));

    for _ in 0..9 {
        kernel.tick();
    }
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    kernel.tick();
    // The quantum of level 0 is 10 interrupts of 10 ticks.
    assert_eq!(kernel.current_thread(CPU0), Some(b));
    let obj = kernel.scheduler().queue_object(a).unwrap();
    assert_eq!(obj.sample, 200);
    assert_eq!(obj.avg_burst, 80.0);
    assert_eq!(obj.level, 0);

    for _ in 0..10 {
        kernel.tick();
    }
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    let mut levels = vec![];
    for _ in 0..10 {
        kernel.tick();
        levels.push(kernel.scheduler().queue_object(a).unwrap().level);
    }
    assert_eq!(kernel.current_thread(CPU0), Some(b));
    assert_eq!(kernel.scheduler().level_of(a), Some(1));
    assert!(levels.windows(2).all(|w| w[0] <= w[1]));
    assert!(kernel.scheduler().queue_object(a).unwrap().avg_burst > 80.0);
}

/// A quantum used up with nobody to yield to still counts against the thread.
#[test]
fn lone_thread_keeps_its_penalty() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    for _ in 0..10 {
        kernel.tick();
    }
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    let obj = kernel.scheduler().queue_object(a).unwrap();
    assert_eq!(obj.sample, 200);
    assert_eq!(obj.avg_burst, 80.0);
    assert!(!obj.preempted);

    let b = spawn(&kernel);
    kernel.tick();
    assert_eq!(kernel.syscall(CPU0, SyscallNumber::Yield, &[]), None);
    assert_eq!(kernel.current_thread(CPU0), Some(b));
    let obj = kernel.scheduler().queue_object(a).unwrap();
    assert_eq!(obj.sample, 10);
    assert_eq!(obj.avg_burst, 0.4 * 10.0 + 0.6 * 80.0);
}

/// A sleeping thread is in no ready queue until its ticks have elapsed.
#[test]
fn sleep_for_ticks() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    let b = spawn(&kernel);
    assert_eq!(kernel.syscall(CPU0, SyscallNumber::Sleep, &[25]), None);
    assert_eq!(kernel.current_thread(CPU0), Some(b));
    assert!(kernel.scheduler().is_sleeping(a));
    assert_eq!(kernel.threads().status(a), ThreadStatus::Blocked);

    for _ in 0..2 {
        kernel.tick();
        assert!(!kernel.scheduler().is_ready(a));
        assert!(kernel.scheduler().is_sleeping(a));
    }
    kernel.tick();
    assert!(!kernel.scheduler().is_sleeping(a));
    assert_eq!(kernel.scheduler().level_of(a), Some(0));
    assert_eq!(kernel.threads().status(a), ThreadStatus::Ready);
    // The sleeper resumes with the return value of the call.
    let r2 = kernel.threads().with(a, |th| th.user_registers[RET_VALUE_REG]);
    assert_eq!(r2, 0);
}

/// A sleeper whose CPU went idle is dispatched as soon as it wakes.
#[test]
fn sleeper_wakes_onto_idle_cpu() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    kernel.syscall(CPU0, SyscallNumber::Sleep, &[10]);
    assert_eq!(kernel.scheduler().idle_cpus(), vec![CPU0]);
    assert!(kernel.machine().cpu(CPU0).is_idle());
    kernel.tick();
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    assert!(kernel.scheduler().idle_cpus().is_empty());
}

/// Ready threads are spread over the idle CPUs; a freed CPU takes the next.
#[test]
fn multiple_cpus() {
    let kernel = boot(two_levels(), 2);
    let a = spawn(&kernel);
    let b = spawn(&kernel);
    let c = spawn(&kernel);
    let cpu1 = CpuId::new(1);
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    assert_eq!(kernel.current_thread(cpu1), Some(b));
    assert!(kernel.scheduler().is_ready(c));

    kernel.syscall(cpu1, SyscallNumber::Exit, &[3]);
    assert_eq!(kernel.current_thread(cpu1), Some(c));
    assert_eq!(kernel.scheduler().staged_for_destruction(), Some(b));
    assert_eq!(kernel.scheduler().cpu_of(a), Some(CPU0));
    assert!(!kernel.machine().is_halted());
}

/// Round-robin rotates the threads every quantum.
#[test]
fn round_robin_rotation() {
    let kernel = boot(Policy::RoundRobin { quantum: 30 }, 1);
    let threads: Vec<_> = (0..3).map(|_| spawn(&kernel)).collect();
    let mut order = vec![];
    for _ in 0..4 {
        order.push(kernel.current_thread(CPU0).unwrap());
        for _ in 0..3 {
            kernel.tick();
        }
    }
    assert_eq!(order, vec![threads[0], threads[1], threads[2], threads[0]]);
    assert_eq!(kernel.scheduler().ready_queue(0).len(), 2);
}

/// Timer interrupts raised while interrupts are masked are delivered later.
#[test]
fn masked_ticks_stay_pending() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    let guard = InterruptGuard::new();
    kernel.tick();
    assert!(kernel.machine().cpu(CPU0).has_pending_interrupts());
    assert_eq!(kernel.scheduler().queue_object(a).unwrap().quantum_ticks_consumed, 0);
    drop(guard);
    kernel.tick();
    assert!(!kernel.machine().cpu(CPU0).has_pending_interrupts());
    assert_eq!(kernel.scheduler().queue_object(a).unwrap().quantum_ticks_consumed, 2);
}

/// Ticks from another context leave a CPU alone while it is in the kernel;
/// its interrupts are taken once it leaves.
#[test]
fn cpu_in_the_kernel_keeps_its_thread() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    let b = spawn(&kernel);
    let cpu = kernel.machine().cpu(CPU0);
    let entry = cpu.enter_kernel();
    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            for _ in 0..10 {
                kernel.tick();
            }
        });
    })
    .unwrap();
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    assert!(cpu.has_pending_interrupts());
    assert_eq!(kernel.scheduler().queue_object(a).unwrap().quantum_ticks_consumed, 0);

    drop(entry);
    kernel.tick();
    assert!(!cpu.has_pending_interrupts());
    assert_eq!(kernel.current_thread(CPU0), Some(b));
    assert_eq!(kernel.scheduler().queue_object(a).unwrap().sample, 200);
}

/// Context switches swap the register files of the threads.
#[test]
fn switch_saves_and_restores_registers() {
    let kernel = boot(two_levels(), 1);
    let a = spawn(&kernel);
    let b = spawn(&kernel);
    let cpu = kernel.machine().cpu(CPU0);
    cpu.write_register(8, 1234);
    kernel.syscall(CPU0, SyscallNumber::Yield, &[]);
    assert_eq!(kernel.current_thread(CPU0), Some(b));
    assert_eq!(cpu.read_register(8), 0);
    assert_eq!(kernel.threads().with(a, |th| th.user_registers[8]), 1234);

    kernel.syscall(CPU0, SyscallNumber::Yield, &[]);
    assert_eq!(kernel.current_thread(CPU0), Some(a));
    assert_eq!(cpu.read_register(8), 1234);
    assert!(kernel.machine().stats().context_switches() >= 3);
}
