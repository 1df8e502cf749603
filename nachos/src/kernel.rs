//! The kernel context.
//!
//! A [`Kernel`] owns everything a running system needs: the simulated
//! machine, the frame allocator, the thread table, the scheduler, the process
//! table, the file system the programs are loaded from, and the console.
//!
//! The machine is driven from the outside. [`Kernel::tick`] advances the
//! clock by one timer interval and delivers the timer interrupts; the user
//! side of a program is played by calls such as [`Kernel::read_user`],
//! [`Kernel::write_user`] and [`Kernel::syscall`], which act on behalf of the
//! thread running on a CPU.

use crate::{
    KernelError,
    addressing::Va,
    config::SystemConfiguration,
    debug,
    fs::FileSystem,
    info,
    mm::FrameAllocator,
    thread::{
        ThreadId, ThreadTable,
        scheduler::{Scheduler, SchedulerCore},
    },
    userprog::{
        address_space::{AddressSpace, UserSpace},
        exception,
        process::{Pid, Process, ProcessTable},
        syscall::SyscallNumber,
    },
};
use machine::{
    Machine, QUITE,
    cpu::CpuId,
    exception::ExceptionType,
    kprint::set_debug_flags,
    registers::{ARG_REGS, RET_VALUE_REG, Registers},
    spinlock::SpinLock,
};
use std::sync::{Arc, atomic::Ordering};

/// A running system.
pub struct Kernel {
    config: SystemConfiguration,
    machine: Arc<Machine>,
    frames: Arc<FrameAllocator>,
    threads: Arc<ThreadTable>,
    scheduler: Arc<SchedulerCore>,
    processes: SpinLock<ProcessTable>,
    fs: Arc<dyn FileSystem>,
    console: SpinLock<String>,
}

impl Kernel {
    /// Boot a kernel configured by `config` that loads programs from `fs`.
    ///
    /// Every CPU starts idle with its timer running.
    pub fn new(config: SystemConfiguration, fs: Arc<dyn FileSystem>) -> Self {
        set_debug_flags(config.debug);
        QUITE.store(config.quite, Ordering::SeqCst);

        let machine = Arc::new(Machine::new(
            config.num_cpus,
            config.num_phys_pages,
            config.timer_interval,
        ));
        let frames = FrameAllocator::new(machine.memory().clone());
        let threads = Arc::new(ThreadTable::new());
        let scheduler = SchedulerCore::new(config.scheduler, machine.clone(), threads.clone());
        info!(
            "Nachos: {} cpu(s), {} pages of memory, {:?} paging",
            config.num_cpus, config.num_phys_pages, config.paging
        );
        Self {
            config,
            machine,
            frames,
            threads,
            scheduler,
            processes: SpinLock::new(ProcessTable::new()),
            fs,
            console: SpinLock::new(String::new()),
        }
    }

    /// The configuration the kernel was booted with.
    pub fn config(&self) -> &SystemConfiguration {
        &self.config
    }

    /// The simulated machine.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// The frame allocator.
    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    /// The thread table.
    pub fn threads(&self) -> &Arc<ThreadTable> {
        &self.threads
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Arc<SchedulerCore> {
        &self.scheduler
    }

    /// The process table.
    pub fn processes(&self) -> &SpinLock<ProcessTable> {
        &self.processes
    }

    /// The file system programs are loaded from.
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Load the executable `name` and run it in a new process.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchEntry`] when there is no such file.
    /// - [`KernelError::NoExec`] when the file is not an executable.
    /// - [`KernelError::NoMemory`] when the program does not fit in memory.
    pub fn spawn_program(&self, name: &str, parent: Option<Pid>) -> Result<Pid, KernelError> {
        let file = self.fs.open(name).ok_or(KernelError::NoSuchEntry)?;
        let space = AddressSpace::exec(file, &self.frames, self.machine.stats(), &self.config)?;
        let mut regs = Registers::new();
        space.init_registers(&mut regs);
        Ok(self.spawn(name, space, regs, parent))
    }

    /// Run a new process in `space`, starting from `regs`.
    pub fn spawn(
        &self,
        name: &str,
        space: AddressSpace,
        regs: Registers,
        parent: Option<Pid>,
    ) -> Pid {
        let space = UserSpace::new(space);
        let thread = self.threads.create(name, Some(space.clone()), regs);
        let mut processes = self.processes.lock();
        let pid = processes.insert(|pid| Process {
            pid,
            name: name.to_string(),
            thread,
            parent,
            children: Vec::new(),
            exit_status: None,
            joiners: Vec::new(),
            space: Some(space),
        });
        processes.unlock();
        debug!(GENERAL, "{} runs {} in {}", pid, name, thread);
        self.scheduler.ready_to_run(thread);
        pid
    }

    /// The thread running on `cpu`.
    pub fn current_thread(&self, cpu: CpuId) -> Option<ThreadId> {
        self.scheduler.running_on(cpu)
    }

    /// The process running on `cpu`.
    pub fn current_process(&self, cpu: CpuId) -> Option<Pid> {
        self.current(cpu).map(|(pid, _)| pid)
    }

    /// The process running on `cpu` and its address space.
    pub fn current(&self, cpu: CpuId) -> Option<(Pid, Arc<UserSpace>)> {
        let thread = self.scheduler.running_on(cpu)?;
        let processes = self.processes.lock();
        let current = processes
            .by_thread(thread)
            .and_then(|pid| processes.get(pid))
            .and_then(|p| Some((p.pid, p.space.clone()?)));
        processes.unlock();
        current
    }

    /// The program name of process `pid`.
    pub fn process_name(&self, pid: Pid) -> Option<String> {
        let processes = self.processes.lock();
        let name = processes.get(pid).map(|p| p.name.clone());
        processes.unlock();
        name
    }

    /// The exit status of process `pid`, once it exited.
    pub fn exit_status(&self, pid: Pid) -> Option<i32> {
        let processes = self.processes.lock();
        let status = processes.get(pid).and_then(|p| p.exit_status);
        processes.unlock();
        status
    }

    /// Terminate the process running on `cpu` with `status`.
    ///
    /// Its memory is released and its joiners wake up with `status`. The
    /// machine halts once no process is left.
    pub fn exit_process(&self, cpu: CpuId, status: i32) {
        let Some(thread) = self.scheduler.running_on(cpu) else {
            return;
        };
        let mut processes = self.processes.lock();
        let mut exited = None;
        if let Some(process) = processes
            .by_thread(thread)
            .and_then(|pid| processes.get_mut(pid))
        {
            process.exit_status = Some(status);
            for joiner in core::mem::take(&mut process.joiners) {
                self.threads
                    .with(joiner, |th| th.user_registers[RET_VALUE_REG] = status);
                self.scheduler.ready_to_run(joiner);
            }
            exited = Some((process.pid, process.space.take()));
        }
        let live = processes.live_count();
        processes.unlock();

        if let Some((pid, space)) = exited {
            let released = space.map_or(0, |space| space.with(|space| space.free()));
            debug!(GENERAL, "{} exits with {}, {} frames released", pid, status, released);
        }
        self.scheduler.finish_thread(cpu);
        if live == 0 {
            self.halt();
        }
    }

    /// Advance the clock by one timer interval and service the interrupts of
    /// every CPU.
    ///
    /// A thread whose quantum ran out yields on return from the interrupt.
    /// A CPU that is in the kernel, on behalf of a system call or an exception
    /// issued from another context, takes its interrupts on a later tick.
    pub fn tick(&self) {
        self.machine.advance_clock();
        for cpu in self.machine.cpus() {
            let Some(entry) = cpu.try_enter_kernel() else {
                debug!(INTERRUPT, "{} is in the kernel, interrupts stay pending", cpu.id());
                continue;
            };
            if cpu.service_interrupts() && self.scheduler.running_on(cpu.id()).is_some() {
                debug!(INTERRUPT, "yielding {} on interrupt return", cpu.id());
                self.scheduler.yield_thread(cpu.id());
            }
            drop(entry);
        }
    }

    /// Load `size` bytes at `va` on behalf of the thread running on `cpu`.
    ///
    /// A failing access raises the exception into the kernel, which kills the
    /// process, and is returned.
    pub fn read_user(&self, cpu: CpuId, va: Va, size: usize) -> Result<u32, ExceptionType> {
        let _entry = self.machine.cpu(cpu).enter_kernel();
        self.machine
            .read_mem(cpu, va, size)
            .inspect_err(|e| exception::handle_exception(self, cpu, *e))
    }

    /// Store `size` bytes of `value` at `va` on behalf of the thread running
    /// on `cpu`.
    pub fn write_user(
        &self,
        cpu: CpuId,
        va: Va,
        size: usize,
        value: u32,
    ) -> Result<(), ExceptionType> {
        let _entry = self.machine.cpu(cpu).enter_kernel();
        self.machine
            .write_mem(cpu, va, size, value)
            .inspect_err(|e| exception::handle_exception(self, cpu, *e))
    }

    /// Issue system call `sysno` with `args` on behalf of the thread running
    /// on `cpu`.
    ///
    /// Returns the value of `r2` if the calling thread still runs on `cpu`
    /// once the call is done.
    pub fn syscall(&self, cpu: CpuId, sysno: SyscallNumber, args: &[i32]) -> Option<i32> {
        let cpu_ref = self.machine.cpu(cpu);
        let _entry = cpu_ref.enter_kernel();
        let caller = self.scheduler.running_on(cpu)?;
        cpu_ref.write_register(RET_VALUE_REG, sysno as i32);
        for (reg, arg) in ARG_REGS.iter().zip(args) {
            cpu_ref.write_register(*reg, *arg);
        }
        exception::handle_exception(self, cpu, ExceptionType::Syscall);
        (self.scheduler.running_on(cpu) == Some(caller))
            .then(|| cpu_ref.read_register(RET_VALUE_REG))
    }

    /// Handle exception `which` raised on `cpu`.
    ///
    /// The thread running on `cpu` stays there until the kernel is done with
    /// it: a concurrent [`Kernel::tick`] does not switch it out.
    pub fn handle_exception(&self, cpu: CpuId, which: ExceptionType) {
        let _entry = self.machine.cpu(cpu).enter_kernel();
        exception::handle_exception(self, cpu, which)
    }

    /// Append `text` to the console.
    pub fn write_console(&self, text: &str) {
        let mut console = self.console.lock();
        console.push_str(text);
        console.unlock();
        crate::print!("{}", text);
    }

    /// Everything written to the console so far.
    pub fn console_output(&self) -> String {
        let console = self.console.lock();
        let output = console.clone();
        console.unlock();
        output
    }

    /// Stop the machine.
    pub fn halt(&self) {
        self.scheduler.stop();
        self.machine.halt();
        info!("Machine halting!");
        info!("{}", self.machine.stats());
    }
}
