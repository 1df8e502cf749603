//! System calls.
//!
//! A user program asks the kernel for a service by loading the system call
//! number into `r2`, up to four arguments into `r4` to `r7`, and executing
//! `syscall`. The CPU then raises [`ExceptionType::Syscall`] and the kernel
//! lands in [`dispatch`].
//!
//! The kernel answers in `r2`: a non-negative value on success, or a negative
//! errno ([`KernelError::into_i32`]) on failure. Before the call is carried
//! out the program counter is moved past the `syscall` instruction, so that
//! the program resumes after it.
//!
//! | No. | Call | Arguments |
//! |---|---|---|
//! | 0 | `Halt` | |
//! | 1 | `Exit` | status |
//! | 2 | `Exec` | name |
//! | 3 | `Join` | pid |
//! | 4 | `Create` | name |
//! | 5 | `Open` | name |
//! | 6 | `Read` | buffer, size, fd |
//! | 7 | `Write` | buffer, size, fd |
//! | 8 | `Close` | fd |
//! | 9 | `Fork` | function address |
//! | 10 | `Yield` | |
//! | 11 | `Remove` | name |
//! | 12 | `Sleep` | ticks |
//! | 13 | `Mkdir` | name |
//! | 14 | `Rmdir` | name |
//! | 15 | `Mmap` | name, size pointer |
//! | 16 | `Munmap` | address |
//!
//! [`ExceptionType::Syscall`]: machine::exception::ExceptionType::Syscall

use super::{address_space::UserSpace, process::Pid};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    debug,
    kernel::Kernel,
    thread::scheduler::Scheduler,
};
use machine::{
    cpu::{Cpu, CpuId},
    registers::{ARG_REGS, RET_VALUE_REG, Registers},
};
use num_enum::TryFromPrimitive;

/// Longest file name a program may pass, without the terminating NUL.
pub const MAX_NAME_LEN: usize = 255;

/// Console output file descriptor.
pub const CONSOLE_OUTPUT: i32 = 1;

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SyscallNumber {
    /// Stop the machine.
    Halt = 0,
    /// Terminate the calling process.
    Exit = 1,
    /// Run a program in a new process.
    Exec = 2,
    /// Wait for a child process to exit.
    Join = 3,
    /// Create a file.
    Create = 4,
    /// Open a file.
    Open = 5,
    /// Read from a file.
    Read = 6,
    /// Write to a file.
    Write = 7,
    /// Close a file.
    Close = 8,
    /// Duplicate the calling process.
    Fork = 9,
    /// Give up the CPU.
    Yield = 10,
    /// Remove a file.
    Remove = 11,
    /// Block for a number of ticks.
    Sleep = 12,
    /// Create a directory.
    Mkdir = 13,
    /// Remove a directory.
    Rmdir = 14,
    /// Map a file into memory.
    Mmap = 15,
    /// Unmap a memory-mapped file.
    Munmap = 16,
}

/// The registers of a pending system call.
///
/// The call number is in `r2` and the arguments in `r4` to `r7`.
pub struct SyscallAbi<'a> {
    /// Raw call number.
    pub sysno: u32,
    /// `r4`.
    pub arg1: i32,
    /// `r5`.
    pub arg2: i32,
    /// `r6`.
    pub arg3: i32,
    /// `r7`.
    pub arg4: i32,
    /// The CPU the call was issued on.
    pub cpu: &'a Cpu,
}

impl<'a> SyscallAbi<'a> {
    /// Constructs a [`SyscallAbi`] from the registers of `cpu`.
    pub fn from_cpu(cpu: &'a Cpu) -> Self {
        let regs = cpu.registers();
        Self {
            sysno: regs[RET_VALUE_REG] as u32,
            arg1: regs[ARG_REGS[0]],
            arg2: regs[ARG_REGS[1]],
            arg3: regs[ARG_REGS[2]],
            arg4: regs[ARG_REGS[3]],
            cpu,
        }
    }

    /// Store the outcome of the call.
    ///
    /// `r2` gets the value on success, or the negative errno of the error.
    pub fn set_return_value(self, return_val: Result<i32, KernelError>) {
        let value = return_val.unwrap_or_else(KernelError::into_i32);
        self.cpu.write_register(RET_VALUE_REG, value);
    }

    fn advance_pc(&self) {
        let mut regs = self.cpu.registers();
        regs.advance_pc();
        self.cpu.set_registers(&regs);
    }
}

/// Carry out the system call issued on `cpu`.
pub fn dispatch(kernel: &Kernel, cpu: CpuId) {
    let abi = SyscallAbi::from_cpu(kernel.machine().cpu(cpu));
    abi.advance_pc();
    let Some((pid, space)) = kernel.current(cpu) else {
        abi.set_return_value(Err(KernelError::OperationNotPermitted));
        return;
    };
    debug!(SYSCALL, "{} on {}: syscall {}", pid, cpu, abi.sysno);

    let return_val = match SyscallNumber::try_from(abi.sysno) {
        Ok(SyscallNumber::Halt) => halt(kernel, pid),
        Ok(SyscallNumber::Exec) => exec(kernel, pid, &space, &abi),
        Ok(SyscallNumber::Fork) => fork(kernel, pid, &space, &abi),
        Ok(SyscallNumber::Write) => write(kernel, &space, &abi),
        Ok(SyscallNumber::Mmap) => mmap(kernel, &space, &abi),
        Ok(SyscallNumber::Munmap) => munmap(&space, &abi),
        Ok(
            SyscallNumber::Create
            | SyscallNumber::Open
            | SyscallNumber::Read
            | SyscallNumber::Close
            | SyscallNumber::Remove
            | SyscallNumber::Mkdir
            | SyscallNumber::Rmdir,
        ) => Err(KernelError::NotSupportedOperation),
        // These give up the CPU. The return value is set while the caller
        // still owns it.
        Ok(SyscallNumber::Exit) => return kernel.exit_process(cpu, abi.arg1),
        Ok(SyscallNumber::Join) => return join(kernel, pid, abi),
        Ok(SyscallNumber::Yield) => {
            abi.set_return_value(Ok(0));
            return kernel.scheduler().yield_thread(cpu);
        }
        Ok(SyscallNumber::Sleep) => {
            let ticks = abi.arg1 as i64;
            abi.set_return_value(Ok(0));
            return kernel.scheduler().sleep_for(cpu, ticks);
        }
        Err(_) => Err(KernelError::NoSuchSyscall),
    };
    debug!(SYSCALL, "{} syscall {} returns {:?}", pid, abi.sysno, return_val);
    abi.set_return_value(return_val);
}

/// Read the NUL-terminated string at `va`.
pub fn read_user_string(space: &UserSpace, va: Va) -> Result<String, KernelError> {
    space.with(|space| {
        let mut bytes = Vec::new();
        loop {
            let mut byte = [0];
            space.read_virtual_memory(va + bytes.len(), &mut byte)?;
            match byte[0] {
                0 => break,
                _ if bytes.len() == MAX_NAME_LEN => return Err(KernelError::NameTooLong),
                b => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
    })
}

fn user_va(addr: i32) -> Result<Va, KernelError> {
    usize::try_from(addr)
        .map(Va::new)
        .map_err(|_| KernelError::BadAddress)
}

fn halt(kernel: &Kernel, pid: Pid) -> Result<i32, KernelError> {
    if pid != Pid::INIT {
        return Err(KernelError::OperationNotPermitted);
    }
    kernel.halt();
    Ok(0)
}

fn exec(
    kernel: &Kernel,
    pid: Pid,
    space: &UserSpace,
    abi: &SyscallAbi,
) -> Result<i32, KernelError> {
    let name = read_user_string(space, user_va(abi.arg1)?)?;
    kernel
        .spawn_program(&name, Some(pid))
        .map(Pid::into_i32)
}

fn fork(
    kernel: &Kernel,
    pid: Pid,
    space: &UserSpace,
    abi: &SyscallAbi,
) -> Result<i32, KernelError> {
    let func = user_va(abi.arg1)?;
    let next = abi.arg1.checked_add(4).ok_or(KernelError::BadAddress)?;
    let child = space.with(|space| space.clone_for_fork(kernel.config().fork))?;
    let mut regs = Registers::new();
    child.init_registers(&mut regs);
    *regs.pc() = abi.arg1;
    *regs.next_pc() = next;
    let name = kernel.process_name(pid).unwrap_or_default();
    debug!(FORK, "{} forks at {:?}", pid, func);
    Ok(kernel.spawn(&name, child, regs, Some(pid)).into_i32())
}

fn join(kernel: &Kernel, pid: Pid, abi: SyscallAbi) {
    let target = Pid::new(abi.arg1);
    let mut processes = kernel.processes().lock();
    let caller = processes.get(pid).map(|p| p.thread);
    let lookup = match (caller, processes.get(target)) {
        (Some(thread), Some(child)) if child.parent == Some(pid) => {
            Ok((thread, child.exit_status))
        }
        _ => Err(KernelError::NoSuchEntry),
    };
    match lookup {
        Err(e) => {
            processes.unlock();
            debug!(JOIN, "{} is not a child of {}", target, pid);
            abi.set_return_value(Err(e));
        }
        Ok((_, Some(status))) => {
            processes.unlock();
            debug!(JOIN, "{} already exited with {}", target, status);
            abi.set_return_value(Ok(status));
        }
        Ok((thread, None)) => {
            if let Some(child) = processes.get_mut(target) {
                child.joiners.push(thread);
            }
            debug!(JOIN, "{} waits for {}", pid, target);
            // The exit of the child sets the return value.
            kernel.scheduler().sleep_thread(abi.cpu.id(), Some(processes));
        }
    }
}

fn write(kernel: &Kernel, space: &UserSpace, abi: &SyscallAbi) -> Result<i32, KernelError> {
    let (buf, size, fd) = (user_va(abi.arg1)?, abi.arg2, abi.arg3);
    if fd != CONSOLE_OUTPUT {
        return Err(KernelError::BadFileDescriptor);
    }
    let size = usize::try_from(size).map_err(|_| KernelError::InvalidArgument)?;
    // Page by page: the buffer only grows as far as the user memory goes.
    let mut bytes = Vec::new();
    space.with(|space| {
        let mut chunk = [0; PAGE_SIZE];
        while bytes.len() < size {
            let len = (size - bytes.len()).min(PAGE_SIZE);
            space.read_virtual_memory(buf + bytes.len(), &mut chunk[..len])?;
            bytes.extend_from_slice(&chunk[..len]);
        }
        Ok::<_, KernelError>(())
    })?;
    kernel.write_console(&String::from_utf8_lossy(&bytes));
    Ok(size as i32)
}

fn mmap(kernel: &Kernel, space: &UserSpace, abi: &SyscallAbi) -> Result<i32, KernelError> {
    let name = read_user_string(space, user_va(abi.arg1)?)?;
    let size_ptr = user_va(abi.arg2)?;
    let file = kernel.fs().open(&name).ok_or(KernelError::NoSuchEntry)?;
    space.with(|space| {
        let (start, size) = space.map_file(&name, file)?;
        if let Err(e) = space.write_virtual_memory(size_ptr, &(size as i32).to_le_bytes()) {
            // Leave nothing mapped behind a failed call.
            space.unmap(start)?;
            return Err(e.into());
        }
        Ok(start.into_usize() as i32)
    })
}

fn munmap(space: &UserSpace, abi: &SyscallAbi) -> Result<i32, KernelError> {
    let addr = user_va(abi.arg1)?;
    space
        .with(|space| space.unmap(addr))
        .map(|released| released as i32)
}
