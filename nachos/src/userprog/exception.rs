//! User exceptions.
//!
//! A user program enters the kernel through an exception. A
//! [`ExceptionType::Syscall`] is a request for service and goes to the
//! system call dispatcher. Any other exception is a fault of the program:
//! the process is killed with exit status [`FAULT_STATUS`], and the kernel
//! carries on.

use super::syscall;
use crate::{kernel::Kernel, warning};
use machine::{cpu::CpuId, exception::ExceptionType, registers::PC_REG};

/// Exit status of a process killed by a fault.
pub const FAULT_STATUS: i32 = -1;

/// Handle exception `which` raised by the thread running on `cpu`.
pub fn handle_exception(kernel: &Kernel, cpu: CpuId, which: ExceptionType) {
    match which {
        ExceptionType::Syscall => syscall::dispatch(kernel, cpu),
        ExceptionType::NoException => (),
        _ => {
            let pc = kernel.machine().cpu(cpu).read_register(PC_REG);
            let culprit = kernel.current(cpu).map(|(pid, _)| pid);
            warning!(
                "{:?} at pc {:#x} on {}; killing {:?}",
                which,
                pc,
                cpu,
                culprit
            );
            kernel.exit_process(cpu, FAULT_STATUS);
        }
    }
}
