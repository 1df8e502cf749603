//! # Nachos: a multiprogramming kernel on a simulated machine.
//!
//! This crate is the kernel half of the system. The hardware half lives in
//! the [`machine`] crate: CPUs with MIPS register files, per-CPU timers, main
//! memory and interrupt masking. The kernel manages:
//!
//! - **Physical memory** ([`mm`]): a pool of page frames handed out as owned
//!   [`mm::Frame`]s, and the per-address-space [`mm::page_table`].
//! - **User programs** ([`userprog`]): NOFF executables, address spaces with
//!   eager or demand paging, fork, memory-mapped files, processes and system
//!   calls.
//! - **Threads** ([`thread`]): the thread table and a multi-level-feedback
//!   scheduler that dispatches ready threads onto idle CPUs and is driven by
//!   timer interrupts.
//!
//! Everything is tied together by the [`kernel::Kernel`] context. There is no
//! global kernel state: tests build as many isolated kernels as they like.
//!
//! ## Locking
//!
//! Locks are [`SpinLock`]s that mask interrupts while held and must be
//! released with an explicit `unlock()`. They are always taken in this order:
//!
//! 1. process table
//! 2. scheduler
//! 3. thread table
//!
//! and, independently, an address space before the frame allocator.
//!
//! [`SpinLock`]: machine::spinlock::SpinLock

pub mod config;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod thread;
pub mod userprog;

pub use machine::{MAX_CPU, addressing, debug, info, print, println, warning};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// during the handling of a kernel operation. These errors are returned to
/// the user program as a negative errno in the return value register.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding error code,
    /// which is what a system call leaves in the return value register.
    pub fn into_i32(self) -> i32 {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::InvalidArgument => -22,
            KernelError::NameTooLong => -36,
            KernelError::NoSuchSyscall => -38,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

/// The given `i32` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: i32,
}

impl TryFrom<i32> for KernelError {
    type Error = TryFromError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -12 => Ok(Self::NoMemory),
            -14 => Ok(Self::BadAddress),
            -22 => Ok(Self::InvalidArgument),
            -36 => Ok(Self::NameTooLong),
            -38 => Ok(Self::NoSuchSyscall),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}

impl From<mm::OutOfMemory> for KernelError {
    fn from(_: mm::OutOfMemory) -> Self {
        KernelError::NoMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        for e in [
            KernelError::NoSuchEntry,
            KernelError::NoExec,
            KernelError::NoMemory,
            KernelError::BadAddress,
            KernelError::InvalidArgument,
            KernelError::NoSuchSyscall,
            KernelError::NotSupportedOperation,
        ] {
            assert_eq!(KernelError::try_from(e.into_i32()), Ok(e));
        }
        assert_eq!(KernelError::try_from(-3), Err(TryFromError { e: -3 }));
    }
}
