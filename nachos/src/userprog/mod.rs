//! User programs.
//!
//! A user program is a NOFF executable ([`noff`]) loaded into an
//! [`address_space::AddressSpace`]. Pages of the address space are supplied
//! by the [`loader`]s of its memory areas, either all at once when the
//! program starts or one at a time when the program first touches them.
//!
//! Each running program is a [`process::Process`] with exactly one user
//! thread. Programs talk to the kernel through [`syscall`]s; any other
//! exception kills the program ([`exception`]).

pub mod address_space;
pub mod exception;
pub mod loader;
pub mod noff;
pub mod process;
pub mod syscall;

use crate::mm::OutOfMemory;
use machine::exception::ExceptionType;

/// The reason why a user memory access could not be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The address is not aligned to the access size.
    Alignment,
    /// The page lies beyond the end of the page table.
    OutOfRange,
    /// A write to a read-only page.
    ReadOnlyViolation,
    /// The page belongs to no memory area, or could not be loaded.
    Unrecoverable,
    /// No frame was left to load the page into.
    OutOfMemory,
}

impl From<OutOfMemory> for Fault {
    fn from(_: OutOfMemory) -> Self {
        Fault::OutOfMemory
    }
}

impl From<Fault> for ExceptionType {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Alignment | Fault::OutOfRange => ExceptionType::AddressError,
            Fault::ReadOnlyViolation => ExceptionType::ReadOnly,
            Fault::Unrecoverable => ExceptionType::PageFault,
            Fault::OutOfMemory => ExceptionType::BusError,
        }
    }
}

impl From<Fault> for crate::KernelError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::OutOfMemory => crate::KernelError::NoMemory,
            _ => crate::KernelError::BadAddress,
        }
    }
}
