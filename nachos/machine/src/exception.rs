//! Exceptions raised by a CPU while running user code.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The reason why control was transferred from user mode to the kernel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ExceptionType {
    /// Everything ok.
    NoException = 0,
    /// A program executed a system call.
    Syscall = 1,
    /// No valid translation found.
    PageFault = 2,
    /// Write attempted to page marked "read-only".
    ReadOnly = 3,
    /// Translation resulted in an invalid physical address.
    BusError = 4,
    /// Unaligned reference or one that was beyond the end of the address
    /// space.
    AddressError = 5,
    /// Integer overflow in add or sub.
    Overflow = 6,
    /// Unimplemented or reserved instruction.
    IllegalInstr = 7,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_u32() {
        assert_eq!(u32::from(ExceptionType::ReadOnly), 3);
        assert!(matches!(
            ExceptionType::try_from(5),
            Ok(ExceptionType::AddressError)
        ));
        assert!(ExceptionType::try_from(8).is_err());
    }
}
