//! The user-visible register file of a CPU.
//!
//! The layout follows the MIPS machine: 32 general purpose registers followed
//! by the special registers used by the simulator.

/// Number of general purpose registers.
pub const NUM_GP_REGS: usize = 32;
/// User's stack pointer.
pub const STACK_REG: usize = 29;
/// Holds return address for procedure calls.
pub const RET_ADDR_REG: usize = 31;
/// Double register to hold multiply result.
pub const HI_REG: usize = 32;
/// Low half of the multiply result.
pub const LO_REG: usize = 33;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter (for branch delay).
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter (for debugging).
pub const PREV_PC_REG: usize = 36;
/// The register target of a delayed load.
pub const LOAD_REG: usize = 37;
/// The value to be loaded by a delayed load.
pub const LOAD_VALUE_REG: usize = 38;
/// The failing virtual address on an exception.
pub const BAD_VADDR_REG: usize = 39;
/// Total number of registers.
pub const NUM_TOTAL_REGS: usize = 40;

/// Register that carries the system call code and the return value.
pub const RET_VALUE_REG: usize = 2;
/// Registers that carry the first four arguments of a system call.
pub const ARG_REGS: [usize; 4] = [4, 5, 6, 7];

/// A snapshot of the register file.
///
/// The kernel keeps one of these per user thread while the thread is not on a
/// CPU.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    regs: [i32; NUM_TOTAL_REGS],
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    /// A register file with every register zeroed.
    pub const fn new() -> Self {
        Self {
            regs: [0; NUM_TOTAL_REGS],
        }
    }

    /// Returns a mutable reference to the program counter.
    ///
    /// # Example
    /// ```rust
    /// use machine::registers::Registers;
    ///
    /// let mut regs = Registers::new();
    /// *regs.pc() = 0x40;
    /// ```
    #[inline]
    pub fn pc(&mut self) -> &mut i32 {
        &mut self.regs[PC_REG]
    }

    /// Returns a mutable reference to the next program counter.
    #[inline]
    pub fn next_pc(&mut self) -> &mut i32 {
        &mut self.regs[NEXT_PC_REG]
    }

    /// Returns a mutable reference to the previous program counter.
    #[inline]
    pub fn prev_pc(&mut self) -> &mut i32 {
        &mut self.regs[PREV_PC_REG]
    }

    /// Returns a mutable reference to the stack pointer.
    #[inline]
    pub fn sp(&mut self) -> &mut i32 {
        &mut self.regs[STACK_REG]
    }

    /// Move past the instruction that trapped.
    ///
    /// Without this, returning from a system call would execute the `syscall`
    /// instruction again.
    pub fn advance_pc(&mut self) {
        self.regs[PREV_PC_REG] = self.regs[PC_REG];
        self.regs[PC_REG] = self.regs[NEXT_PC_REG];
        self.regs[NEXT_PC_REG] += 4;
    }
}

impl core::ops::Index<usize> for Registers {
    type Output = i32;

    fn index(&self, index: usize) -> &i32 {
        &self.regs[index]
    }
}

impl core::ops::IndexMut<usize> for Registers {
    fn index_mut(&mut self, index: usize) -> &mut i32 {
        &mut self.regs[index]
    }
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "PC: {:#x} NextPC: {:#x} PrevPC: {:#x} SP: {:#x} r2: {}",
            self.regs[PC_REG],
            self.regs[NEXT_PC_REG],
            self.regs[PREV_PC_REG],
            self.regs[STACK_REG],
            self.regs[RET_VALUE_REG]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_pc_shifts_the_pipeline() {
        let mut regs = Registers::new();
        *regs.pc() = 0x10;
        *regs.next_pc() = 0x14;
        regs.advance_pc();
        assert_eq!(regs[PREV_PC_REG], 0x10);
        assert_eq!(regs[PC_REG], 0x14);
        assert_eq!(regs[NEXT_PC_REG], 0x18);
    }
}
