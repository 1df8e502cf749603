//! Virtual and physical addresses.
//!
//! User programs see a flat virtual address space starting at zero. The
//! kernel translates it page by page into physical addresses, which index the
//! main memory of the machine directly: frame `n` spans the bytes
//! `n * PAGE_SIZE .. (n + 1) * PAGE_SIZE`.
//!
//! [`Va`] and [`Pa`] are kept as distinct types so that the two can not be
//! mixed up by accident. Both support addition and subtraction of byte
//! offsets.
//!
//! ## Example Usage:
//!
//! ```
//! use machine::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(300);
//! assert_eq!(va.page_number(), 2);
//! assert_eq!(va.offset(), 300 - 2 * PAGE_SIZE);
//! assert_eq!((va + PAGE_SIZE).page_number(), 3);
//! ```

/// Bytes per page and per frame.
///
/// Pages are as small as the sectors of the simulated disk, so that a page
/// of an executable can be read with a single sector transfer.
pub const PAGE_SIZE: usize = 128;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: usize = 7;

/// The in-page offset bits of an address.
pub const PAGE_MASK: usize = 0x7f;

/// Round `size` up to a multiple of [`PAGE_SIZE`].
#[inline]
pub const fn round_to_page(size: usize) -> usize {
    (size + PAGE_MASK) & !PAGE_MASK
}

/// A physical address.
///
/// A physical address is a byte index into the main memory.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The first byte of main memory.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The address of the first byte of frame `frame`.
    #[inline]
    pub const fn from_frame(frame: usize) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    /// The raw byte index.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// The frame that this address belongs to.
    #[inline]
    pub const fn frame_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// The first address of the frame.
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Offset within the frame.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a user virtual address.
///
/// This abstraction provides utility methods for alignment and address
/// manipulation.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address.
    #[inline(always)]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The address of the first byte of virtual page `vpn`.
    #[inline]
    pub const fn from_vpn(vpn: usize) -> Self {
        Self(vpn << PAGE_SHIFT)
    }

    /// The raw address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// The virtual page number of this address.
    ///
    /// # Example
    /// ```
    /// use machine::addressing::Va;
    ///
    /// assert_eq!(Va::new(0x80).page_number(), 1);
    /// ```
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// The first address of the page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// The first address of the next page, unless already page aligned.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset within the page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether the address is a multiple of `size`.
    #[inline]
    pub const fn is_aligned(self, size: usize) -> bool {
        self.0 % size == 0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        assert_eq!(round_to_page(0), 0);
        assert_eq!(round_to_page(1), PAGE_SIZE);
        assert_eq!(round_to_page(300), 3 * PAGE_SIZE);
        let va = Va::new(0x105);
        assert_eq!(va.page_down(), Va::new(0x100));
        assert_eq!(va.page_up(), Va::new(0x180));
        assert_eq!(va.offset(), 5);
        assert_eq!(Pa::from_frame(3) + 5, Pa::new(3 * PAGE_SIZE + 5));
        assert_eq!(Pa::new(3 * PAGE_SIZE + 5).frame_number(), 3);
    }
}
