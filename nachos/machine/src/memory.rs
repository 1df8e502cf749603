//! Main memory.
//!
//! Main memory is a flat array of bytes split into frames of
//! [`PAGE_SIZE`] bytes. It is addressed only by physical addresses; turning a
//! user virtual address into a physical one is the job of the page table
//! installed on a CPU.
//!
//! Multi-byte accesses are little-endian, like the MIPS machine that Nachos
//! simulates when running on a little-endian host.

use crate::addressing::{PAGE_SIZE, Pa};
use crate::spinlock::SpinLock;

/// The main memory of the machine.
pub struct MainMemory {
    bytes: SpinLock<Box<[u8]>>,
}

impl MainMemory {
    /// Allocate a zero-filled main memory of `num_pages` frames.
    pub fn new(num_pages: usize) -> Self {
        Self {
            bytes: SpinLock::new(vec![0; num_pages * PAGE_SIZE].into_boxed_slice()),
        }
    }

    /// Number of frames.
    pub fn num_pages(&self) -> usize {
        let guard = self.bytes.lock();
        let len = guard.len();
        guard.unlock();
        len / PAGE_SIZE
    }

    /// Size of the memory in bytes.
    pub fn size(&self) -> usize {
        self.num_pages() * PAGE_SIZE
    }

    /// Copy `buf.len()` bytes starting at `pa` into `buf`.
    #[track_caller]
    pub fn read(&self, pa: Pa, buf: &mut [u8]) {
        let guard = self.bytes.lock();
        let start = pa.into_usize();
        assert!(
            start + buf.len() <= guard.len(),
            "Physical access out of range: {pa:?}+{}",
            buf.len()
        );
        buf.copy_from_slice(&guard[start..start + buf.len()]);
        guard.unlock();
    }

    /// Copy `data` into memory starting at `pa`.
    #[track_caller]
    pub fn write(&self, pa: Pa, data: &[u8]) {
        let mut guard = self.bytes.lock();
        let start = pa.into_usize();
        assert!(
            start + data.len() <= guard.len(),
            "Physical access out of range: {pa:?}+{}",
            data.len()
        );
        guard[start..start + data.len()].copy_from_slice(data);
        guard.unlock();
    }

    /// Load a 1, 2 or 4-byte little-endian value at `pa`.
    #[track_caller]
    pub fn read_word(&self, pa: Pa, size: usize) -> u32 {
        assert!(matches!(size, 1 | 2 | 4), "Invalid access size: {size}");
        let mut buf = [0u8; 4];
        self.read(pa, &mut buf[..size]);
        u32::from_le_bytes(buf)
    }

    /// Store the low `size` bytes of `value` at `pa`, little-endian.
    #[track_caller]
    pub fn write_word(&self, pa: Pa, size: usize, value: u32) {
        assert!(matches!(size, 1 | 2 | 4), "Invalid access size: {size}");
        self.write(pa, &value.to_le_bytes()[..size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_access_is_little_endian() {
        let memory = MainMemory::new(2);
        assert_eq!(memory.num_pages(), 2);
        memory.write_word(Pa::new(PAGE_SIZE + 4), 4, 0x1122_3344);
        let mut buf = [0; 4];
        memory.read(Pa::new(PAGE_SIZE + 4), &mut buf);
        assert_eq!(buf, [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(memory.read_word(Pa::new(PAGE_SIZE + 4), 2), 0x3344);
        assert_eq!(memory.read_word(Pa::new(PAGE_SIZE + 7), 1), 0x11);
    }

    #[test]
    #[should_panic]
    fn access_beyond_memory_panics() {
        let memory = MainMemory::new(1);
        memory.read_word(Pa::new(PAGE_SIZE - 2), 4);
    }
}
