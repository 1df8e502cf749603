//! Memory Management.
//!
//! Physical memory is split into page frames. Frames are handed out by a
//! [`FrameAllocator`], which every address space of a kernel shares.
//!
//! Frame allocation is tied to Rust's ownership system: a frame is allocated
//! by [`FrameAllocator::allocate`], which returns an owned [`Frame`]. Once the
//! last [`Frame`] referring to the frame is dropped, the frame goes back to
//! the pool. Cloning a [`Frame`] shares the frame between two owners, which
//! is how the sharing fork policy lets a parent and a child map the same
//! read-only code frame.
//!
//! Free frames are kept in FIFO order: frames are taken from the front of the
//! free list and returned to its back.
pub mod page_table;

use crate::{
    addressing::{PAGE_SIZE, Pa},
    debug,
};
use machine::{memory::MainMemory, spinlock::SpinLock};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// There is no free frame left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// Index of a frame in main memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FrameId(usize);

impl FrameId {
    /// Create a frame index.
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Cast into a raw index.
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Physical address of the first byte of the frame.
    pub const fn pa(self) -> Pa {
        Pa::from_frame(self.0)
    }
}

struct FreeList {
    free: VecDeque<FrameId>,
    // true: free, false: used
    map: Vec<bool>,
}

/// The pool of physical page frames.
pub struct FrameAllocator {
    free_list: SpinLock<FreeList>,
    ref_cnts: Box<[AtomicU64]>,
    memory: Arc<MainMemory>,
}

impl FrameAllocator {
    /// Create a pool holding every frame of `memory`.
    pub fn new(memory: Arc<MainMemory>) -> Arc<Self> {
        let total = memory.num_pages();
        Arc::new(Self {
            free_list: SpinLock::new(FreeList {
                free: (0..total).map(FrameId).collect(),
                map: vec![true; total],
            }),
            ref_cnts: (0..total).map(|_| AtomicU64::new(0)).collect(),
            memory,
        })
    }

    /// Allocate a zero-filled frame.
    ///
    /// # Errors
    /// [`OutOfMemory`] when every frame is in use.
    pub fn allocate(self: &Arc<Self>) -> Result<Frame, OutOfMemory> {
        let mut guard = self.free_list.lock();
        let id = guard.free.pop_front();
        if let Some(id) = id {
            guard.map[id.0] = false;
        }
        guard.unlock();

        let id = id.ok_or(OutOfMemory)?;
        assert_eq!(self.ref_cnts[id.0].swap(1, Ordering::SeqCst), 0);
        self.memory.write(id.pa(), &[0; PAGE_SIZE]);
        debug!(MEMORY, "allocate frame {}", id.0);
        Ok(Frame {
            id,
            allocator: self.clone(),
        })
    }

    /// Give up `frame`.
    ///
    /// The frame returns to the pool once no other [`Frame`] refers to it.
    pub fn free(&self, frame: Frame) {
        assert!(
            Arc::ptr_eq(&frame.allocator.memory, &self.memory),
            "Frame does not belong to this allocator."
        );
        drop(frame);
    }

    fn release(&self, id: FrameId) {
        let mut guard = self.free_list.lock();
        assert!(!guard.map[id.0], "Double free of frame {}.", id.0);
        guard.map[id.0] = true;
        guard.free.push_back(id);
        guard.unlock();
        debug!(MEMORY, "free frame {}", id.0);
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        let guard = self.free_list.lock();
        let cnt = guard.free.len();
        guard.unlock();
        cnt
    }

    /// Number of frames managed by the pool.
    pub fn total(&self) -> usize {
        self.ref_cnts.len()
    }

    /// Whether the frame `id` is in the free set.
    pub fn is_free(&self, id: FrameId) -> bool {
        let guard = self.free_list.lock();
        let free = guard.map[id.0];
        guard.unlock();
        free
    }

    /// Number of [`Frame`]s referring to the frame `id`.
    pub fn ref_count(&self, id: FrameId) -> u64 {
        self.ref_cnts[id.0].load(Ordering::SeqCst)
    }

    /// The memory the frames live in.
    pub fn memory(&self) -> &Arc<MainMemory> {
        &self.memory
    }
}

/// An owned reference to an allocated frame.
///
/// Dropping the last reference returns the frame to its allocator.
pub struct Frame {
    id: FrameId,
    allocator: Arc<FrameAllocator>,
}

impl Frame {
    /// Index of the frame.
    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Physical address of the frame.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.id.pa()
    }

    /// Copy the contents of the frame into `buf`.
    pub fn read(&self, buf: &mut [u8; PAGE_SIZE]) {
        self.allocator.memory.read(self.pa(), buf);
    }

    /// Overwrite the contents of the frame with `data`.
    pub fn write(&self, data: &[u8; PAGE_SIZE]) {
        self.allocator.memory.write(self.pa(), data);
    }

    /// Copy the contents of `other` into this frame.
    pub fn copy_from(&self, other: &Frame) {
        let mut buf = [0; PAGE_SIZE];
        other.read(&mut buf);
        self.write(&buf);
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        self.allocator.ref_cnts[self.id.0].fetch_add(1, Ordering::SeqCst);
        Self {
            id: self.id,
            allocator: self.allocator.clone(),
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if self.allocator.ref_cnts[self.id.0].fetch_sub(1, Ordering::SeqCst) == 1 {
            self.allocator.release(self.id);
        }
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame({})", self.id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_frame_returns_on_last_drop() {
        let frames = FrameAllocator::new(Arc::new(MainMemory::new(2)));
        let a = frames.allocate().unwrap();
        let b = a.clone();
        assert_eq!(frames.ref_count(a.id()), 2);
        let id = a.id();
        frames.free(a);
        assert!(!frames.is_free(id));
        drop(b);
        assert!(frames.is_free(id));
        assert_eq!(frames.free_count(), 2);
    }

    #[test]
    fn allocated_frames_are_zeroed() {
        let frames = FrameAllocator::new(Arc::new(MainMemory::new(1)));
        let a = frames.allocate().unwrap();
        a.write(&[0xab; PAGE_SIZE]);
        drop(a);
        let b = frames.allocate().unwrap();
        let mut buf = [0xff; PAGE_SIZE];
        b.read(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }
}
