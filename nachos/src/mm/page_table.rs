//! Linear page table.
//!
//! A [`TranslationTable`] maps the virtual page numbers of one address space
//! to frames. It is a flat array of [`PageTableEntry`]s indexed by virtual
//! page number: entry `i` always describes page `i`. The table grows by
//! appending entries and never shrinks while its address space lives.
//!
//! An entry is *valid* exactly when it holds a [`Frame`]. Invalid entries are
//! pages that were never touched (demand paging) or whose frame was released.

use super::{Frame, FrameId};

bitflags::bitflags! {
    /// Status bits of a [`PageTableEntry`].
    pub struct PteFlags: u32 {
        /// The page was referenced since the bit was last cleared.
        const USED = 1 << 0;
        /// The page was modified since it was loaded.
        const DIRTY = 1 << 1;
        /// Writes to the page raise an exception.
        const READ_ONLY = 1 << 2;
    }
}

/// A translation from a virtual page to a frame.
pub struct PageTableEntry {
    vpn: usize,
    frame: Option<Frame>,
    flags: PteFlags,
}

impl PageTableEntry {
    /// An invalid entry for virtual page `vpn`.
    pub fn new(vpn: usize) -> Self {
        Self {
            vpn,
            frame: None,
            flags: PteFlags::empty(),
        }
    }

    /// The virtual page this entry translates.
    #[inline]
    pub fn virtual_page_number(&self) -> usize {
        self.vpn
    }

    /// The frame the page lives in, if the entry is valid.
    #[inline]
    pub fn physical_page_number(&self) -> Option<FrameId> {
        self.frame.as_ref().map(Frame::id)
    }

    /// Whether the page is bound to a frame.
    #[inline]
    pub fn valid(&self) -> bool {
        self.frame.is_some()
    }

    /// The frame the page lives in.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Status bits.
    #[inline]
    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    /// Mutable access to the status bits.
    #[inline]
    pub fn flags_mut(&mut self) -> &mut PteFlags {
        &mut self.flags
    }

    /// Whether writes to the page are forbidden.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(PteFlags::READ_ONLY)
    }

    /// Bind the page to `frame`. The entry must be invalid.
    ///
    /// The status bits are reset; `read_only` decides the write permission.
    #[track_caller]
    pub fn map(&mut self, frame: Frame, read_only: bool) {
        assert!(
            self.frame.is_none(),
            "Virtual page {} is already mapped.",
            self.vpn
        );
        self.frame = Some(frame);
        self.flags = if read_only {
            PteFlags::READ_ONLY
        } else {
            PteFlags::empty()
        };
    }

    /// Unbind the page, returning its frame.
    pub fn unmap(&mut self) -> Option<Frame> {
        self.flags.remove(PteFlags::USED | PteFlags::DIRTY);
        self.frame.take()
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "vpn: {}, ppn: {:?}, valid: {}, flags: {:?}",
            self.vpn,
            self.physical_page_number().map(FrameId::into_usize),
            self.valid(),
            self.flags
        )
    }
}

/// The page table of an address space.
#[derive(Default)]
pub struct TranslationTable {
    entries: Vec<PageTableEntry>,
}

impl TranslationTable {
    /// A table of `len` invalid entries.
    pub fn new(len: usize) -> Self {
        Self {
            entries: (0..len).map(PageTableEntry::new).collect(),
        }
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry of virtual page `vpn`.
    #[inline]
    pub fn get(&self, vpn: usize) -> Option<&PageTableEntry> {
        self.entries.get(vpn)
    }

    /// The entry of virtual page `vpn`, mutably.
    #[inline]
    pub fn get_mut(&mut self, vpn: usize) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(vpn)
    }

    /// Append `pages` invalid entries. Returns the first new page number.
    pub fn extend(&mut self, pages: usize) -> usize {
        let first = self.entries.len();
        self.entries
            .extend((first..first + pages).map(PageTableEntry::new));
        first
    }

    /// Append invalid entries so that `vpn` has one.
    pub fn grow_to(&mut self, vpn: usize) {
        if vpn >= self.entries.len() {
            self.extend(vpn + 1 - self.entries.len());
        }
    }

    /// Bind virtual page `vpn` to `frame`, growing the table if needed.
    pub fn map(&mut self, vpn: usize, frame: Frame, read_only: bool) {
        self.grow_to(vpn);
        self.entries[vpn].map(frame, read_only);
    }

    /// Unbind virtual page `vpn`, returning its frame.
    pub fn unmap(&mut self, vpn: usize) -> Option<Frame> {
        self.entries.get_mut(vpn).and_then(PageTableEntry::unmap)
    }

    /// Iterate over the entries in page order.
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Iterate mutably over the entries in page order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }

    /// Number of valid entries.
    pub fn resident_pages(&self) -> usize {
        self.entries.iter().filter(|e| e.valid()).count()
    }

    /// Unbind every page. Returns the number of frames released.
    pub fn clear(&mut self) -> usize {
        self.entries
            .iter_mut()
            .filter_map(PageTableEntry::unmap)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::FrameAllocator;
    use machine::memory::MainMemory;
    use std::sync::Arc;

    #[test]
    fn valid_iff_frame_bound() {
        let frames = FrameAllocator::new(Arc::new(MainMemory::new(4)));
        let mut table = TranslationTable::new(2);
        assert!(table.iter().all(|e| !e.valid()));

        let frame = frames.allocate().unwrap();
        let id = frame.id();
        table.get_mut(1).unwrap().map(frame, true);
        let entry = table.get(1).unwrap();
        assert!(entry.valid());
        assert!(entry.is_read_only());
        assert_eq!(entry.physical_page_number(), Some(id));

        assert_eq!(table.extend(3), 2);
        table.grow_to(7);
        assert_eq!(table.len(), 8);
        assert_eq!(table.get(7).unwrap().virtual_page_number(), 7);

        assert_eq!(table.clear(), 1);
        assert_eq!(table.clear(), 0);
        assert!(frames.is_free(id));
    }
}
