//! NOFF executables.
//!
//! NOFF ("Nachos Object File Format") is the executable format user programs
//! are shipped in. A file starts with a 40-byte header: a magic number
//! followed by three segment descriptors, one per segment of the program:
//!
//! | offset | field |
//! |---|---|
//! | 0 | magic (`0xbadfad`) |
//! | 4 | code: virtual address, offset in file, size |
//! | 16 | initialized data: virtual address, offset in file, size |
//! | 28 | uninitialized data: virtual address, offset in file, size |
//!
//! Every field is a little-endian `u32`. Uninitialized data has no bytes in
//! the file; it is zero-filled when loaded.

use crate::{
    KernelError,
    addressing::{PAGE_SIZE, round_to_page},
    fs::BackingFile,
};
use arrayvec::ArrayVec;

/// Magic number at the start of every NOFF file.
pub const NOFF_MAGIC: u32 = 0xbadfad;

/// Size of a NOFF header in bytes.
pub const NOFF_HEADER_SIZE: usize = 40;

/// Location of one segment, in memory and in the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    /// Where the segment starts in the address space.
    pub virtual_addr: u32,
    /// Where the segment bytes start in the file.
    pub in_file_addr: u32,
    /// Size of the segment in bytes.
    pub size: u32,
}

impl Segment {
    /// The range of virtual addresses the segment covers.
    pub fn range(&self) -> core::ops::Range<usize> {
        let start = self.virtual_addr as usize;
        start..start + self.size as usize
    }

    /// The part of the segment that lies on virtual page `vpn`.
    pub fn overlap_with_page(&self, vpn: usize) -> Option<core::ops::Range<usize>> {
        let range = self.range();
        let page = vpn * PAGE_SIZE..(vpn + 1) * PAGE_SIZE;
        let start = range.start.max(page.start);
        let end = range.end.min(page.end);
        (start < end).then_some(start..end)
    }

    fn parse(bytes: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            virtual_addr: word(0),
            in_file_addr: word(4),
            size: word(8),
        }
    }
}

/// The three kinds of segment of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Instructions. Read-only.
    Code,
    /// Initialized global data.
    InitData,
    /// Uninitialized global data. Zero-filled.
    UninitData,
}

/// A segment together with its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoffSegment {
    /// Kind of the segment.
    pub kind: SegmentKind,
    /// Location of the segment.
    pub segment: Segment,
}

/// The header of a NOFF executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoffHeader {
    /// Code segment.
    pub code: Segment,
    /// Initialized data segment.
    pub init_data: Segment,
    /// Uninitialized data segment.
    pub uninit_data: Segment,
}

impl NoffHeader {
    /// Read and validate the header at the start of `file`.
    ///
    /// # Errors
    /// [`KernelError::NoExec`] when the file is too short to hold a header or
    /// does not start with [`NOFF_MAGIC`].
    pub fn read_header(file: &dyn BackingFile) -> Result<Self, KernelError> {
        let mut bytes = [0; NOFF_HEADER_SIZE];
        if file.read_at(0, &mut bytes)? != NOFF_HEADER_SIZE {
            return Err(KernelError::NoExec);
        }
        Self::from_bytes(&bytes)
    }

    /// Decode a header.
    pub fn from_bytes(bytes: &[u8; NOFF_HEADER_SIZE]) -> Result<Self, KernelError> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != NOFF_MAGIC {
            return Err(KernelError::NoExec);
        }
        Ok(Self {
            code: Segment::parse(&bytes[4..16]),
            init_data: Segment::parse(&bytes[16..28]),
            uninit_data: Segment::parse(&bytes[28..40]),
        })
    }

    /// Encode the header.
    pub fn to_bytes(&self) -> [u8; NOFF_HEADER_SIZE] {
        let mut bytes = [0; NOFF_HEADER_SIZE];
        let words = [
            NOFF_MAGIC,
            self.code.virtual_addr,
            self.code.in_file_addr,
            self.code.size,
            self.init_data.virtual_addr,
            self.init_data.in_file_addr,
            self.init_data.size,
            self.uninit_data.virtual_addr,
            self.uninit_data.in_file_addr,
            self.uninit_data.size,
        ];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// The segments in address order of a conventional executable.
    pub fn segments(&self) -> [NoffSegment; 3] {
        [
            NoffSegment {
                kind: SegmentKind::Code,
                segment: self.code,
            },
            NoffSegment {
                kind: SegmentKind::InitData,
                segment: self.init_data,
            },
            NoffSegment {
                kind: SegmentKind::UninitData,
                segment: self.uninit_data,
            },
        ]
    }

    /// The non-empty segments that have bytes on virtual page `vpn`.
    ///
    /// A page on the boundary of two segments belongs to both.
    pub fn segments_at(&self, vpn: usize) -> ArrayVec<NoffSegment, 3> {
        self.segments()
            .into_iter()
            .filter(|s| s.segment.overlap_with_page(vpn).is_some())
            .collect()
    }

    /// Bytes of address space taken by the program image: the code rounded
    /// up to a page, plus the data rounded up to a page.
    pub fn image_size(&self) -> usize {
        round_to_page(self.code.size as usize)
            + round_to_page(self.init_data.size as usize + self.uninit_data.size as usize)
    }

    /// Number of pages the image spans.
    ///
    /// This is at least [`Self::image_size`] in pages, and covers every
    /// segment even when the segments are not packed from address zero.
    pub fn image_pages(&self) -> usize {
        let end = self
            .segments()
            .iter()
            .map(|s| round_to_page(s.segment.range().end))
            .max()
            .unwrap_or(0);
        self.image_size().max(end) / PAGE_SIZE
    }

    /// Whether virtual page `vpn` only holds code.
    ///
    /// A page shared by code and data must stay writable.
    pub fn is_code_page(&self, vpn: usize) -> bool {
        let segments = self.segments_at(vpn);
        !segments.is_empty() && segments.iter().all(|s| s.kind == SegmentKind::Code)
    }

    /// Fill `page` with the contents of virtual page `vpn`.
    ///
    /// Bytes of code and initialized data come from `file`; everything else
    /// is zero.
    pub fn load_page(
        &self,
        file: &dyn BackingFile,
        vpn: usize,
        page: &mut [u8; PAGE_SIZE],
    ) -> Result<(), KernelError> {
        page.fill(0);
        for NoffSegment { kind, segment } in self.segments_at(vpn) {
            if kind == SegmentKind::UninitData {
                continue;
            }
            if let Some(overlap) = segment.overlap_with_page(vpn) {
                let position = segment.in_file_addr as usize + overlap.start
                    - segment.virtual_addr as usize;
                let base = vpn * PAGE_SIZE;
                file.read_at(position, &mut page[overlap.start - base..overlap.end - base])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;

    fn header(code: u32, init: u32, uninit: u32) -> NoffHeader {
        NoffHeader {
            code: Segment {
                virtual_addr: 0,
                in_file_addr: NOFF_HEADER_SIZE as u32,
                size: code,
            },
            init_data: Segment {
                virtual_addr: code,
                in_file_addr: NOFF_HEADER_SIZE as u32 + code,
                size: init,
            },
            uninit_data: Segment {
                virtual_addr: code + init,
                in_file_addr: 0,
                size: uninit,
            },
        }
    }

    #[test]
    fn reject_bad_magic_and_short_header() {
        let mut bytes = header(10, 0, 0).to_bytes();
        bytes[0] ^= 1;
        assert_eq!(
            NoffHeader::read_header(&MemFile::new(bytes.to_vec())),
            Err(KernelError::NoExec)
        );
        let bytes = header(10, 0, 0).to_bytes();
        assert_eq!(
            NoffHeader::read_header(&MemFile::new(bytes[..20].to_vec())),
            Err(KernelError::NoExec)
        );
        assert_eq!(
            NoffHeader::read_header(&MemFile::new(bytes.to_vec())),
            Ok(header(10, 0, 0))
        );
    }

    #[test]
    fn boundary_page_belongs_to_both_segments() {
        let h = header(200, 100, 50);
        assert_eq!(h.image_size(), 2 * PAGE_SIZE + 2 * PAGE_SIZE);
        let kinds = |vpn| {
            h.segments_at(vpn)
                .iter()
                .map(|s| s.kind)
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds(0), vec![SegmentKind::Code]);
        assert_eq!(kinds(1), vec![SegmentKind::Code, SegmentKind::InitData]);
        assert_eq!(kinds(2), vec![SegmentKind::InitData, SegmentKind::UninitData]);
        assert!(kinds(3).is_empty());
        assert!(h.is_code_page(0));
        assert!(!h.is_code_page(1));
        assert!(!h.is_code_page(3));
    }

    #[test]
    fn load_boundary_page_from_two_regions() {
        let h = header(200, 100, 50);
        let mut image = h.to_bytes().to_vec();
        image.extend((0..300u32).map(|i| (i % 251) as u8 + 1));
        let file = MemFile::new(image);

        let mut page = [0; PAGE_SIZE];
        h.load_page(&file, 2, &mut page).unwrap();
        // initialized data from address 256 to 300, then uninitialized data.
        for (i, b) in page.iter().enumerate() {
            let va = 2 * PAGE_SIZE + i;
            if va < 300 {
                assert_eq!(*b as u32, (va as u32 % 251) + 1);
            } else {
                assert_eq!(*b, 0);
            }
        }
    }
}
