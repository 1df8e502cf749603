//! Page loaders.
//!
//! An address space is covered by memory areas ([`VmArea`]). Each area knows
//! how to produce the contents of its pages through an [`MmLoader`]. The
//! pager calls the loader when a page of the area is brought into memory:
//! right away under eager paging, or on the first touch under demand paging.
//!
//! There are three kinds of loaders:
//! - [`ImageLoader`] reads the code and data of a NOFF executable,
//! - [`FileBackedLoader`] reads a memory-mapped file and writes modified
//!   pages back to it,
//! - [`AnonLoader`] supplies zero-filled pages for stacks and extensions.

use super::noff::NoffHeader;
use crate::{KernelError, addressing::PAGE_SIZE, fs::BackingFile};
use std::sync::Arc;

/// A trait for loading the contents of a virtual memory page on demand.
pub trait MmLoader
where
    Self: Send + Sync,
{
    /// Fill `page` with the contents of virtual page `vpn`.
    ///
    /// `vpn` is guaranteed to lie within the area of this loader.
    fn load(&self, vpn: usize, page: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError>;

    /// Whether virtual page `vpn` must be mapped read-only.
    fn is_read_only(&self, _vpn: usize) -> bool {
        false
    }

    /// Save a modified page before its frame is released.
    fn write_back(&self, _vpn: usize, _page: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        Ok(())
    }
}

/// A loader for anonymous memory regions.
///
/// Every page starts out zero-filled.
pub struct AnonLoader {}

impl MmLoader for AnonLoader {
    fn load(&self, _vpn: usize, page: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        page.fill(0);
        Ok(())
    }
}

/// A loader for the program image of an executable.
pub struct ImageLoader {
    header: NoffHeader,
    file: Arc<dyn BackingFile>,
}

impl ImageLoader {
    /// A loader for the executable `file` whose header is `header`.
    pub fn new(header: NoffHeader, file: Arc<dyn BackingFile>) -> Self {
        Self { header, file }
    }

    /// The header of the executable.
    pub fn header(&self) -> &NoffHeader {
        &self.header
    }
}

impl MmLoader for ImageLoader {
    fn load(&self, vpn: usize, page: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        self.header.load_page(&*self.file, vpn, page)
    }

    fn is_read_only(&self, vpn: usize) -> bool {
        self.header.is_code_page(vpn)
    }
}

/// A loader for a memory-mapped file.
///
/// Page `start_vpn + i` holds bytes `i * PAGE_SIZE ..` of the file.
pub struct FileBackedLoader {
    file: Arc<dyn BackingFile>,
    start_vpn: usize,
}

impl FileBackedLoader {
    /// Map `file` from virtual page `start_vpn` on.
    pub fn new(file: Arc<dyn BackingFile>, start_vpn: usize) -> Self {
        Self { file, start_vpn }
    }
}

impl MmLoader for FileBackedLoader {
    fn load(&self, vpn: usize, page: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        page.fill(0);
        self.file
            .read_at((vpn - self.start_vpn) * PAGE_SIZE, page)
            .map(|_| ())
    }

    fn write_back(&self, vpn: usize, page: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let position = (vpn - self.start_vpn) * PAGE_SIZE;
        // The mapping is rounded up to whole pages; the file does not grow.
        let len = self.file.len().saturating_sub(position).min(PAGE_SIZE);
        if len > 0 {
            self.file.write_at(position, &page[..len])?;
        }
        Ok(())
    }
}

/// A range of virtual pages whose contents come from one loader.
#[derive(Clone)]
pub struct VmArea {
    /// First page of the area.
    pub start_vpn: usize,
    /// Number of pages.
    pub pages: usize,
    /// Supplies the contents of the pages.
    pub loader: Arc<dyn MmLoader>,
}

impl VmArea {
    /// Whether virtual page `vpn` belongs to the area.
    #[inline]
    pub fn contains(&self, vpn: usize) -> bool {
        (self.start_vpn..self.start_vpn + self.pages).contains(&vpn)
    }

    /// The pages of the area.
    #[inline]
    pub fn vpns(&self) -> core::ops::Range<usize> {
        self.start_vpn..self.start_vpn + self.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;

    #[test]
    fn file_backed_write_back_does_not_grow_the_file() {
        let file = Arc::new(MemFile::new(vec![7; PAGE_SIZE + 10]));
        let loader = FileBackedLoader::new(file.clone(), 4);
        let mut page = [0; PAGE_SIZE];
        loader.load(5, &mut page).unwrap();
        assert_eq!(&page[..10], &[7; 10]);
        assert!(page[10..].iter().all(|b| *b == 0));

        page.fill(1);
        loader.write_back(5, &page).unwrap();
        assert_eq!(file.len(), PAGE_SIZE + 10);
        assert_eq!(&file.contents()[PAGE_SIZE..], &[1; 10]);
    }
}
