//! File system interface.
//!
//! The kernel reads executables and memory-mapped files through these two
//! traits only. The on-disk file system is not part of this crate; the
//! in-memory [`MemFileSystem`] is what the kernel boots with in tests.

use crate::KernelError;
use machine::spinlock::SpinLock;
use std::{collections::BTreeMap, sync::Arc};

/// A file that backs part of an address space.
pub trait BackingFile
where
    Self: Send + Sync,
{
    /// Reads up to `buf.len()` bytes at `position` into `buf`.
    ///
    /// Returns the number of bytes read, which is short at the end of the
    /// file.
    fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError>;

    /// Writes `buf` at `position`, growing the file if needed.
    ///
    /// Returns the number of bytes written.
    fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError>;

    /// Size of the file in bytes.
    fn len(&self) -> usize;

    /// Whether the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file system that files are opened from by name.
pub trait FileSystem
where
    Self: Send + Sync,
{
    /// Open the file `name`.
    fn open(&self, name: &str) -> Option<Arc<dyn BackingFile>>;
}

/// A file held in memory.
#[derive(Default)]
pub struct MemFile {
    data: SpinLock<Vec<u8>>,
}

impl MemFile {
    /// A file with contents `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: SpinLock::new(data),
        }
    }

    /// A copy of the whole contents.
    pub fn contents(&self) -> Vec<u8> {
        let guard = self.data.lock();
        let data = guard.clone();
        guard.unlock();
        data
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let guard = self.data.lock();
        let n = guard.len().saturating_sub(position).min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&guard[position..position + n]);
        }
        guard.unlock();
        Ok(n)
    }

    fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut guard = self.data.lock();
        if guard.len() < position + buf.len() {
            guard.resize(position + buf.len(), 0);
        }
        guard[position..position + buf.len()].copy_from_slice(buf);
        guard.unlock();
        Ok(buf.len())
    }

    fn len(&self) -> usize {
        let guard = self.data.lock();
        let len = guard.len();
        guard.unlock();
        len
    }
}

/// A flat, in-memory file system.
#[derive(Default)]
pub struct MemFileSystem {
    files: SpinLock<BTreeMap<String, Arc<MemFile>>>,
}

impl MemFileSystem {
    /// An empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the file `name` with contents `data`.
    pub fn insert(&self, name: &str, data: Vec<u8>) -> Arc<MemFile> {
        let file = Arc::new(MemFile::new(data));
        let mut guard = self.files.lock();
        guard.insert(name.to_string(), file.clone());
        guard.unlock();
        file
    }
}

impl FileSystem for MemFileSystem {
    fn open(&self, name: &str) -> Option<Arc<dyn BackingFile>> {
        let guard = self.files.lock();
        let file = guard.get(name).cloned();
        guard.unlock();
        file.map(|f| f as Arc<dyn BackingFile>)
    }
}
