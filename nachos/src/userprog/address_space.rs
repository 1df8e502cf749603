//! # Address spaces
//!
//! An [`AddressSpace`] is the memory a user program sees. It is laid out as
//! follows, from virtual address zero:
//!
//! ```text
//! +--------------------+ 0
//! | code               |  image area, loaded from the executable
//! | data               |
//! +--------------------+ shared_pages * PAGE_SIZE
//! | stack              |  private, zero-filled
//! +--------------------+ (shared_pages + stack_pages) * PAGE_SIZE
//! | extensions, mmaps  |  appended by extend() and map_file()
//! +--------------------+ next_vpn * PAGE_SIZE
//! ```
//!
//! Each region is a [`VmArea`] whose [`MmLoader`] supplies page contents.
//! When a program starts, its stack is allocated right away. The image is
//! either loaded completely ([`PagingPolicy::Eager`]) or left to demand
//! paging ([`PagingPolicy::Lazy`]): the first access to an invalid page
//! raises a page fault, which loads the page into a fresh frame and retries
//! the access.
//!
//! Code pages are read-only. A page shared by the code and the data segment
//! stays writable.
//!
//! Fork clones the address space. Under [`ForkPolicy::Copy`] every resident
//! page of the parent is copied into a frame of the child. Under
//! [`ForkPolicy::Share`] read-only code frames are shared instead. The child
//! always gets a fresh stack, and pages the parent never touched stay on
//! demand in the child.

use super::{
    Fault,
    loader::{AnonLoader, FileBackedLoader, ImageLoader, MmLoader, VmArea},
    noff::NoffHeader,
};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va, round_to_page},
    config::SystemConfiguration,
    debug,
    fs::BackingFile,
    mm::{
        FrameAllocator, OutOfMemory,
        page_table::{PteFlags, TranslationTable},
    },
};
use machine::{
    cpu::{Cpu, Mmu},
    exception::ExceptionType,
    registers::Registers,
    spinlock::SpinLock,
    stats::Statistics,
};
use std::sync::Arc;

/// When the pages of a program image are brought into memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PagingPolicy {
    /// Every page is loaded when the program starts.
    Eager,
    /// A page is loaded on its first access.
    #[default]
    Lazy,
}

/// How fork duplicates the image of the parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForkPolicy {
    /// Every resident page is copied.
    #[default]
    Copy,
    /// Read-only pages are shared; the others are copied.
    Share,
}

/// A file mapped into an address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile {
    /// Name the file was opened with.
    pub name: String,
    /// First address of the mapping.
    pub start_addr: Va,
    /// Bytes of address space reserved for the mapping.
    pub allocated_size: usize,
}

/// The memory of a user program.
pub struct AddressSpace {
    table: TranslationTable,
    areas: Vec<VmArea>,
    shared_pages: usize,
    stack_pages: usize,
    next_vpn: usize,
    mapped_files: Vec<MappedFile>,
    frames: Arc<FrameAllocator>,
    stats: Arc<Statistics>,
}

impl AddressSpace {
    /// Build the address space of the executable `file`.
    ///
    /// # Errors
    /// - [`KernelError::NoExec`] when `file` is not a NOFF executable.
    /// - [`KernelError::NoMemory`] when the program is larger than physical
    ///   memory, or when frames run out. Frames taken so far are returned.
    pub fn exec(
        file: Arc<dyn BackingFile>,
        frames: &Arc<FrameAllocator>,
        stats: &Arc<Statistics>,
        config: &SystemConfiguration,
    ) -> Result<Self, KernelError> {
        let header = NoffHeader::read_header(&*file)?;
        let shared_pages = header.image_pages();
        let stack_pages = round_to_page(config.user_stack_size) / PAGE_SIZE;
        let pages = shared_pages + stack_pages;
        if pages > config.num_phys_pages {
            debug!(MEMORY, "exec: {} pages do not fit in memory", pages);
            return Err(KernelError::NoMemory);
        }
        debug!(
            MEMORY,
            "exec: code {}, data {}, bss {}, {} pages",
            header.code.size,
            header.init_data.size,
            header.uninit_data.size,
            pages
        );

        let mut space = Self {
            table: TranslationTable::new(pages),
            areas: vec![
                VmArea {
                    start_vpn: 0,
                    pages: shared_pages,
                    loader: Arc::new(ImageLoader::new(header, file)),
                },
                VmArea {
                    start_vpn: shared_pages,
                    pages: stack_pages,
                    loader: Arc::new(AnonLoader {}),
                },
            ],
            shared_pages,
            stack_pages,
            next_vpn: pages,
            mapped_files: Vec::new(),
            frames: frames.clone(),
            stats: stats.clone(),
        };
        if config.paging == PagingPolicy::Eager {
            for vpn in 0..shared_pages {
                space.load_page(vpn)?;
            }
        }
        for vpn in space.stack_vpns() {
            space.load_page(vpn)?;
        }
        Ok(space)
    }

    /// Set up the registers of a program that starts from the beginning.
    ///
    /// Every register is cleared, execution starts at address zero and the
    /// stack pointer is at the top of the stack.
    pub fn init_registers(&self, regs: &mut Registers) {
        *regs = Registers::new();
        *regs.pc() = 0;
        *regs.next_pc() = 4;
        *regs.sp() = (self.stack_vpns().end * PAGE_SIZE) as i32;
        debug!(ADDRESS, "initializing stack register to {:#x}", *regs.sp());
    }

    /// Number of pages of the address space.
    pub fn pages(&self) -> usize {
        self.table.len()
    }

    /// Number of pages of the program image.
    pub fn shared_pages(&self) -> usize {
        self.shared_pages
    }

    /// Number of pages of the stack.
    pub fn stack_pages(&self) -> usize {
        self.stack_pages
    }

    /// The pages of the stack.
    pub fn stack_vpns(&self) -> core::ops::Range<usize> {
        self.shared_pages..self.shared_pages + self.stack_pages
    }

    /// The page table.
    pub fn table(&self) -> &TranslationTable {
        &self.table
    }

    /// The files currently mapped.
    pub fn mapped_files(&self) -> &[MappedFile] {
        &self.mapped_files
    }

    fn area_of(&self, vpn: usize) -> Option<&VmArea> {
        self.areas.iter().find(|area| area.contains(vpn))
    }

    fn load_page(&mut self, vpn: usize) -> Result<(), Fault> {
        let loader = self
            .area_of(vpn)
            .map(|area| area.loader.clone())
            .ok_or(Fault::Unrecoverable)?;
        let frame = self.frames.allocate()?;
        let mut page = [0; PAGE_SIZE];
        loader
            .load(vpn, &mut page)
            .map_err(|_| Fault::Unrecoverable)?;
        frame.write(&page);
        debug!(MEMORY, "vpn {} -> frame {:?}", vpn, frame.id());
        self.table.map(vpn, frame, loader.is_read_only(vpn));
        Ok(())
    }

    /// Bring virtual page `vpn` into memory.
    ///
    /// # Errors
    /// - [`Fault::Unrecoverable`] when no area covers the page, or its
    ///   contents can not be read.
    /// - [`Fault::OutOfMemory`] when no frame is left.
    pub fn handle_page_fault(&mut self, vpn: usize) -> Result<(), Fault> {
        self.stats.page_fault();
        debug!(MEMORY, "page fault at vpn {}", vpn);
        self.load_page(vpn)
    }

    /// Translate an access of `size` bytes at `va`.
    ///
    /// A page that is not resident is brought in first. The page is marked
    /// used, and dirty if `is_write`.
    pub fn translate(&mut self, va: Va, size: usize, is_write: bool) -> Result<Pa, Fault> {
        let aligned = match size {
            1 => true,
            2 | 4 => va.is_aligned(size),
            _ => false,
        };
        if !aligned {
            return Err(Fault::Alignment);
        }
        let vpn = va.page_number();
        if vpn >= self.table.len() {
            debug!(ADDRESS, "{:?} is beyond {} pages", va, self.table.len());
            return Err(Fault::OutOfRange);
        }
        if !self.table.get(vpn).is_some_and(|entry| entry.valid()) {
            self.handle_page_fault(vpn)?;
        }
        let entry = self.table.get_mut(vpn).ok_or(Fault::OutOfRange)?;
        let frame = entry.physical_page_number().ok_or(Fault::Unrecoverable)?;
        if is_write && entry.is_read_only() {
            debug!(ADDRESS, "write to read-only page {}", vpn);
            return Err(Fault::ReadOnlyViolation);
        }
        entry.flags_mut().insert(PteFlags::USED);
        if is_write {
            entry.flags_mut().insert(PteFlags::DIRTY);
        }
        let pa = frame.pa() + va.offset();
        debug!(ADDRESS, "{:?} -> {:?}", va, pa);
        Ok(pa)
    }

    /// Copy `buf.len()` bytes at `va` into `buf`.
    pub fn read_virtual_memory(&mut self, va: Va, buf: &mut [u8]) -> Result<(), Fault> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let chunk = (PAGE_SIZE - addr.offset()).min(buf.len() - done);
            let pa = self.translate(addr, 1, false)?;
            self.frames.memory().read(pa, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `buf` to `va`.
    pub fn write_virtual_memory(&mut self, va: Va, buf: &[u8]) -> Result<(), Fault> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let chunk = (PAGE_SIZE - addr.offset()).min(buf.len() - done);
            let pa = self.translate(addr, 1, true)?;
            self.frames.memory().write(pa, &buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn is_file_backed(&self, vpn: usize) -> bool {
        self.mapped_files.iter().any(|m| {
            let start = m.start_addr.page_number();
            (start..start + m.allocated_size / PAGE_SIZE).contains(&vpn)
        })
    }

    /// Duplicate the address space for a child process.
    ///
    /// # Errors
    /// [`OutOfMemory`] when frames run out. Frames taken so far are
    /// returned.
    pub fn clone_for_fork(&self, policy: ForkPolicy) -> Result<Self, OutOfMemory> {
        let mut table = TranslationTable::new(self.table.len());
        let stack = self.stack_vpns();
        for entry in self.table.iter() {
            let vpn = entry.virtual_page_number();
            let Some(frame) = entry.frame() else {
                continue;
            };
            if stack.contains(&vpn) || self.is_file_backed(vpn) {
                continue;
            }
            let read_only = entry.is_read_only();
            let frame = if policy == ForkPolicy::Share && read_only {
                frame.clone()
            } else {
                let copy = self.frames.allocate()?;
                copy.copy_from(frame);
                copy
            };
            debug!(FORK, "vpn {} -> frame {:?}", vpn, frame.id());
            table.map(vpn, frame, read_only);
        }
        for vpn in stack {
            table.map(vpn, self.frames.allocate()?, false);
        }
        Ok(Self {
            table,
            areas: self.areas.clone(),
            shared_pages: self.shared_pages,
            stack_pages: self.stack_pages,
            next_vpn: self.next_vpn,
            mapped_files: self.mapped_files.clone(),
            frames: self.frames.clone(),
            stats: self.stats.clone(),
        })
    }

    fn add_area(&mut self, pages: usize, loader: Arc<dyn MmLoader>) -> usize {
        let start_vpn = self.next_vpn;
        if pages > 0 {
            self.table.grow_to(start_vpn + pages - 1);
            self.areas.push(VmArea {
                start_vpn,
                pages,
                loader,
            });
            self.next_vpn += pages;
        }
        start_vpn
    }

    /// Grow the address space by `bytes`, rounded up to whole pages.
    ///
    /// The new pages are zero-filled on first touch. Returns the first new
    /// page and the number of pages added.
    pub fn extend(&mut self, bytes: usize) -> (usize, usize) {
        let pages = round_to_page(bytes) / PAGE_SIZE;
        let start_vpn = self.add_area(pages, Arc::new(AnonLoader {}));
        debug!(MEMORY, "extend by {} pages from vpn {}", pages, start_vpn);
        (start_vpn, pages)
    }

    /// Map `file` after the end of the address space.
    ///
    /// Pages are read from the file on first touch. Returns the start address
    /// and the size of the file.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] when the file is empty.
    pub fn map_file(
        &mut self,
        name: &str,
        file: Arc<dyn BackingFile>,
    ) -> Result<(Va, usize), KernelError> {
        let size = file.len();
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pages = round_to_page(size) / PAGE_SIZE;
        let start_vpn = self.next_vpn;
        let start_vpn = self.add_area(pages, Arc::new(FileBackedLoader::new(file, start_vpn)));
        let start_addr = Va::from_vpn(start_vpn);
        self.mapped_files.push(MappedFile {
            name: name.to_string(),
            start_addr,
            allocated_size: pages * PAGE_SIZE,
        });
        debug!(MEMORY, "mapped {} at {:?}", name, start_addr);
        Ok((start_addr, size))
    }

    fn release_area(&mut self, area: &VmArea) -> Result<usize, KernelError> {
        let mut result = Ok(());
        let mut released = 0;
        for vpn in area.vpns() {
            let Some(entry) = self.table.get(vpn) else {
                continue;
            };
            if let Some(frame) = entry.frame().filter(|_| entry.flags().contains(PteFlags::DIRTY)) {
                let mut page = [0; PAGE_SIZE];
                frame.read(&mut page);
                result = result.and(area.loader.write_back(vpn, &page));
            }
            if self.table.unmap(vpn).is_some() {
                released += 1;
            }
        }
        result.map(|_| released)
    }

    /// Remove the file mapped at `start_addr`.
    ///
    /// Modified pages are written back to the file and every frame of the
    /// mapping is released. The pages of the mapping stay in the page table
    /// as invalid entries. Returns the number of frames released.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] when no file is mapped there.
    pub fn unmap(&mut self, start_addr: Va) -> Result<usize, KernelError> {
        let idx = self
            .mapped_files
            .iter()
            .position(|m| m.start_addr == start_addr)
            .ok_or(KernelError::InvalidArgument)?;
        let start_vpn = start_addr.page_number();
        let area_idx = self
            .areas
            .iter()
            .position(|area| area.start_vpn == start_vpn)
            .ok_or(KernelError::InvalidArgument)?;
        let mapped = self.mapped_files.remove(idx);
        let area = self.areas.remove(area_idx);
        debug!(MEMORY, "unmap {} at {:?}", mapped.name, mapped.start_addr);
        self.release_area(&area)
    }

    /// Release every frame of the address space.
    ///
    /// Modified pages of mapped files are written back first. Calling this
    /// again releases nothing. Returns the number of frames released.
    pub fn free(&mut self) -> usize {
        let mapped: Vec<VmArea> = self
            .mapped_files
            .iter()
            .filter_map(|m| self.area_of(m.start_addr.page_number()).cloned())
            .collect();
        let mut released = 0;
        for area in mapped.iter() {
            // The program is gone; a failed write back has no one to report to.
            released += self.release_area(area).unwrap_or(0);
        }
        released += self.table.clear();
        debug!(MEMORY, "freed {} frames", released);
        released
    }

    /// Save the state of the address space on a context switch.
    ///
    /// There is nothing to save: the page table lives in the address space.
    pub fn save_state(&self) {}
}

/// An address space shared between the kernel and the CPU it runs on.
///
/// This is what the CPU sees as its page table.
pub struct UserSpace {
    inner: SpinLock<AddressSpace>,
}

impl UserSpace {
    /// Wrap `space`.
    pub fn new(space: AddressSpace) -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(space),
        })
    }

    /// Run `f` with the address space locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> R {
        let mut guard = self.inner.lock();
        let r = f(&mut guard);
        guard.unlock();
        r
    }

    /// Save the state of the address space on a context switch.
    pub fn save_state(&self) {
        self.with(|space| space.save_state())
    }

    /// Install the address space as the page table of `cpu`.
    pub fn restore_state(self: &Arc<Self>, cpu: &Cpu) {
        cpu.set_page_table(Some(self.clone() as Arc<dyn Mmu>));
    }
}

impl Mmu for UserSpace {
    fn translate(&self, va: Va, size: usize, is_write: bool) -> Result<Pa, ExceptionType> {
        self.with(|space| space.translate(va, size, is_write))
            .map_err(ExceptionType::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::MemFile,
        userprog::noff::{NOFF_HEADER_SIZE, Segment},
    };
    use machine::memory::MainMemory;

    fn program(code: u32, init: u32, uninit: u32) -> Arc<MemFile> {
        let header = NoffHeader {
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
        };
        let mut image = header.to_bytes().to_vec();
        image.extend((0..code + init).map(|i| (i % 200) as u8 + 1));
        Arc::new(MemFile::new(image))
    }

    fn setup(pages: usize, paging: PagingPolicy) -> (Arc<FrameAllocator>, Arc<Statistics>, SystemConfiguration) {
        let frames = FrameAllocator::new(Arc::new(MainMemory::new(pages)));
        let config = SystemConfiguration::builder()
            .num_phys_pages(pages)
            .paging(paging)
            .user_stack_size(2 * PAGE_SIZE)
            .build()
            .unwrap();
        (frames, Arc::new(Statistics::default()), config)
    }

    #[test]
    fn lazy_exec_only_loads_the_stack() {
        let (frames, stats, config) = setup(16, PagingPolicy::Lazy);
        let mut space = AddressSpace::exec(program(200, 100, 50), &frames, &stats, &config).unwrap();
        assert_eq!(space.shared_pages(), 4);
        assert_eq!(space.pages(), 6);
        assert_eq!(space.table().resident_pages(), 2);

        let pa = space.translate(Va::new(130), 1, false).unwrap();
        let mut byte = [0];
        frames.memory().read(pa, &mut byte);
        assert_eq!(byte[0], 131);
        assert_eq!(stats.page_faults(), 1);
        // Second access hits.
        space.translate(Va::new(131), 1, false).unwrap();
        assert_eq!(stats.page_faults(), 1);

        let mut regs = Registers::new();
        space.init_registers(&mut regs);
        assert_eq!(*regs.sp(), (6 * PAGE_SIZE) as i32);
        assert_eq!(*regs.next_pc(), 4);
    }

    #[test]
    fn eager_exec_loads_everything() {
        let (frames, stats, config) = setup(16, PagingPolicy::Eager);
        let mut space = AddressSpace::exec(program(200, 100, 50), &frames, &stats, &config).unwrap();
        assert_eq!(space.table().resident_pages(), 6);
        assert_eq!(frames.free_count(), 10);
        space.translate(Va::new(300), 4, true).unwrap();
        assert_eq!(stats.page_faults(), 0);
        assert_eq!(space.free(), 6);
        assert_eq!(space.free(), 0);
        assert_eq!(frames.free_count(), 16);
    }

    #[test]
    fn translation_faults() {
        let (frames, stats, config) = setup(16, PagingPolicy::Lazy);
        let mut space = AddressSpace::exec(program(200, 100, 50), &frames, &stats, &config).unwrap();
        assert_eq!(space.translate(Va::new(2), 4, false), Err(Fault::Alignment));
        assert_eq!(space.translate(Va::new(0), 3, false), Err(Fault::Alignment));
        assert_eq!(
            space.translate(Va::new(6 * PAGE_SIZE), 1, false),
            Err(Fault::OutOfRange)
        );
        assert_eq!(space.translate(Va::new(0), 4, true), Err(Fault::ReadOnlyViolation));
        // The page shared by code and data stays writable.
        assert!(space.translate(Va::new(PAGE_SIZE), 4, true).is_ok());
        let entry = space.table().get(1).unwrap();
        assert!(entry.flags().contains(PteFlags::USED | PteFlags::DIRTY));
    }

    #[test]
    fn exec_without_memory_returns_frames() {
        let (frames, stats, config) = setup(6, PagingPolicy::Eager);
        let taken = frames.allocate().unwrap();
        assert_eq!(
            AddressSpace::exec(program(200, 100, 50), &frames, &stats, &config).err(),
            Some(KernelError::NoMemory)
        );
        assert_eq!(frames.free_count(), 5);
        drop(taken);

        // Larger than memory: rejected before any frame is taken.
        let (frames, stats, config) = setup(5, PagingPolicy::Lazy);
        assert_eq!(
            AddressSpace::exec(program(200, 100, 50), &frames, &stats, &config).err(),
            Some(KernelError::NoMemory)
        );
        assert_eq!(frames.free_count(), 5);
    }

    #[test]
    fn virtual_memory_crosses_pages() {
        let (frames, stats, config) = setup(16, PagingPolicy::Lazy);
        let mut space = AddressSpace::exec(program(100, 0, 0), &frames, &stats, &config).unwrap();
        let (start, pages) = space.extend(2 * PAGE_SIZE);
        assert_eq!((start, pages), (3, 2));
        let va = Va::from_vpn(start) + (PAGE_SIZE - 3);
        space.write_virtual_memory(va, b"hello").unwrap();
        let mut buf = [0; 5];
        space.read_virtual_memory(va, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn fork_copies_or_shares_code() {
        let (frames, stats, config) = setup(32, PagingPolicy::Eager);
        let space = AddressSpace::exec(program(200, 100, 50), &frames, &stats, &config).unwrap();
        let code = space.table().get(0).unwrap().physical_page_number().unwrap();

        let copy = space.clone_for_fork(ForkPolicy::Copy).unwrap();
        assert_ne!(copy.table().get(0).unwrap().physical_page_number(), Some(code));
        let share = space.clone_for_fork(ForkPolicy::Share).unwrap();
        assert_eq!(share.table().get(0).unwrap().physical_page_number(), Some(code));
        assert_eq!(frames.ref_count(code), 2);
        // Writable pages are never shared.
        assert_ne!(
            share.table().get(1).unwrap().physical_page_number(),
            space.table().get(1).unwrap().physical_page_number()
        );
        drop(share);
        assert_eq!(frames.ref_count(code), 1);
    }

    #[test]
    fn mapped_file_is_written_back() {
        let (frames, stats, config) = setup(16, PagingPolicy::Lazy);
        let mut space = AddressSpace::exec(program(100, 0, 0), &frames, &stats, &config).unwrap();
        let file = Arc::new(MemFile::new(vec![b'a'; 200]));
        let (start, size) = space.map_file("data", file.clone()).unwrap();
        assert_eq!(size, 200);
        assert_eq!(start, Va::from_vpn(3));
        assert_eq!(space.mapped_files()[0].allocated_size, 2 * PAGE_SIZE);

        space.write_virtual_memory(start + 150, b"zz").unwrap();
        let free = frames.free_count();
        assert_eq!(space.unmap(start), Ok(1));
        assert_eq!(frames.free_count(), free + 1);
        assert_eq!(&file.contents()[150..152], b"zz");
        assert_eq!(file.len(), 200);
        assert_eq!(space.unmap(start), Err(KernelError::InvalidArgument));
        assert_eq!(
            space.map_file("empty", Arc::new(MemFile::new(Vec::new()))),
            Err(KernelError::InvalidArgument)
        );
    }
}
