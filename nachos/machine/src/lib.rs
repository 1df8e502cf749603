//! The machine underneath the kernel.
//!
//! This crate simulates the hardware that the Nachos kernel runs on: a
//! handful of CPUs, each with a MIPS-style register file, a page-table
//! register and a periodic timer, plus a flat array of physical memory.
//! It does not interpret instructions. User-mode memory accesses are issued
//! explicitly through [`Machine::read_mem`] and [`Machine::write_mem`], which
//! walk the page table installed on the CPU exactly as the instruction
//! fetch/load/store path of a real machine would.
//!
//! Most of the kernel only needs a few pieces of this crate:
//! - [`spinlock::SpinLock`], the low-level lock that masks interrupts while
//!   held,
//! - [`interrupt::InterruptGuard`] and [`interrupt::InterruptState`],
//! - the [`cpu::Cpu`] handle for registers, the page table and the timer,
//! - the printing macros in [`kprint`].
//!
//! Nothing in here knows about threads or processes; those belong to the
//! kernel.

use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_utils::CachePadded;
use std::sync::Arc;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod cpu;
pub mod exception;
pub mod interrupt;
pub mod memory;
pub mod registers;
pub mod spinlock;
pub mod stats;
pub mod timer;

use addressing::Va;
use cpu::{Cpu, CpuId, Irq};
use exception::ExceptionType;
use memory::MainMemory;
use stats::Statistics;

/// Maximum number of CPU the machine can have.
pub const MAX_CPU: usize = 4;

#[doc(hidden)]
pub static QUITE: AtomicBool = AtomicBool::new(false);

/// The simulated machine.
///
/// A [`Machine`] owns its CPUs, the main memory and the statistics counters.
/// The kernel holds it behind an [`Arc`] and passes [`CpuId`]s around instead
/// of asking "which CPU am I on".
pub struct Machine {
    cpus: Vec<CachePadded<Cpu>>,
    memory: Arc<MainMemory>,
    stats: Arc<Statistics>,
    halted: AtomicBool,
}

impl Machine {
    /// Build a machine with `num_cpus` CPUs and `num_phys_pages` frames of
    /// main memory. Every CPU timer fires each `timer_interval` ticks once
    /// started.
    pub fn new(num_cpus: usize, num_phys_pages: usize, timer_interval: u64) -> Self {
        assert!(
            num_cpus > 0 && num_cpus <= MAX_CPU,
            "Unsupported number of CPUs: {num_cpus}"
        );
        Self {
            cpus: (0..num_cpus)
                .map(|id| CachePadded::new(Cpu::new(CpuId::new(id), timer_interval)))
                .collect(),
            memory: Arc::new(MainMemory::new(num_phys_pages)),
            stats: Arc::new(Statistics::default()),
            halted: AtomicBool::new(false),
        }
    }

    /// Get the CPU with `id`.
    #[track_caller]
    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id.into_usize()]
    }

    /// Iterate over every CPU of the machine.
    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter().map(|cpu| &**cpu)
    }

    /// Number of CPUs.
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// The main memory of the machine.
    pub fn memory(&self) -> &Arc<MainMemory> {
        &self.memory
    }

    /// The statistics counters of the machine.
    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Advance the simulated clock by one timer interval.
    ///
    /// Every CPU whose timer is running gets a timer interrupt raised. The
    /// interrupt is delivered at the next call to
    /// [`Cpu::service_interrupts`].
    pub fn advance_clock(&self) {
        if self.is_halted() {
            return;
        }
        if let Some(cpu) = self.cpus.first() {
            self.stats.add_ticks(cpu.timer.interval());
        }
        for cpu in self.cpus() {
            if cpu.timer.is_running() {
                cpu.raise(Irq::Timer);
            }
        }
    }

    /// Load `size` bytes at user virtual address `va` on `cpu`.
    ///
    /// The address goes through the page table installed on the CPU. A
    /// translation failure is reported as the exception that the CPU would
    /// raise.
    pub fn read_mem(&self, cpu: CpuId, va: Va, size: usize) -> Result<u32, ExceptionType> {
        let mmu = self
            .cpu(cpu)
            .page_table()
            .ok_or(ExceptionType::BusError)?;
        let pa = mmu.translate(va, size, false)?;
        Ok(self.memory.read_word(pa, size))
    }

    /// Store the low `size` bytes of `value` at user virtual address `va` on
    /// `cpu`.
    pub fn write_mem(
        &self,
        cpu: CpuId,
        va: Va,
        size: usize,
        value: u32,
    ) -> Result<(), ExceptionType> {
        let mmu = self
            .cpu(cpu)
            .page_table()
            .ok_or(ExceptionType::BusError)?;
        let pa = mmu.translate(va, size, true)?;
        self.memory.write_word(pa, size, value);
        Ok(())
    }

    /// Stop every timer and mark the machine as halted.
    pub fn halt(&self) {
        for cpu in self.cpus() {
            cpu.timer.stop();
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Whether the machine was halted.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}
