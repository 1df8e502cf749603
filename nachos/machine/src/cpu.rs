//! Simulated CPUs.
//!
//! A [`Cpu`] holds the state that the kernel switches when it switches
//! threads: the register file and the page table. It also owns a timer and a
//! queue of interrupts raised but not yet delivered.

use crate::{
    addressing::{Pa, Va},
    exception::ExceptionType,
    interrupt::{InterruptGuard, InterruptState},
    registers::Registers,
    spinlock::SpinLock,
    timer::Timer,
};
use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_queue::SegQueue;
use std::sync::Arc;

/// Memory management unit as seen by a CPU.
///
/// The kernel installs one of these on a CPU when it dispatches a user
/// thread. Every user memory access goes through [`Mmu::translate`].
pub trait Mmu: Send + Sync {
    /// Translate the virtual address `va` of an access of `size` bytes.
    ///
    /// Returns the physical address to access, or the exception that the CPU
    /// raises.
    fn translate(&self, va: Va, size: usize, is_write: bool) -> Result<Pa, ExceptionType>;
}

/// Identifier of a CPU.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CpuId(usize);

impl CpuId {
    /// The boot CPU.
    pub const BOOT: CpuId = CpuId(0);

    /// Create a CPU id.
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Cast into a raw index.
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for CpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Hardware interrupt lines.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Irq {
    /// The periodic timer.
    Timer,
}

/// A simulated CPU.
pub struct Cpu {
    id: CpuId,
    registers: SpinLock<Registers>,
    page_table: SpinLock<Option<Arc<dyn Mmu>>>,
    /// Timer of this CPU.
    pub timer: Timer,
    pending: SegQueue<Irq>,
    yield_on_return: AtomicBool,
    idle: AtomicBool,
    in_kernel: AtomicBool,
}

/// A context runs kernel code on behalf of the thread of a [`Cpu`].
///
/// While it lives, no other context enters the kernel on that CPU, so the
/// thread running there cannot be switched out from under it. Leaving is
/// dropping it.
pub struct KernelEntry<'a> {
    cpu: &'a Cpu,
}

impl Drop for KernelEntry<'_> {
    fn drop(&mut self) {
        self.cpu.in_kernel.store(false, Ordering::Release);
    }
}

impl Cpu {
    /// Create an idle CPU whose timer fires every `interval` ticks.
    pub fn new(id: CpuId, interval: u64) -> Self {
        Self {
            id,
            registers: SpinLock::new(Registers::new()),
            page_table: SpinLock::new(None),
            timer: Timer::new(interval),
            pending: SegQueue::new(),
            yield_on_return: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            in_kernel: AtomicBool::new(false),
        }
    }

    /// The id of this CPU.
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Read register `index`.
    pub fn read_register(&self, index: usize) -> i32 {
        let guard = self.registers.lock();
        let value = guard[index];
        guard.unlock();
        value
    }

    /// Write `value` to register `index`.
    pub fn write_register(&self, index: usize, value: i32) {
        let mut guard = self.registers.lock();
        guard[index] = value;
        guard.unlock();
    }

    /// A copy of the whole register file.
    pub fn registers(&self) -> Registers {
        let guard = self.registers.lock();
        let regs = *guard;
        guard.unlock();
        regs
    }

    /// Overwrite the whole register file.
    pub fn set_registers(&self, regs: &Registers) {
        let mut guard = self.registers.lock();
        *guard = *regs;
        guard.unlock();
    }

    /// Install `page_table` as the current translation of the CPU.
    pub fn set_page_table(&self, page_table: Option<Arc<dyn Mmu>>) {
        let mut guard = self.page_table.lock();
        *guard = page_table;
        guard.unlock();
    }

    /// The page table installed on the CPU.
    pub fn page_table(&self) -> Option<Arc<dyn Mmu>> {
        let guard = self.page_table.lock();
        let page_table = guard.clone();
        guard.unlock();
        page_table
    }

    /// Raise `irq` on this CPU. It stays pending until serviced.
    pub fn raise(&self, irq: Irq) {
        self.pending.push(irq);
    }

    /// Whether an interrupt is pending.
    pub fn has_pending_interrupts(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Deliver the pending interrupts to their handlers.
    ///
    /// Nothing is delivered when the current context has interrupts masked;
    /// the interrupts stay pending. Returns whether a handler asked to yield
    /// the interrupted thread on return from the interrupt.
    pub fn service_interrupts(&self) -> bool {
        if InterruptState::current() == InterruptState::Off {
            return false;
        }
        let guard = InterruptGuard::new();
        while let Some(irq) = self.pending.pop() {
            match irq {
                Irq::Timer => {
                    if let Some(handler) = self.timer.handler() {
                        handler.handle_interrupt(self);
                    }
                }
            }
        }
        drop(guard);
        self.yield_on_return.swap(false, Ordering::SeqCst)
    }

    /// Enter the kernel on this CPU, waiting for another context to leave.
    pub fn enter_kernel(&self) -> KernelEntry<'_> {
        loop {
            if let Some(entry) = self.try_enter_kernel() {
                return entry;
            }
            core::hint::spin_loop();
        }
    }

    /// Enter the kernel on this CPU unless another context is in it.
    pub fn try_enter_kernel(&self) -> Option<KernelEntry<'_>> {
        self.in_kernel
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| KernelEntry { cpu: self })
    }

    /// Whether some context is in the kernel on this CPU.
    pub fn is_in_kernel(&self) -> bool {
        self.in_kernel.load(Ordering::Acquire)
    }

    /// Ask to yield the running thread once the current interrupt handler
    /// returns.
    pub fn request_yield_on_return(&self) {
        self.yield_on_return.store(true, Ordering::SeqCst);
    }

    /// Mark the CPU as idle or busy.
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    /// Whether the CPU runs no thread.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }
}
