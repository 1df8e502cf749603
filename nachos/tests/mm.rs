mod common;

use machine::{cpu::CpuId, memory::MainMemory};
use nachos::{
    mm::{FrameAllocator, FrameId, OutOfMemory},
    userprog::{
        address_space::{ForkPolicy, PagingPolicy},
        syscall::SyscallNumber,
    },
};
use std::{collections::BTreeSet, sync::Arc};

fn allocator(pages: usize) -> Arc<FrameAllocator> {
    FrameAllocator::new(Arc::new(MainMemory::new(pages)))
}

/// Four frames are handed out once each; the fifth allocation fails and a
/// freed frame is the next one handed out.
#[test]
fn exhaust_and_reuse() {
    let frames = allocator(4);
    let mut held: Vec<_> = (0..4).map(|_| frames.allocate().unwrap()).collect();
    let ids: BTreeSet<FrameId> = held.iter().map(|f| f.id()).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(frames.allocate().err(), Some(OutOfMemory));
    assert_eq!(frames.free_count(), 0);

    let victim = held.remove(2);
    let id = victim.id();
    frames.free(victim);
    assert!(frames.is_free(id));
    assert_eq!(frames.allocate().unwrap().id(), id);
}

/// Frames go back to the pool in the order they were freed.
#[test]
fn free_list_is_fifo() {
    let frames = allocator(3);
    let a = frames.allocate().unwrap();
    let b = frames.allocate().unwrap();
    let (ida, idb) = (a.id(), b.id());
    drop(b);
    drop(a);
    let c = frames.allocate().unwrap();
    assert_eq!(c.id().into_usize(), 2);
    let again = frames.allocate().unwrap();
    assert_eq!(again.id(), idb);
    let _d = frames.allocate().unwrap();
    assert_eq!(frames.free_count(), 0);
    assert!(!frames.is_free(ida));
}

/// A frame is either free or referenced, never both, across concurrent
/// allocations from several host threads.
#[test]
fn concurrent_allocation_accounting() {
    let frames = allocator(64);
    let held = crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let frames = frames.clone();
                s.spawn(move |_| {
                    let mut mine = Vec::new();
                    for round in 0..200 {
                        if round % 3 == 2 {
                            mine.pop();
                        } else if let Ok(frame) = frames.allocate() {
                            mine.push(frame);
                        }
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    // Checked while the frames are still held.
    let unique: BTreeSet<FrameId> = held.iter().map(|f| f.id()).collect();
    assert_eq!(unique.len(), held.len());
    assert!(unique.iter().all(|id| !frames.is_free(*id)));
    assert_eq!(frames.free_count() + held.len(), frames.total());

    drop(held);
    assert_eq!(frames.free_count(), 64);
}

/// Running, forking and exiting programs leaves every frame free.
#[test]
fn frames_return_after_exit() {
    let kernel = common::boot(
        common::config()
            .num_phys_pages(64)
            .fork(ForkPolicy::Share)
            .paging(PagingPolicy::Eager),
        &[("prog", common::noff_image(&[1; 300], &[2; 100], 60))],
    );
    let total = kernel.frames().total();
    kernel.spawn_program("prog", None).unwrap();
    let used = total - kernel.frames().free_count();
    // 3 code + 2 data + 2 stack pages.
    assert_eq!(used, 7);

    let cpu = CpuId::BOOT;
    let child = kernel.syscall(cpu, SyscallNumber::Fork, &[0]).unwrap();
    assert_eq!(child, 1);
    // The child shares the 3 code frames.
    assert_eq!(total - kernel.frames().free_count(), 7 + 4);

    kernel.exit_process(cpu, 0);
    assert_eq!(total - kernel.frames().free_count(), 7);
    kernel.exit_process(cpu, 0);
    assert_eq!(kernel.frames().free_count(), total);
    assert!(kernel.machine().is_halted());
}
