use std::sync::Arc;
use std::thread;

use machine::Tlb;
use vm_kernel::{AddressSpace, AddressSpaceKind, ByteImage, MemoryManager, Pid};

const PAGE_SIZE: usize = 256;
const MEMORY_CAPACITY: usize = PAGE_SIZE * 8;
const SWAP_CAPACITY: usize = PAGE_SIZE * 16;

type Manager = MemoryManager<PAGE_SIZE, MEMORY_CAPACITY, SWAP_CAPACITY>;
type Space = AddressSpace<PAGE_SIZE, MEMORY_CAPACITY, SWAP_CAPACITY>;

/// A little workload: each "process" dirties its heap pages, reads them
/// back through the translation cache, and checks nothing was lost while
/// its neighbours fought it for the same eight frames.
fn run_process(space: Space, pid: Pid) {
    let mut tlb = Tlb::new(4);
    let heap_base = space.stack_and_arg_boundary();

    for round in 0..4u32 {
        for page in 0..6u32 {
            let vpn = heap_base + page;
            let vaddr = vpn * PAGE_SIZE as u32;
            let payload = [(pid as u8) ^ (round as u8) ^ (page as u8); 16];
            space.write_virtual(vaddr, &payload).unwrap();
        }
        for page in 0..6u32 {
            let vpn = heap_base + page;
            let vaddr = vpn * PAGE_SIZE as u32;
            space.handle_tlb_miss(&mut tlb, vaddr, false).unwrap();
            let mut readback = [0u8; 16];
            space.read_virtual(vaddr, &mut readback).unwrap();
            assert_eq!(readback, [(pid as u8) ^ (round as u8) ^ (page as u8); 16]);
        }
        // give the CPU away; the cache does not survive the switch
        space.save_state(&mut tlb);
        thread::yield_now();
        space.restore_state();
    }
    space.release();
}

fn main() {
    env_logger::init();

    let manager: Arc<Manager> = Manager::new("demo").unwrap();

    let mut image = ByteImage::new();
    image.push_section(true, vec![b"demo text section".to_vec()]);
    let image: Arc<ByteImage> = Arc::new(image);

    let mut workers = Vec::new();
    for pid in 1..=3 {
        let space = Space::new(
            manager.clone(),
            pid,
            image.clone(),
            AddressSpaceKind::DemandPaged,
            6,
        )
        .unwrap();
        workers.push(thread::spawn(move || run_process(space, pid)));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = manager.stats();
    println!(
        "faults: {}, evictions: {}, swap outs: {}, swap ins: {}",
        stats.faults, stats.evictions, stats.swap_outs, stats.swap_ins
    );
    manager.terminate();
}
