use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info};
use machine::PhysicalMemory;
use swap::SwapFile;

use crate::addr_space::PageTableEntry;
use crate::frame_table::FrameTable;
use crate::swap_store::SwapStore;
use crate::Pid;

/// Counters over the life of the manager, mostly for tests and the demo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingStats {
    pub faults: u64,
    pub evictions: u64,
    pub swap_ins: u64,
    pub swap_outs: u64,
}

/// Everything the global memory lock protects. Frame ownership, page-table
/// mappings, and swap bookkeeping move together: a fault or eviction
/// updates all three inside one critical section, so no two threads can
/// claim the same frame or the same slot.
pub(crate) struct CoreState {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapStore,
    pub(crate) tables: HashMap<Pid, Vec<PageTableEntry>>,
    pub(crate) stats: PagingStats,
}

/// The machine-wide memory system: physical memory, the swap file, and the
/// shared state behind the single global memory lock. Built once and handed
/// to every process at creation time.
pub struct MemoryManager<
    const PAGE_SIZE: usize,
    const MEMORY_CAPACITY: usize,
    const SWAP_CAPACITY: usize,
> {
    pub(crate) memory: PhysicalMemory<PAGE_SIZE, MEMORY_CAPACITY>,
    pub(crate) swap_file: SwapFile<PAGE_SIZE, SWAP_CAPACITY>,
    pub(crate) state: Mutex<CoreState>,
    /// Signalled on every unpin; waited on for transfer-pin capacity and by
    /// evictors that found every frame pinned.
    pub(crate) pin_available: Condvar,
    /// Signalled when a swap slot returns to the free list.
    pub(crate) slot_available: Condvar,
    /// Signalled when an in-flight slot write settles.
    pub(crate) slot_idle: Condvar,
}

impl<const PAGE_SIZE: usize, const MEMORY_CAPACITY: usize, const SWAP_CAPACITY: usize>
    MemoryManager<PAGE_SIZE, MEMORY_CAPACITY, SWAP_CAPACITY>
{
    pub fn new(swap_name: &str) -> Result<Arc<Self>, std::io::Error> {
        let memory = PhysicalMemory::new();
        let swap_file = SwapFile::create(swap_name)?;
        info!(
            "memory manager up: {} frames of {} bytes, {} swap slots",
            Self::frame_count(),
            PAGE_SIZE,
            Self::slot_count()
        );
        Ok(Arc::new(Self {
            memory,
            swap_file,
            state: Mutex::new(CoreState {
                frames: FrameTable::new(Self::frame_count()),
                swap: SwapStore::new(Self::slot_count()),
                tables: HashMap::new(),
                stats: PagingStats::default(),
            }),
            pin_available: Condvar::new(),
            slot_available: Condvar::new(),
            slot_idle: Condvar::new(),
        }))
    }

    pub const fn frame_count() -> usize {
        MEMORY_CAPACITY / PAGE_SIZE
    }

    pub const fn slot_count() -> usize {
        SWAP_CAPACITY / PAGE_SIZE
    }

    pub fn memory(&self) -> &PhysicalMemory<PAGE_SIZE, MEMORY_CAPACITY> {
        &self.memory
    }

    pub fn stats(&self) -> PagingStats {
        self.state.lock().unwrap().stats
    }

    pub fn swap_slots_free(&self) -> usize {
        self.state.lock().unwrap().swap.slots_free()
    }

    pub fn frame_owner(&self, frame: usize) -> Option<(Pid, u32)> {
        self.state.lock().unwrap().frames.owner(frame)
    }

    pub(crate) fn register_table(&self, pid: Pid, table: Vec<PageTableEntry>) {
        let mut state = self.state.lock().unwrap();
        let prev = state.tables.insert(pid, table);
        assert!(prev.is_none(), "process {} already has a page table", pid);
    }

    pub(crate) fn entry_snapshot(&self, pid: Pid, vpn: u32) -> Option<PageTableEntry> {
        let state = self.state.lock().unwrap();
        state.tables.get(&pid)?.get(vpn as usize).copied()
    }

    /// Merge used/dirty bits saved out of the translation cache into the
    /// page table. Ignored if the page moved in the meantime; the bits
    /// belonged to a mapping that no longer exists.
    pub(crate) fn sync_entry_bits(&self, pid: Pid, vpn: u32, frame: u32, used: bool, dirty: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state
            .tables
            .get_mut(&pid)
            .and_then(|t| t.get_mut(vpn as usize))
        {
            if entry.valid && entry.frame == frame {
                entry.used |= used;
                entry.dirty |= dirty;
            }
        }
    }

    pub(crate) fn unpin_page(&self, pid: Pid, vpn: u32) {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .tables
            .get(&pid)
            .and_then(|t| t.get(vpn as usize))
            .copied();
        if let Some(entry) = entry {
            if entry.valid {
                state.frames.unpin(entry.frame as usize);
                self.pin_available.notify_all();
            }
        }
    }

    /// Tear down an exiting process: wait out any transfer or swap I/O
    /// still pinning its frames, then free its frames, swap slots, and
    /// page table in one critical section.
    pub fn release_address_space(&self, pid: Pid) {
        let mut state = self.state.lock().unwrap();
        loop {
            let pinned = (0..state.frames.frame_count()).any(|f| {
                matches!(state.frames.owner(f), Some((p, _)) if p == pid)
                    && state.frames.is_pinned(f)
            });
            if !pinned {
                break;
            }
            state = self.pin_available.wait(state).unwrap();
        }
        for frame in 0..state.frames.frame_count() {
            if matches!(state.frames.owner(frame), Some((p, _)) if p == pid) {
                state.frames.clear_owner(frame);
            }
        }
        let freed = state.swap.release_all(pid);
        if freed > 0 {
            self.slot_available.notify_all();
        }
        state.tables.remove(&pid);
        debug!(
            "released address space of process {} ({} swap slots freed)",
            pid, freed
        );
    }

    /// Shut the memory system down, removing the swap backing file.
    pub fn terminate(&self) {
        let name = self.swap_file.name().to_owned();
        if let Err(err) = SwapFile::<PAGE_SIZE, SWAP_CAPACITY>::delete(&name) {
            debug!("could not remove swap file {}: {}", name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 64;

    #[test]
    fn table_registration_and_snapshots() {
        let manager =
            MemoryManager::<PAGE, { PAGE * 2 }, { PAGE * 2 }>::new("test_manager_register")
                .unwrap();
        manager.register_table(7, vec![PageTableEntry::invalid(0, false)]);
        assert!(!manager.entry_snapshot(7, 0).unwrap().valid);
        assert_eq!(manager.entry_snapshot(7, 1), None);
        assert_eq!(manager.entry_snapshot(8, 0), None);
        manager.release_address_space(7);
        assert_eq!(manager.entry_snapshot(7, 0), None);
        manager.terminate();
    }

    #[test]
    fn sync_bits_require_a_matching_mapping() {
        let manager =
            MemoryManager::<PAGE, { PAGE * 2 }, { PAGE * 2 }>::new("test_manager_sync").unwrap();
        let mut entry = PageTableEntry::invalid(0, false);
        entry.valid = true;
        entry.frame = 1;
        manager.register_table(3, vec![entry]);

        // bits saved against a frame the page no longer sits in are stale
        manager.sync_entry_bits(3, 0, 9, true, true);
        let snapshot = manager.entry_snapshot(3, 0).unwrap();
        assert!(!snapshot.used);
        assert!(!snapshot.dirty);

        manager.sync_entry_bits(3, 0, 1, true, true);
        let snapshot = manager.entry_snapshot(3, 0).unwrap();
        assert!(snapshot.used);
        assert!(snapshot.dirty);
        manager.terminate();
    }
}
