use std::sync::MutexGuard;

use log::{debug, trace};

use crate::addr_space::{PageTableEntry, ProgramImage};
use crate::error::VmError;
use crate::manager::{CoreState, MemoryManager};
use crate::Pid;

/// Which section holds `vpn`, as (section index, page index within it).
pub(crate) fn section_of(image: &dyn ProgramImage, vpn: u32) -> Option<(usize, usize)> {
    for (index, section) in image.sections().iter().enumerate() {
        if vpn >= section.first_vpn && vpn < section.first_vpn + section.page_count {
            return Some((index, (vpn - section.first_vpn) as usize));
        }
    }
    None
}

enum Source {
    Swap(u32),
    Image(usize, usize),
    Zero,
}

impl<const PAGE_SIZE: usize, const MEMORY_CAPACITY: usize, const SWAP_CAPACITY: usize>
    MemoryManager<PAGE_SIZE, MEMORY_CAPACITY, SWAP_CAPACITY>
{
    /// Resolve a translation for `(pid, vpn)`, faulting the page in if it
    /// is not resident. With `pin` set the frame is handed back still
    /// pinned, for a caller-side transfer.
    ///
    /// Bounds and protection are checked before any frame is touched: a
    /// write against a read-only page allocates nothing and installs
    /// nothing.
    pub(crate) fn resolve(
        &self,
        pid: Pid,
        vpn: u32,
        is_write: bool,
        pin: bool,
        image: &dyn ProgramImage,
    ) -> Result<PageTableEntry, VmError> {
        let mut state = self.state.lock().unwrap();

        let entry = match state.tables.get(&pid).and_then(|t| t.get(vpn as usize)) {
            Some(entry) => *entry,
            None => return Err(VmError::AddressOutOfRange { vpn }),
        };
        if entry.read_only && is_write {
            return Err(VmError::WriteToReadOnly { vpn });
        }

        if pin {
            // a transfer pin must leave at least one frame evictable
            while state.frames.pinned_frames() + 1 >= state.frames.frame_count() {
                state = self.pin_available.wait(state).unwrap();
            }
        }

        // re-read: the page may have moved while we waited for capacity
        let entry = state.tables[&pid][vpn as usize];
        if entry.valid {
            let frame = entry.frame as usize;
            if pin {
                state.frames.pin(frame);
            }
            let entry = &mut state.tables.get_mut(&pid).unwrap()[vpn as usize];
            entry.used = true;
            entry.dirty |= is_write;
            return Ok(*entry);
        }

        state.stats.faults += 1;
        debug!("page fault: process {} page {}", pid, vpn);

        let (st, frame) = self.acquire_frame(state)?;
        state = st;

        // pick the data source while the bookkeeping is still ours alone
        let source = loop {
            if let Some(slot) = state.swap.slot_for(pid, vpn) {
                if state.swap.is_busy(slot) {
                    // an evictor is still writing this very slot; if its
                    // write fails it gives the slot back, so look again
                    state = self.slot_idle.wait(state).unwrap();
                    continue;
                }
                break Source::Swap(slot);
            } else if let Some((section, page)) = section_of(image, vpn) {
                break Source::Image(section, page);
            } else {
                break Source::Zero;
            }
        };
        drop(state);

        // the frame is pinned and unowned: nobody else can claim it while
        // we copy without the lock
        let from_swap = match source {
            Source::Swap(slot) => {
                debug!("swap in page {} of process {} from slot {}", vpn, pid, slot);
                match self.swap_file.read_slot(slot as usize) {
                    Ok(bytes) => {
                        self.memory
                            .write_frame(frame, bytes.as_ref())
                            .expect("frame is in range");
                        true
                    }
                    Err(err) => {
                        let mut state = self.state.lock().unwrap();
                        state.frames.unpin(frame);
                        self.pin_available.notify_all();
                        return Err(VmError::SwapIo(err));
                    }
                }
            }
            Source::Image(section, page) => {
                trace!("load page {} of process {} from section {}", vpn, pid, section);
                let mut page_bytes = vec![0u8; PAGE_SIZE];
                image.load_page(section, page, &mut page_bytes);
                self.memory
                    .write_frame(frame, &page_bytes)
                    .expect("frame is in range");
                false
            }
            Source::Zero => {
                self.memory.zero_frame(frame).expect("frame is in range");
                false
            }
        };

        let mut state = self.state.lock().unwrap();
        if from_swap {
            state.swap.release(pid, vpn).expect("slot was mapped");
            self.slot_available.notify_one();
            state.stats.swap_ins += 1;
        }
        // install: page table and frame table move as one
        state.frames.set_owner(frame, pid, vpn);
        let snapshot = {
            let entry = &mut state.tables.get_mut(&pid).unwrap()[vpn as usize];
            entry.frame = frame as u32;
            entry.valid = true;
            entry.used = true;
            // memory now holds the only copy of a swapped-in page; it must
            // be written out again if evicted
            entry.dirty = from_swap || is_write;
            *entry
        };
        if !pin {
            state.frames.unpin(frame);
            self.pin_available.notify_all();
        }
        debug!("installed page {} of process {} at frame {}", vpn, pid, frame);
        Ok(snapshot)
    }

    /// Get a frame to fill: a free one if any, otherwise evict. The frame
    /// comes back pinned and unowned.
    fn acquire_frame<'a>(
        &'a self,
        mut state: MutexGuard<'a, CoreState>,
    ) -> Result<(MutexGuard<'a, CoreState>, usize), VmError> {
        loop {
            if let Some(frame) = state.frames.acquire_free_frame() {
                state.frames.pin(frame);
                return Ok((state, frame));
            }

            let victim = {
                let CoreState { frames, tables, .. } = &mut *state;
                frames.eviction_candidate(|pid, vpn| {
                    let entry = &mut tables.get_mut(&pid).unwrap()[vpn as usize];
                    if entry.used {
                        entry.used = false;
                        true
                    } else {
                        false
                    }
                })
            };
            let Some(victim) = victim else {
                // every frame is pinned right now; wait for an unpin
                state = self.pin_available.wait(state).unwrap();
                continue;
            };

            state.stats.evictions += 1;
            let (vpid, vvpn) = state.frames.owner(victim).expect("victim frame is owned");
            debug!("evict page {} of process {} from frame {}", vvpn, vpid, victim);
            // our pin keeps other evictors off the victim from here on
            state.frames.pin(victim);

            // the victim stays mapped until the eviction can actually go
            // through: unmapping a dirty page before a slot is secured
            // would let a concurrent fault on it zero-fill and lose the
            // only copy
            let ventry = loop {
                let entry = state.tables[&vpid][vvpn as usize];
                let wants_swap = entry.dirty && !entry.read_only;
                if wants_swap && state.swap.slots_free() == 0 {
                    debug!("swap store full, waiting for a free slot");
                    state = self.slot_available.wait(state).unwrap();
                    continue;
                }
                if state.frames.pin_count(victim) > 1 {
                    // a transfer is still copying through the victim
                    state = self.pin_available.wait(state).unwrap();
                    continue;
                }
                break entry;
            };

            // unmap; from here the owner faults instead of touching the
            // frame
            {
                let entry = &mut state.tables.get_mut(&vpid).unwrap()[vvpn as usize];
                entry.valid = false;
                entry.used = false;
                entry.dirty = false;
            }
            state.frames.clear_owner(victim);

            if ventry.dirty && !ventry.read_only {
                let slot = state.swap.allocate(vpid, vvpn).expect("a slot is free");
                state.swap.mark_busy(slot);
                state.stats.swap_outs += 1;
                state = self.swap_out(state, victim, vpid, vvpn, slot)?;
            } else {
                trace!("dropping clean page {} of process {}", vvpn, vpid);
            }
            return Ok((state, victim));
        }
    }

    /// Write the (already unmapped) victim's bytes into its slot. The
    /// mapping was recorded before the lock is dropped, so a fault on the
    /// same page routes to swap-in and then waits on the busy slot instead
    /// of zero-filling.
    fn swap_out<'a>(
        &'a self,
        state: MutexGuard<'a, CoreState>,
        frame: usize,
        pid: Pid,
        vpn: u32,
        slot: u32,
    ) -> Result<MutexGuard<'a, CoreState>, VmError> {
        drop(state);

        debug!("swap out page {} of process {} to slot {}", vpn, pid, slot);
        let bytes = self.memory.read_frame(frame).expect("frame is in range");
        let result = self.swap_file.write_slot(slot as usize, bytes.as_ref());

        let mut state = self.state.lock().unwrap();
        state.swap.clear_busy(slot);
        self.slot_idle.notify_all();

        if let Err(err) = result {
            // media failure: undo the claim and surface the error
            state.swap.release(pid, vpn);
            self.slot_available.notify_one();
            state.frames.unpin(frame);
            self.pin_available.notify_all();
            return Err(VmError::SwapIo(err));
        }

        if !state.tables.contains_key(&pid) {
            // the owner exited while we were writing; nobody will ever
            // fault this slot back in
            state.swap.release(pid, vpn);
            self.slot_available.notify_one();
        }
        Ok(state)
    }

    /// Eagerly map one page of a flat address space from a free frame,
    /// leaving the frame pinned for good so the clock never considers it.
    pub(crate) fn map_resident(
        &self,
        pid: Pid,
        vpn: u32,
        image: &dyn ProgramImage,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock().unwrap();
        let Some(frame) = state.frames.acquire_free_frame() else {
            return Err(VmError::OutOfMemory);
        };
        state.frames.pin(frame);
        drop(state);

        if let Some((section, page)) = section_of(image, vpn) {
            let mut page_bytes = vec![0u8; PAGE_SIZE];
            image.load_page(section, page, &mut page_bytes);
            self.memory
                .write_frame(frame, &page_bytes)
                .expect("frame is in range");
        } else {
            self.memory.zero_frame(frame).expect("frame is in range");
        }

        let mut state = self.state.lock().unwrap();
        state.frames.set_owner(frame, pid, vpn);
        let entry = &mut state.tables.get_mut(&pid).unwrap()[vpn as usize];
        entry.frame = frame as u32;
        entry.valid = true;
        entry.used = true;
        Ok(())
    }
}
