use log::trace;
use machine::{Tlb, TlbEntry};
use rand::Rng;

use crate::addr_space::AddressSpace;
use crate::error::VmError;

impl<const PAGE_SIZE: usize, const MEMORY_CAPACITY: usize, const SWAP_CAPACITY: usize>
    AddressSpace<PAGE_SIZE, MEMORY_CAPACITY, SWAP_CAPACITY>
{
    /// Called when this process loses the CPU. The cache carries no
    /// process tag, so nothing may survive the switch: every valid entry's
    /// used/dirty bits are written back into the page table, then the
    /// entry is invalidated.
    pub fn save_state(&self, tlb: &mut Tlb) {
        for index in 0..tlb.len() {
            let mut entry = tlb.read_entry(index);
            if entry.valid {
                self.sync_bits(&entry);
                entry.valid = false;
                tlb.write_entry(index, entry);
            }
        }
        trace!("process {}: translation cache flushed", self.pid());
    }

    /// Called when this process regains the CPU. Nothing to do: the next
    /// access misses and the fault handler repopulates lazily.
    pub fn restore_state(&self) {
        trace!("process {}: restored, cache refills on demand", self.pid());
    }

    /// The translation cache missed on `vaddr`. Resolve the page (faulting
    /// it in if necessary) and install the translation, overwriting the
    /// first invalid entry or, failing that, a random one.
    pub fn handle_tlb_miss(
        &self,
        tlb: &mut Tlb,
        vaddr: u32,
        is_write: bool,
    ) -> Result<u32, VmError> {
        let vpn = (vaddr as usize / PAGE_SIZE) as u32;

        // the entry may have been installed since the miss was raised;
        // refresh its bits in place instead of installing twice
        if let Some(index) = tlb.probe(vpn) {
            let mut entry = tlb.read_entry(index);
            if entry.read_only && is_write {
                return Err(VmError::WriteToReadOnly { vpn });
            }
            entry.used = true;
            entry.dirty |= is_write;
            tlb.write_entry(index, entry);
            self.sync_bits(&entry);
            return Ok(entry.frame);
        }

        let resolved = self
            .manager
            .resolve(self.pid(), vpn, is_write, false, &*self.image)?;

        let index = (0..tlb.len())
            .find(|&i| !tlb.read_entry(i).valid)
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..tlb.len()));
        let displaced = tlb.read_entry(index);
        if displaced.valid {
            // the displaced entry's bits must not be lost
            self.sync_bits(&displaced);
        }
        tlb.write_entry(
            index,
            TlbEntry {
                vpn,
                frame: resolved.frame,
                valid: true,
                read_only: resolved.read_only,
                used: true,
                dirty: resolved.dirty,
            },
        );
        Ok(resolved.frame)
    }

    fn sync_bits(&self, entry: &TlbEntry) {
        self.manager
            .sync_entry_bits(self.pid(), entry.vpn, entry.frame, entry.used, entry.dirty);
    }
}
