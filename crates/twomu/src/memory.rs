//! Backing memory, shared-WRAM banking, and bus-timing tables.
//!
//! Three RAM banks are owned here: main RAM (shared between both CPUs and
//! mirrored through its address mask), the bankable 32 KB shared WRAM, and
//! the ARM7's private 64 KB WRAM. The per-address dispatch lives on
//! [`Console`](crate::core::Console); this module supplies the buffers, the
//! WRAMCNT-driven shared-WRAM views, and the region-timing tables the CPU
//! core collaborators read their access costs from.

use crate::savestate::Savestate;
use oxidizds_hw::memory_map;
use tracing::{debug, warn};

/// A contiguous view of one addressable segment.
///
/// Non-owning: the instruction-fetch/caching collaborator indexes `mem` with
/// `addr & mask`. The borrow ties the view's validity to the console, so it
/// cannot outlive the next remapping call.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion<'a> {
    pub mem: &'a [u8],
    pub mask: u32,
}

/// A shared-WRAM bank assignment: byte offset and mask into the 32 KB buffer
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SwramView {
    pub offset: u32,
    pub mask: u32,
    pub mapped: bool,
}

#[derive(Debug, Clone)]
pub struct Memory {
    pub(crate) main_ram: Vec<u8>,
    pub(crate) main_ram_mask: u32,
    pub(crate) shared_wram: Vec<u8>,
    pub(crate) arm7_wram: Vec<u8>,
    pub(crate) wram_cnt: u8,
    pub(crate) swram_arm9: SwramView,
    pub(crate) swram_arm7: SwramView,
    /// Bus priority control; index 0 is the ARM9's EXMEMCNT, index 1 the
    /// ARM7-visible EXMEMSTAT mirror
    pub(crate) exmem_cnt: [u16; 2],
    arm9_timings: Vec<[u8; 4]>,
    arm7_timings: Vec<[u8; 4]>,
}

impl Memory {
    /// Allocate the RAM banks and timing tables. `extended` selects the
    /// larger main RAM of the extended console.
    pub fn new(extended: bool) -> Self {
        let main_size = if extended {
            memory_map::main_ram::SIZE_EXTENDED
        } else {
            memory_map::main_ram::SIZE
        };
        debug!(
            "allocating {}MB main RAM, {}KB shared WRAM, {}KB ARM7 WRAM",
            main_size / (1024 * 1024),
            memory_map::shared_wram::SIZE / 1024,
            memory_map::arm7_wram::SIZE / 1024
        );
        let mut mem = Self {
            main_ram: vec![0; main_size],
            main_ram_mask: (main_size - 1) as u32,
            shared_wram: vec![0; memory_map::shared_wram::SIZE],
            arm7_wram: vec![0; memory_map::arm7_wram::SIZE],
            wram_cnt: 0,
            swram_arm9: SwramView::default(),
            swram_arm7: SwramView::default(),
            exmem_cnt: [0; 2],
            arm9_timings: vec![[1; 4]; memory_map::timings::ARM9_ENTRIES],
            arm7_timings: vec![[1; 4]; memory_map::timings::ARM7_ENTRIES],
        };
        mem.map_shared_wram(0);
        mem
    }

    pub fn reset(&mut self) {
        self.main_ram.fill(0);
        self.shared_wram.fill(0);
        self.arm7_wram.fill(0);
        self.exmem_cnt = [0x6000, 0x6000];
        self.map_shared_wram(0);
        self.arm9_timings.fill([1; 4]);
        self.arm7_timings.fill([1; 4]);
    }

    /// Resize main RAM for a console-type change; called before `reset`
    pub(crate) fn set_extended(&mut self, extended: bool) {
        let size = if extended {
            memory_map::main_ram::SIZE_EXTENDED
        } else {
            memory_map::main_ram::SIZE
        };
        if self.main_ram.len() != size {
            self.main_ram = vec![0; size];
            self.main_ram_mask = (size - 1) as u32;
        }
    }

    /// Apply a WRAMCNT write: assign the two 16 KB shared-WRAM halves.
    ///
    /// Both CPUs' views are re-derived; any previously returned [`MemRegion`]
    /// for the shared-WRAM segment is stale after this.
    pub fn map_shared_wram(&mut self, val: u8) {
        self.wram_cnt = val & 0x3;
        let full = (memory_map::shared_wram::SIZE - 1) as u32;
        let half = (memory_map::shared_wram::SIZE / 2 - 1) as u32;
        let second = memory_map::shared_wram::SIZE as u32 / 2;
        (self.swram_arm9, self.swram_arm7) = match self.wram_cnt {
            0 => (
                SwramView { offset: 0, mask: full, mapped: true },
                SwramView::default(),
            ),
            1 => (
                SwramView { offset: second, mask: half, mapped: true },
                SwramView { offset: 0, mask: half, mapped: true },
            ),
            2 => (
                SwramView { offset: 0, mask: half, mapped: true },
                SwramView { offset: second, mask: half, mapped: true },
            ),
            _ => (
                SwramView::default(),
                SwramView { offset: 0, mask: full, mapped: true },
            ),
        };
        debug!("shared WRAM banking set to {}", self.wram_cnt);
    }

    /// Fill ARM9 bus-timing entries for an address range.
    ///
    /// `nonseq`/`seq` are access cycles for 16-bit accesses; 32-bit accesses
    /// on a 16-bit bus pay the sequential cost twice. A backwards range is a
    /// contract violation in the caller and is ignored with a diagnostic.
    pub fn set_arm9_region_timings(
        &mut self,
        addrstart: u32,
        addrend: u32,
        buswidth: u32,
        nonseq: u8,
        seq: u8,
    ) {
        let shift = memory_map::timings::ARM9_SHIFT;
        Self::fill_timings(
            &mut self.arm9_timings,
            addrstart,
            addrend,
            shift,
            buswidth,
            nonseq,
            seq,
        );
    }

    /// Fill ARM7 bus-timing entries for an address range
    pub fn set_arm7_region_timings(
        &mut self,
        addrstart: u32,
        addrend: u32,
        buswidth: u32,
        nonseq: u8,
        seq: u8,
    ) {
        let shift = memory_map::timings::ARM7_SHIFT;
        Self::fill_timings(
            &mut self.arm7_timings,
            addrstart,
            addrend,
            shift,
            buswidth,
            nonseq,
            seq,
        );
    }

    fn fill_timings(
        table: &mut [[u8; 4]],
        addrstart: u32,
        addrend: u32,
        shift: u32,
        buswidth: u32,
        nonseq: u8,
        seq: u8,
    ) {
        if addrend != 0 && addrend <= addrstart {
            warn!(
                "region timing range {:#010X}..{:#010X} is invalid; ignored",
                addrstart, addrend
            );
            return;
        }
        // 32-bit accesses on a 16-bit bus take two transfers
        let (n32, s32) = if buswidth == 32 {
            (nonseq, seq)
        } else {
            (nonseq.saturating_add(seq), seq.saturating_add(seq))
        };
        let start = (addrstart >> shift) as usize;
        // addrend == 0 means "to the end of the address space"
        let end = if addrend == 0 {
            table.len()
        } else {
            ((addrend - 1) >> shift) as usize + 1
        };
        let end = end.min(table.len());
        for entry in &mut table[start..end] {
            *entry = [nonseq, seq, n32, s32];
        }
    }

    /// Timing entry for an ARM9 address: [16-bit nonseq, 16-bit seq,
    /// 32-bit nonseq, 32-bit seq]
    pub fn arm9_timings(&self, addr: u32) -> &[u8; 4] {
        &self.arm9_timings[(addr >> memory_map::timings::ARM9_SHIFT) as usize]
    }

    /// Timing entry for an ARM7 address
    pub fn arm7_timings(&self, addr: u32) -> &[u8; 4] {
        &self.arm7_timings[(addr >> memory_map::timings::ARM7_SHIFT) as usize]
    }

    pub(crate) fn do_savestate(&mut self, file: &mut Savestate) {
        file.var_u8(&mut self.wram_cnt);
        file.var_u16(&mut self.exmem_cnt[0]);
        file.var_u16(&mut self.exmem_cnt[1]);
        file.bytes(&mut self.main_ram);
        file.bytes(&mut self.shared_wram);
        file.bytes(&mut self.arm7_wram);
        if !file.is_saving() {
            // views are derived state
            let cnt = self.wram_cnt;
            self.map_shared_wram(cnt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wram_banking_assigns_halves() {
        let mut mem = Memory::new(false);

        mem.map_shared_wram(0);
        assert!(mem.swram_arm9.mapped && !mem.swram_arm7.mapped);
        assert_eq!(mem.swram_arm9.mask, 0x7FFF);

        mem.map_shared_wram(1);
        assert_eq!(mem.swram_arm9.offset, 0x4000);
        assert_eq!(mem.swram_arm7.offset, 0);
        assert_eq!(mem.swram_arm9.mask, 0x3FFF);

        mem.map_shared_wram(3);
        assert!(!mem.swram_arm9.mapped && mem.swram_arm7.mapped);
        assert_eq!(mem.swram_arm7.mask, 0x7FFF);
    }

    #[test]
    fn main_ram_mask_matches_console_type() {
        let base = Memory::new(false);
        assert_eq!(base.main_ram_mask, 0x003F_FFFF);
        let extended = Memory::new(true);
        assert_eq!(extended.main_ram_mask, 0x00FF_FFFF);
    }

    #[test]
    fn region_timings_fill_and_read_back() {
        let mut mem = Memory::new(false);
        mem.set_arm9_region_timings(0x0200_0000, 0x0300_0000, 16, 3, 2);
        assert_eq!(mem.arm9_timings(0x0200_0000), &[3, 2, 5, 4]);
        assert_eq!(mem.arm9_timings(0x02FF_FFFF), &[3, 2, 5, 4]);
        // outside the range keeps the default
        assert_eq!(mem.arm9_timings(0x0300_0000), &[1, 1, 1, 1]);
    }

    #[test]
    fn backwards_timing_range_is_ignored() {
        let mut mem = Memory::new(false);
        mem.set_arm7_region_timings(0x0300_0000, 0x0200_0000, 16, 7, 7);
        assert_eq!(mem.arm7_timings(0x0280_0000), &[1, 1, 1, 1]);
    }
}
