//! Memory-mapped IO dispatch for both CPUs.
//!
//! Only the registers owned by the timing core live here: DMA channel words,
//! timers, keypad, the interrupt controller, WRAM banking, bus priority, and
//! the ARM7's low-power control. Everything else logs at trace level and
//! reads as zero, the same way unimplemented regions are stubbed out.
//!
//! Registers wider than the access size compose from 16-bit halves; the few
//! true byte registers (WRAMCNT, WRAMSTAT, HALTCNT) are handled in the 8-bit
//! paths directly.

use crate::core::{Console, ConsoleType};
use crate::cpu::CpuId;
use oxidizds_hw::io_map::{dma, irq, keypad, system, timers};
use tracing::trace;

/// Whether the secondary interrupt registers exist for this access
fn has_irq2(nds: &Console, cpu: CpuId) -> bool {
    cpu == CpuId::Arm7 && nds.console_type() == ConsoleType::Dsi
}

// ================================================================================================
// 16-bit access (primary path)
// ================================================================================================

fn io_read16(nds: &mut Console, cpu: CpuId, addr: u32) -> u16 {
    let i = cpu.index();
    match addr {
        dma::BASE..dma::END => {
            let word = dma_read32(nds, cpu, addr & !3);
            (word >> ((addr & 2) * 8)) as u16
        }
        timers::BASE..timers::END => {
            let idx = ((addr - timers::BASE) / timers::TIMER_STRIDE) as usize;
            if addr & 2 == 0 {
                // the counter ticks lazily; catch up before reading it
                nds.run_timers(cpu);
                nds.timers.read_counter(cpu, idx)
            } else {
                nds.timers.read_cnt(cpu, idx)
            }
        }
        keypad::KEYINPUT => (nds.input.key_input & 0xFFFF) as u16,
        keypad::KEYCNT => nds.input.key_cnt[i],
        keypad::EXTKEYIN if cpu == CpuId::Arm7 => nds.input.ext_key_in(),
        system::EXMEMCNT => nds.mem.exmem_cnt[i],
        irq::IME => (nds.irq.ime[i] & 0x1) as u16,
        a if a == irq::IME + 2 => 0,
        irq::IE => nds.irq.ie[i] as u16,
        a if a == irq::IE + 2 => (nds.irq.ie[i] >> 16) as u16,
        irq::IF => nds.irq.irf[i] as u16,
        a if a == irq::IF + 2 => (nds.irq.irf[i] >> 16) as u16,
        irq::IE2 if has_irq2(nds, cpu) => nds.irq.ie2 as u16,
        a if a == irq::IE2 + 2 && has_irq2(nds, cpu) => (nds.irq.ie2 >> 16) as u16,
        irq::IF2 if has_irq2(nds, cpu) => nds.irq.irf2 as u16,
        a if a == irq::IF2 + 2 && has_irq2(nds, cpu) => (nds.irq.irf2 >> 16) as u16,
        _ => {
            trace!("unhandled {:?} IO read16 {:#010X}", cpu, addr);
            0
        }
    }
}

fn io_write16(nds: &mut Console, cpu: CpuId, addr: u32, val: u16) {
    let i = cpu.index();
    match addr {
        dma::BASE..dma::END => {
            let word = dma_read32(nds, cpu, addr & !3);
            let shift = (addr & 2) * 8;
            let word = (word & !(0xFFFF << shift)) | ((val as u32) << shift);
            dma_write32(nds, cpu, addr & !3, word);
        }
        timers::BASE..timers::END => {
            let idx = ((addr - timers::BASE) / timers::TIMER_STRIDE) as usize;
            if addr & 2 == 0 {
                nds.timers.write_reload(cpu, idx, val);
            } else {
                // settle the counter at the old configuration first
                nds.run_timers(cpu);
                nds.timers.write_cnt(cpu, idx, val);
            }
        }
        keypad::KEYCNT => {
            nds.input.key_cnt[i] = val;
            nds.check_key_irq(cpu);
        }
        system::EXMEMCNT => match cpu {
            CpuId::Arm9 => {
                nds.mem.exmem_cnt[0] = val;
                // the shared bus bits mirror into the ARM7's view
                nds.mem.exmem_cnt[1] = (nds.mem.exmem_cnt[1] & 0x007F) | (val & 0xFF80);
            }
            CpuId::Arm7 => {
                nds.mem.exmem_cnt[1] = (nds.mem.exmem_cnt[1] & 0xFF80) | (val & 0x007F);
            }
        },
        irq::IME => {
            nds.irq.ime[i] = (val & 0x1) as u32;
            nds.update_irq(cpu);
        }
        a if a == irq::IME + 2 => {}
        irq::IE => {
            nds.irq.ie[i] = (nds.irq.ie[i] & 0xFFFF_0000) | val as u32;
            nds.update_irq(cpu);
        }
        a if a == irq::IE + 2 => {
            nds.irq.ie[i] = (nds.irq.ie[i] & 0x0000_FFFF) | ((val as u32) << 16);
            nds.update_irq(cpu);
        }
        irq::IF => {
            // write 1 to acknowledge
            nds.irq.irf[i] &= !(val as u32);
            nds.update_irq(cpu);
        }
        a if a == irq::IF + 2 => {
            nds.irq.irf[i] &= !((val as u32) << 16);
            nds.update_irq(cpu);
        }
        irq::IE2 if has_irq2(nds, cpu) => {
            nds.irq.ie2 = (nds.irq.ie2 & 0xFFFF_0000) | val as u32;
            nds.update_irq(cpu);
        }
        a if a == irq::IE2 + 2 && has_irq2(nds, cpu) => {
            nds.irq.ie2 = (nds.irq.ie2 & 0x0000_FFFF) | ((val as u32) << 16);
            nds.update_irq(cpu);
        }
        irq::IF2 if has_irq2(nds, cpu) => {
            nds.irq.irf2 &= !(val as u32);
            nds.update_irq(cpu);
        }
        a if a == irq::IF2 + 2 && has_irq2(nds, cpu) => {
            nds.irq.irf2 &= !((val as u32) << 16);
            nds.update_irq(cpu);
        }
        _ => trace!(
            "unhandled {:?} IO write16 {:#010X} = {:#06X}",
            cpu, addr, val
        ),
    }
}

// ================================================================================================
// DMA channel words
// ================================================================================================

fn dma_read32(nds: &mut Console, cpu: CpuId, addr: u32) -> u32 {
    let chan = ((addr - dma::BASE) / dma::CHANNEL_STRIDE) as usize;
    let channel = nds.dma.channel(cpu, chan);
    match (addr - dma::BASE) % dma::CHANNEL_STRIDE {
        dma::SAD => channel.src,
        dma::DAD => channel.dst,
        _ => channel.cnt,
    }
}

fn dma_write32(nds: &mut Console, cpu: CpuId, addr: u32, val: u32) {
    let chan = ((addr - dma::BASE) / dma::CHANNEL_STRIDE) as usize;
    match (addr - dma::BASE) % dma::CHANNEL_STRIDE {
        dma::SAD => nds.dma.write_src(cpu, chan, val),
        dma::DAD => nds.dma.write_dst(cpu, chan, val),
        _ => {
            let effect = nds.dma.write_cnt(cpu, chan, val);
            if effect.started {
                nds.stop_cpu(cpu, 1 << chan);
            }
            if effect.stopped {
                nds.resume_cpu(cpu, 1 << chan);
            }
        }
    }
}

// ================================================================================================
// 8-bit and 32-bit access
// ================================================================================================

fn io_read8(nds: &mut Console, cpu: CpuId, addr: u32) -> u8 {
    match (cpu, addr) {
        (CpuId::Arm7, system::WRAMSTAT) => nds.mem.wram_cnt,
        (CpuId::Arm9, system::WRAMCNT) => nds.mem.wram_cnt,
        _ => (io_read16(nds, cpu, addr & !1) >> ((addr & 1) * 8)) as u8,
    }
}

fn io_write8(nds: &mut Console, cpu: CpuId, addr: u32, val: u8) {
    match (cpu, addr) {
        (CpuId::Arm9, system::WRAMCNT) => nds.map_shared_wram(val & 0x3),
        (CpuId::Arm7, system::HALTCNT) => {
            if val & 0xC0 != 0 {
                // both halt and sleep suspend execution pending an interrupt
                nds.halt(CpuId::Arm7);
            }
        }
        _ => trace!(
            "unhandled {:?} IO write8 {:#010X} = {:#04X}",
            cpu, addr, val
        ),
    }
}

fn io_read32(nds: &mut Console, cpu: CpuId, addr: u32) -> u32 {
    let i = cpu.index();
    match addr {
        dma::BASE..dma::END => dma_read32(nds, cpu, addr),
        irq::IME => nds.irq.ime[i] & 0x1,
        irq::IE => nds.irq.ie[i],
        irq::IF => nds.irq.irf[i],
        irq::IE2 if has_irq2(nds, cpu) => nds.irq.ie2,
        irq::IF2 if has_irq2(nds, cpu) => nds.irq.irf2,
        _ => {
            let lo = io_read16(nds, cpu, addr) as u32;
            let hi = io_read16(nds, cpu, addr + 2) as u32;
            lo | (hi << 16)
        }
    }
}

fn io_write32(nds: &mut Console, cpu: CpuId, addr: u32, val: u32) {
    let i = cpu.index();
    match addr {
        dma::BASE..dma::END => dma_write32(nds, cpu, addr, val),
        irq::IME => {
            nds.irq.ime[i] = val & 0x1;
            nds.update_irq(cpu);
        }
        irq::IE => {
            nds.irq.ie[i] = val;
            nds.update_irq(cpu);
        }
        irq::IF => {
            nds.irq.irf[i] &= !val;
            nds.update_irq(cpu);
        }
        irq::IE2 if has_irq2(nds, cpu) => {
            nds.irq.ie2 = val;
            nds.update_irq(cpu);
        }
        irq::IF2 if has_irq2(nds, cpu) => {
            nds.irq.irf2 &= !val;
            nds.update_irq(cpu);
        }
        _ => {
            io_write16(nds, cpu, addr, val as u16);
            io_write16(nds, cpu, addr + 2, (val >> 16) as u16);
        }
    }
}

// ================================================================================================
// Per-CPU entry points
// ================================================================================================

pub(crate) fn arm9_io_read8(nds: &mut Console, addr: u32) -> u8 {
    io_read8(nds, CpuId::Arm9, addr)
}

pub(crate) fn arm9_io_read16(nds: &mut Console, addr: u32) -> u16 {
    io_read16(nds, CpuId::Arm9, addr)
}

pub(crate) fn arm9_io_read32(nds: &mut Console, addr: u32) -> u32 {
    io_read32(nds, CpuId::Arm9, addr)
}

pub(crate) fn arm9_io_write8(nds: &mut Console, addr: u32, val: u8) {
    io_write8(nds, CpuId::Arm9, addr, val);
}

pub(crate) fn arm9_io_write16(nds: &mut Console, addr: u32, val: u16) {
    io_write16(nds, CpuId::Arm9, addr, val);
}

pub(crate) fn arm9_io_write32(nds: &mut Console, addr: u32, val: u32) {
    io_write32(nds, CpuId::Arm9, addr, val);
}

pub(crate) fn arm7_io_read8(nds: &mut Console, addr: u32) -> u8 {
    io_read8(nds, CpuId::Arm7, addr)
}

pub(crate) fn arm7_io_read16(nds: &mut Console, addr: u32) -> u16 {
    io_read16(nds, CpuId::Arm7, addr)
}

pub(crate) fn arm7_io_read32(nds: &mut Console, addr: u32) -> u32 {
    io_read32(nds, CpuId::Arm7, addr)
}

pub(crate) fn arm7_io_write8(nds: &mut Console, addr: u32, val: u8) {
    io_write8(nds, CpuId::Arm7, addr, val);
}

pub(crate) fn arm7_io_write16(nds: &mut Console, addr: u32, val: u16) {
    io_write16(nds, CpuId::Arm7, addr, val);
}

pub(crate) fn arm7_io_write32(nds: &mut Console, addr: u32, val: u32) {
    io_write32(nds, CpuId::Arm7, addr, val);
}
