//! DMA channel words and the trigger condition evaluator.
//!
//! Four channels per CPU. The channel registers (source, destination,
//! control) and the running flags live here so the trigger contract is
//! self-contained: a channel configured for a start mode begins exactly once
//! per occurrence of that mode's condition, on the transition from idle to
//! running. The word-moving transfer engine is a collaborator; it reports
//! retirement through [`Console::dma_done`](crate::core::Console::dma_done).
//!
//! While a channel runs, the owning CPU carries a stop bit and does not
//! execute (the transfer engine owns the bus).

use crate::cpu::CpuId;
use crate::savestate::Savestate;

/// Control word bits
pub mod cnt {
    /// Repeat: the channel stays enabled after retiring
    pub const REPEAT: u32 = 1 << 25;
    /// Raise the owning CPU's matching DMA interrupt on completion
    pub const IRQ_ENABLE: u32 = 1 << 30;
    /// Channel enabled
    pub const ENABLE: u32 = 1 << 31;
}

/// Hardware condition class that starts a configured channel.
///
/// Not every mode exists on both CPUs: HBlank, the display FIFO, and the
/// geometry FIFO are ARM9 conditions; the wireless modem is an ARM7 one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaMode {
    /// Start as soon as the channel is enabled
    Immediate,
    /// Start of the vertical blanking period
    VBlank,
    /// Start of horizontal blank on a visible scanline (ARM9)
    HBlank,
    /// Display FIFO refill (ARM9)
    DisplayFifo,
    /// Cart slot data ready
    CartSlot,
    /// Geometry command FIFO below half (ARM9)
    GxFifo,
    /// Wireless modem transfer (ARM7)
    Wifi,
}

/// One DMA channel's register state
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaChannel {
    /// Source address register
    pub src: u32,
    /// Destination address register
    pub dst: u32,
    /// Control register; the low half is the word count
    pub cnt: u32,
    /// A transfer is in flight
    pub running: bool,
}

impl DmaChannel {
    fn enabled(&self) -> bool {
        self.cnt & cnt::ENABLE != 0
    }

    /// Decode the start mode field; its width and encoding differ per CPU
    fn mode(&self, cpu: CpuId, num: usize) -> DmaMode {
        match cpu {
            CpuId::Arm9 => match (self.cnt >> 27) & 0x7 {
                0 => DmaMode::Immediate,
                1 => DmaMode::VBlank,
                2 => DmaMode::HBlank,
                3 | 4 => DmaMode::DisplayFifo,
                5 | 6 => DmaMode::CartSlot,
                _ => DmaMode::GxFifo,
            },
            CpuId::Arm7 => match (self.cnt >> 28) & 0x3 {
                0 => DmaMode::Immediate,
                1 => DmaMode::VBlank,
                2 => DmaMode::CartSlot,
                // channel-dependent on hardware; the GBA-slot variant has no
                // counterpart here
                _ if num & 1 == 1 => DmaMode::Wifi,
                _ => DmaMode::CartSlot,
            },
        }
    }
}

/// All eight channels plus the start/stop bookkeeping
#[derive(Debug, Clone, Default)]
pub struct DmaState {
    channels: [[DmaChannel; 4]; 2],
}

/// Outcome of a channel control write, for the IO layer to apply CPU stop
/// side effects
pub(crate) struct CntWriteEffect {
    /// Channel began running (immediate mode enable edge)
    pub started: bool,
    /// Channel was disabled while running
    pub stopped: bool,
}

impl DmaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.channels = [[DmaChannel::default(); 4]; 2];
    }

    /// The channel registers for one CPU
    pub fn channel(&self, cpu: CpuId, num: usize) -> &DmaChannel {
        &self.channels[cpu.index()][num & 3]
    }

    pub(crate) fn write_src(&mut self, cpu: CpuId, num: usize, val: u32) {
        self.channels[cpu.index()][num & 3].src = val;
    }

    pub(crate) fn write_dst(&mut self, cpu: CpuId, num: usize, val: u32) {
        self.channels[cpu.index()][num & 3].dst = val;
    }

    /// Apply a control write. An enable edge in immediate mode starts the
    /// channel right away; disabling a running channel cancels its transfer.
    pub(crate) fn write_cnt(&mut self, cpu: CpuId, num: usize, val: u32) -> CntWriteEffect {
        let num = num & 3;
        let chan = &mut self.channels[cpu.index()][num];
        let was_enabled = chan.enabled();
        chan.cnt = val;

        let mut effect = CntWriteEffect {
            started: false,
            stopped: false,
        };
        if !was_enabled && chan.enabled() && chan.mode(cpu, num) == DmaMode::Immediate {
            chan.running = true;
            effect.started = true;
        } else if was_enabled && !chan.enabled() && chan.running {
            chan.running = false;
            effect.stopped = true;
        }
        effect
    }

    /// Whether any channel on this CPU is configured for the given mode
    pub fn in_mode(&self, cpu: CpuId, mode: DmaMode) -> bool {
        self.channels[cpu.index()]
            .iter()
            .enumerate()
            .any(|(num, chan)| chan.enabled() && chan.mode(cpu, num) == mode)
    }

    /// Whether any channel on this CPU has a transfer in flight
    pub fn running(&self, cpu: CpuId) -> bool {
        self.channels[cpu.index()].iter().any(|chan| chan.running)
    }

    /// Start idle channels configured for `mode`.
    ///
    /// Returns a channel bitmask of the ones that started; channels already
    /// running stay untouched, so one condition occurrence starts a channel
    /// at most once.
    pub(crate) fn start_mode(&mut self, cpu: CpuId, mode: DmaMode) -> u32 {
        let mut started = 0;
        for (num, chan) in self.channels[cpu.index()].iter_mut().enumerate() {
            if chan.enabled() && !chan.running && chan.mode(cpu, num) == mode {
                chan.running = true;
                started |= 1 << num;
            }
        }
        started
    }

    /// Halt running channels configured for `mode`; returns the channel
    /// bitmask of the ones that stopped
    pub(crate) fn stop_mode(&mut self, cpu: CpuId, mode: DmaMode) -> u32 {
        let mut stopped = 0;
        for (num, chan) in self.channels[cpu.index()].iter_mut().enumerate() {
            if chan.running && chan.mode(cpu, num) == mode {
                chan.running = false;
                stopped |= 1 << num;
            }
        }
        stopped
    }

    /// Retire a channel's transfer. Returns true if the completion interrupt
    /// should be raised. Non-repeating channels lose their enable bit.
    pub(crate) fn finish(&mut self, cpu: CpuId, num: usize) -> bool {
        let chan = &mut self.channels[cpu.index()][num & 3];
        if !chan.running {
            return false;
        }
        chan.running = false;
        if chan.cnt & cnt::REPEAT == 0 {
            chan.cnt &= !cnt::ENABLE;
        }
        chan.cnt & cnt::IRQ_ENABLE != 0
    }

    pub(crate) fn do_savestate(&mut self, file: &mut Savestate) {
        for bank in &mut self.channels {
            for chan in bank {
                file.var_u32(&mut chan.src);
                file.var_u32(&mut chan.dst);
                file.var_u32(&mut chan.cnt);
                file.var_bool(&mut chan.running);
            }
        }
    }
}
