//! Core machine state and the dual-clock frame driver.
//!
//! This module provides the main machine interface: one [`Console`] value
//! owns both CPUs' clocks, the event timeline, the interrupt and timer
//! state, the DMA trigger bookkeeping, and the backing memory. The
//! instruction-interpreting cores and the peripherals proper are
//! collaborators driven through [`CpuCore`] and [`EventHook`].
//!
//! The frame driver interleaves the two CPUs cooperatively on a single
//! thread: the ARM9 leads, running up to the earliest pending event; the
//! ARM7 is then dragged along to the ARM9's position; finally all events due
//! by that point fire. Every side effect at or before a base-clock timestamp
//! is applied before anything observes a later timestamp.

use crate::cpu::{CpuClock, CpuCore, CpuId};
use crate::dma::{DmaMode, DmaState};
use crate::input::InputState;
use crate::io;
use crate::irq::{Irq, Irq2, IrqState};
use crate::memory::{MemRegion, Memory};
use crate::savestate::Savestate;
use crate::sched::{EventHook, EventKind, Scheduler};
use crate::timers::TimerBank;
use oxidizds_hw::specs::{cpu as cpu_specs, display};
use tracing::{info, trace, warn};

/// Hardware feature set to emulate; must be selected before `reset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleType {
    /// Base console: 4 MB main RAM, primary interrupt set only
    #[default]
    Ds,
    /// Extended console: 16 MB main RAM, secondary ARM7 interrupt set
    Dsi,
}

/// Lifecycle of a machine instance.
///
/// `Console::new` plays the role of init (buffers allocated), `reset` enters
/// `Running` and is re-enterable from it, `stop` is terminal for the session,
/// and dropping the console deinitializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initialized,
    Running,
    Stopped,
}

/// What the caller should do with the frame that was just produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame's worth of time ran and the frame should be presented
    Rendered,
    /// A frame's worth of time ran with presentation suppressed
    Skipped,
    /// The machine is not running; no time passed
    Stopped,
}

/// Configuration for the emulator
#[derive(Debug, Clone, Copy, Default)]
pub struct EmulatorConfig {
    /// Hardware feature set
    pub console_type: ConsoleType,
    /// Start with presentation-affecting work suppressed
    pub skip_frame: bool,
}

/// CPU stop-reason masks within the shared stop word
mod stop {
    /// Per-CPU DMA stall bits (one per channel); the ARM7's are shifted up
    pub const DMA_MASK: u32 = 0x0000_000F;
    /// Bit offset of the ARM7's stop reasons
    pub const ARM7_SHIFT: u32 = 16;
    /// Geometry FIFO backlog stall (ARM9 only)
    pub const GXFIFO: u32 = 1 << 31;
}

/// One emulated machine instance.
///
/// All shared mutable state lives here; the caller must serialize entry from
/// outside, as the core assumes single-writer access throughout.
pub struct Console {
    state: LifecycleState,
    console_type: ConsoleType,
    skip_frame: bool,

    pub(crate) cpus: [CpuClock; 2],
    cur_cpu: CpuId,
    /// Stop-reason bits for both CPUs; see [`stop`]
    cpu_stop: u32,

    /// Current scanline of the display clock
    vcount: u32,
    /// Scanlines completed by the current `run_frame` call
    total_scanlines: u32,

    pub(crate) sched: Scheduler,
    pub(crate) irq: IrqState,
    pub(crate) timers: TimerBank,
    pub(crate) dma: DmaState,
    pub(crate) input: InputState,
    pub(crate) mem: Memory,

    cores: [Option<Box<dyn CpuCore>>; 2],
    hook: Option<Box<dyn EventHook>>,
}

impl Console {
    /// Allocate a machine instance. The instance starts out `Initialized`;
    /// call [`reset`](Self::reset) to begin running.
    pub fn new(config: EmulatorConfig) -> Self {
        info!("initializing console ({:?})", config.console_type);
        Self {
            state: LifecycleState::Initialized,
            console_type: config.console_type,
            skip_frame: config.skip_frame,
            cpus: [CpuClock::default(); 2],
            cur_cpu: CpuId::Arm9,
            cpu_stop: 0,
            vcount: 0,
            total_scanlines: 0,
            sched: Scheduler::new(),
            irq: IrqState::new(),
            timers: TimerBank::new(),
            dma: DmaState::new(),
            input: InputState::new(),
            mem: Memory::new(config.console_type == ConsoleType::Dsi),
            cores: [None, None],
            hook: None,
        }
    }

    // ============================================================================================
    // Lifecycle
    // ============================================================================================

    pub fn lifecycle(&self) -> LifecycleState {
        self.state
    }

    pub fn console_type(&self) -> ConsoleType {
        self.console_type
    }

    /// Select the hardware feature set. Takes effect at the next `reset`.
    pub fn set_console_type(&mut self, console_type: ConsoleType) {
        if self.state == LifecycleState::Running {
            warn!("console type changed while running; applied at next reset");
        }
        self.console_type = console_type;
    }

    /// Reset all clock, timer, interrupt, and scheduler state to power-on
    /// values and enter `Running`. Re-enterable from `Running`.
    pub fn reset(&mut self) {
        info!("reset ({:?})", self.console_type);
        self.mem.set_extended(self.console_type == ConsoleType::Dsi);
        self.mem.reset();
        self.sched.reset();
        self.irq.reset();
        self.timers.reset();
        self.dma.reset();
        self.input.reset();
        self.cpus[0].reset();
        self.cpus[1].reset();
        self.cur_cpu = CpuId::Arm9;
        self.cpu_stop = 0;
        self.vcount = 0;
        self.total_scanlines = 0;

        // the display clock drives frame pacing and is always pending while
        // the machine runs
        self.sched.schedule(
            EventKind::LcdScanline,
            true,
            display::SCANLINE_CYCLES as i64,
            0,
        );

        for i in 0..2 {
            if let Some(mut core) = self.cores[i].take() {
                core.reset(self);
                self.cores[i] = Some(core);
            }
        }
        self.state = LifecycleState::Running;
    }

    /// Terminal shutdown of the session. Pending scheduled events and timer
    /// state are discarded immediately, not drained.
    pub fn stop(&mut self) {
        if self.state == LifecycleState::Stopped {
            return;
        }
        info!("stopping console");
        self.sched.reset();
        self.timers.reset();
        self.state = LifecycleState::Stopped;
    }

    /// Install an instruction-interpreting core for one CPU
    pub fn set_cpu_core(&mut self, cpu: CpuId, core: Box<dyn CpuCore>) {
        self.cores[cpu.index()] = Some(core);
    }

    /// Install the peripheral collaborator that receives non-core events
    pub fn set_event_hook(&mut self, hook: Box<dyn EventHook>) {
        self.hook = Some(hook);
    }

    /// Suppress or restore presentation-affecting work per frame
    pub fn set_skip_frame(&mut self, skip: bool) {
        self.skip_frame = skip;
    }

    // ============================================================================================
    // Frame driver
    // ============================================================================================

    /// Run exactly one emulated video frame.
    ///
    /// Alternates the two CPUs against the event timeline: the ARM9 runs to
    /// the earliest pending event, the ARM7 is brought up to the ARM9's
    /// position, then all events due by that point fire in timestamp order.
    pub fn run_frame(&mut self) -> FrameOutcome {
        if self.state != LifecycleState::Running {
            warn!("run_frame called in {:?}", self.state);
            return FrameOutcome::Stopped;
        }
        self.total_scanlines = 0;
        while self.state == LifecycleState::Running && self.total_scanlines == 0 {
            let target = self.next_target();

            self.cur_cpu = CpuId::Arm9;
            let clock = &mut self.cpus[0];
            clock.target = to_arm9_domain(target).max(clock.timestamp);
            self.run_cpu_slice(CpuId::Arm9);
            self.run_timers(CpuId::Arm9);

            // the ARM7 is dragged along to wherever the ARM9 got to
            let target7 = self.cpus[0].timestamp >> cpu_specs::ARM9_CLOCK_SHIFT;
            self.cur_cpu = CpuId::Arm7;
            let clock = &mut self.cpus[1];
            clock.target = target7.max(clock.timestamp);
            self.run_cpu_slice(CpuId::Arm7);
            self.run_timers(CpuId::Arm7);

            self.process_events(target7);
        }
        if self.state != LifecycleState::Running {
            FrameOutcome::Stopped
        } else if self.skip_frame {
            FrameOutcome::Skipped
        } else {
            FrameOutcome::Rendered
        }
    }

    /// How far a CPU may run before it must yield to process an event
    fn next_target(&self) -> u64 {
        let now = self.sched.now();
        self.sched
            .next_timestamp()
            .unwrap_or(now + display::SCANLINE_CYCLES)
            .max(now + 1)
    }

    /// Run one CPU until it reaches its target or can make no progress
    fn run_cpu_slice(&mut self, cpu: CpuId) {
        let i = cpu.index();
        while self.state == LifecycleState::Running
            && self.cpus[i].timestamp < self.cpus[i].target
        {
            if self.cpu_stopped(cpu) {
                // a transfer engine or the geometry FIFO owns the bus; no
                // instructions retire while the stall consumes the slice
                self.cpus[i].timestamp = self.cpus[i].target;
                break;
            }
            if self.cpus[i].halted {
                if self.halt_interrupted(cpu) {
                    self.cpus[i].halted = false;
                    continue;
                }
                self.fast_forward_halted(cpu);
                if self.cpus[i].timestamp < self.cpus[i].target {
                    // pinned behind the other core; yield so it can catch up
                    break;
                }
                continue;
            }
            match self.cores[i].take() {
                Some(mut core) => {
                    let before = self.cpus[i].timestamp;
                    core.execute(self);
                    self.cores[i] = Some(core);
                    let clock = &mut self.cpus[i];
                    if clock.timestamp == before && !clock.halted {
                        warn!("{:?} core made no progress; treating as idle", cpu);
                        clock.timestamp = clock.target;
                    }
                    // a core may overshoot its target by a partial instruction
                    if clock.timestamp > clock.target {
                        clock.target = clock.timestamp;
                    }
                }
                None => self.cpus[i].timestamp = self.cpus[i].target,
            }
        }
    }

    /// Skip a halted CPU ahead without stepping idle cycles.
    ///
    /// A halted core performs no observable work, so its timestamp jumps to
    /// the next thing that could end the halt: the earliest pending event or
    /// the other CPU's position, whichever is sooner. A neighbor that is
    /// *behind* is not a bound (time never reverses), and the jump never
    /// passes the CPU's own target.
    fn fast_forward_halted(&mut self, cpu: CpuId) {
        let i = cpu.index();
        let next_event = self.sched.next_timestamp().unwrap_or(u64::MAX);
        let other = self.cpus[cpu.other().index()].timestamp;
        let (next_event, other) = match cpu {
            CpuId::Arm9 => (to_arm9_domain(next_event), to_arm9_domain(other)),
            CpuId::Arm7 => (next_event, other >> cpu_specs::ARM9_CLOCK_SHIFT),
        };
        let clock = &mut self.cpus[i];
        let mut bound = next_event;
        if other > clock.timestamp {
            bound = bound.min(other);
        }
        bound = bound.min(clock.target);
        if bound > clock.timestamp {
            clock.timestamp = bound;
        }
    }

    /// Advance the shared timeline to `target` and fire everything due.
    ///
    /// Events fire in ascending timestamp order (ties by event-kind index);
    /// an event scheduled by a handler that lands inside the window fires in
    /// this same pass. Scheduler events are processed before halted CPUs
    /// re-evaluate their wake conditions, which happens on their next slice.
    fn process_events(&mut self, target: u64) {
        self.sched.set_now(target);
        while self.state == LifecycleState::Running {
            let Some((kind, param)) = self.sched.pop_due(target) else {
                break;
            };
            self.dispatch_event(kind, param);
        }
    }

    fn dispatch_event(&mut self, kind: EventKind, param: u32) {
        match kind {
            EventKind::LcdScanline => self.scanline_event(),
            _ => {
                if let Some(mut hook) = self.hook.take() {
                    hook.event(self, kind, param);
                    self.hook = Some(hook);
                } else {
                    trace!("event {:?} fired with no hook installed", kind);
                }
            }
        }
    }

    /// One tick of the display clock: horizontal blank side effects for the
    /// line that ended, vertical blank at the boundary, frame completion at
    /// wrap-around
    fn scanline_event(&mut self) {
        self.vcount += 1;
        if self.vcount == display::SCANLINES_PER_FRAME {
            self.vcount = 0;
            self.total_scanlines += display::SCANLINES_PER_FRAME;
        }
        if self.vcount == display::VBLANK_SCANLINE {
            self.set_irq(CpuId::Arm9, Irq::VBlank);
            self.set_irq(CpuId::Arm7, Irq::VBlank);
            self.check_dmas(CpuId::Arm9, DmaMode::VBlank);
            self.check_dmas(CpuId::Arm7, DmaMode::VBlank);
        } else if self.vcount < display::VBLANK_SCANLINE {
            self.set_irq(CpuId::Arm9, Irq::HBlank);
            self.set_irq(CpuId::Arm7, Irq::HBlank);
            self.check_dmas(CpuId::Arm9, DmaMode::HBlank);
        }
    }

    // ============================================================================================
    // Clocks
    // ============================================================================================

    /// Base-clock cycles elapsed since power-on
    pub fn sys_clock_cycles(&self) -> u64 {
        self.sched.now()
    }

    /// The CPU currently selected by the frame driver
    pub fn cur_cpu(&self) -> CpuId {
        self.cur_cpu
    }

    /// Current scanline of the display clock
    pub fn vcount(&self) -> u32 {
        self.vcount
    }

    pub fn cpu_clock(&self, cpu: CpuId) -> CpuClock {
        self.cpus[cpu.index()]
    }

    /// Mutable clock access for the CPU core collaborator, which advances
    /// `timestamp` as instructions retire
    pub fn cpu_clock_mut(&mut self, cpu: CpuId) -> &mut CpuClock {
        &mut self.cpus[cpu.index()]
    }

    // ============================================================================================
    // Events
    // ============================================================================================

    /// Install an event due `delay` base cycles from now, replacing any
    /// pending entry of the same kind
    pub fn schedule_event(&mut self, kind: EventKind, periodic: bool, delay: i64, param: u32) {
        self.sched.schedule(kind, periodic, delay, param);
    }

    /// Remove a pending event; no-op if none is pending
    pub fn cancel_event(&mut self, kind: EventKind) {
        self.sched.cancel(kind);
    }

    // ============================================================================================
    // Interrupts and power state
    // ============================================================================================

    /// Raise one interrupt source for a CPU
    pub fn set_irq(&mut self, cpu: CpuId, irq: Irq) {
        self.irq.irf[cpu.index()] |= 1 << irq as u32;
        self.update_irq(cpu);
    }

    /// Clear one interrupt source for a CPU; no-op if already clear
    pub fn clear_irq(&mut self, cpu: CpuId, irq: Irq) {
        self.irq.irf[cpu.index()] &= !(1 << irq as u32);
        self.update_irq(cpu);
    }

    /// Raise a secondary interrupt source (extended console, ARM7)
    pub fn set_irq2(&mut self, irq: Irq2) {
        self.irq.irf2 |= 1 << irq as u32;
        self.update_irq(CpuId::Arm7);
    }

    /// Clear a secondary interrupt source; no-op if already clear
    pub fn clear_irq2(&mut self, irq: Irq2) {
        self.irq.irf2 &= !(1 << irq as u32);
        self.update_irq(CpuId::Arm7);
    }

    /// Re-derive a CPU's "should take an interrupt" line.
    ///
    /// Must run after every mutation of enable/flag/master-enable state so
    /// interrupt visibility is immediate within the same scheduling step; the
    /// IO layer and the `set_*`/`clear_*` entry points all route through
    /// here.
    pub fn update_irq(&mut self, cpu: CpuId) {
        self.cpus[cpu.index()].irq = self.irq.pending(cpu);
    }

    /// Whether a halted CPU now has a reason to resume
    pub fn halt_interrupted(&self, cpu: CpuId) -> bool {
        self.irq.halt_wake(cpu)
    }

    /// Put a CPU into its halted-waiting-for-interrupt state
    pub fn halt(&mut self, cpu: CpuId) {
        self.cpus[cpu.index()].halted = true;
    }

    /// Raise stop reasons for a CPU; it stops executing until they clear
    pub fn stop_cpu(&mut self, cpu: CpuId, mask: u32) {
        self.cpu_stop |= match cpu {
            CpuId::Arm9 => mask,
            CpuId::Arm7 => (mask & stop::DMA_MASK) << stop::ARM7_SHIFT,
        };
    }

    /// Clear stop reasons for a CPU; no-op for bits already clear
    pub fn resume_cpu(&mut self, cpu: CpuId, mask: u32) {
        self.cpu_stop &= !match cpu {
            CpuId::Arm9 => mask,
            CpuId::Arm7 => (mask & stop::DMA_MASK) << stop::ARM7_SHIFT,
        };
    }

    /// Stall the ARM9 on a full geometry FIFO
    pub fn gxfifo_stall(&mut self) {
        self.cpu_stop |= stop::GXFIFO;
    }

    pub fn gxfifo_unstall(&mut self) {
        self.cpu_stop &= !stop::GXFIFO;
    }

    /// Whether any stop reason blocks this CPU
    pub fn cpu_stopped(&self, cpu: CpuId) -> bool {
        match cpu {
            CpuId::Arm9 => self.cpu_stop & (stop::DMA_MASK | stop::GXFIFO) != 0,
            CpuId::Arm7 => self.cpu_stop & (stop::DMA_MASK << stop::ARM7_SHIFT) != 0,
        }
    }

    // ============================================================================================
    // Timers
    // ============================================================================================

    /// Tick a CPU's timer bank up to its current clock position
    pub fn run_timers(&mut self, cpu: CpuId) {
        let time = match cpu {
            CpuId::Arm9 => self.cpus[0].timestamp >> cpu_specs::ARM9_CLOCK_SHIFT,
            CpuId::Arm7 => self.cpus[1].timestamp,
        };
        let mut irqs = self.timers.run(cpu, time);
        while irqs != 0 {
            let idx = irqs.trailing_zeros() as usize;
            irqs &= irqs - 1;
            self.set_irq(cpu, Irq::timer(idx));
        }
    }

    // ============================================================================================
    // DMA triggers
    // ============================================================================================

    /// Start idle channels configured for `mode`; exactly once per condition
    /// occurrence
    pub fn check_dmas(&mut self, cpu: CpuId, mode: DmaMode) {
        let started = self.dma.start_mode(cpu, mode);
        if started != 0 {
            self.stop_cpu(cpu, started);
        }
    }

    /// Forcibly halt channels configured for `mode`; no-op when none run
    pub fn stop_dmas(&mut self, cpu: CpuId, mode: DmaMode) {
        let stopped = self.dma.stop_mode(cpu, mode);
        if stopped != 0 {
            self.resume_cpu(cpu, stopped);
        }
    }

    /// Whether any channel on this CPU is configured for `mode`
    pub fn dmas_in_mode(&self, cpu: CpuId, mode: DmaMode) -> bool {
        self.dma.in_mode(cpu, mode)
    }

    /// Whether any channel on this CPU has a transfer in flight
    pub fn dmas_running(&self, cpu: CpuId) -> bool {
        self.dma.running(cpu)
    }

    /// Transfer-engine collaborator entry point: a channel's transfer retired
    pub fn dma_done(&mut self, cpu: CpuId, chan: usize) {
        if self.dma.finish(cpu, chan) {
            self.set_irq(cpu, Irq::dma(chan));
        }
        self.resume_cpu(cpu, 1 << (chan & 3));
    }

    // ============================================================================================
    // Input
    // ============================================================================================

    /// Apply the frontend's key mask and re-evaluate the keypad IRQ condition
    pub fn set_key_mask(&mut self, mask: u32) {
        self.input.set_key_mask(mask);
        self.check_key_irq(CpuId::Arm9);
        self.check_key_irq(CpuId::Arm7);
    }

    /// Press the pen at a screen position
    pub fn touch_screen(&mut self, x: u16, y: u16) {
        self.input.touch(x, y);
    }

    /// Lift the pen
    pub fn release_screen(&mut self) {
        self.input.release_touch();
    }

    pub fn set_lid_closed(&mut self, closed: bool) {
        let was_closed = self.input.lid_closed();
        self.input.set_lid_closed(closed);
        if was_closed && !closed {
            self.set_irq(CpuId::Arm7, Irq::LidOpen);
        }
    }

    pub fn is_lid_closed(&self) -> bool {
        self.input.lid_closed()
    }

    /// Latched touch position while the pen is down, for the touch
    /// controller collaborator
    pub fn touch_position(&self) -> (u16, u16) {
        (self.input.touch_x, self.input.touch_y)
    }

    pub(crate) fn check_key_irq(&mut self, cpu: CpuId) {
        if self.input.key_irq_condition(cpu.index()) {
            self.set_irq(cpu, Irq::Keypad);
        }
    }

    // ============================================================================================
    // Memory access
    // ============================================================================================

    /// Fill ARM9 bus-timing entries for an address range
    pub fn set_arm9_region_timings(
        &mut self,
        addrstart: u32,
        addrend: u32,
        buswidth: u32,
        nonseq: u8,
        seq: u8,
    ) {
        self.mem
            .set_arm9_region_timings(addrstart, addrend, buswidth, nonseq, seq);
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
        self.mem
            .set_arm7_region_timings(addrstart, addrend, buswidth, nonseq, seq);
    }

    /// Re-bank the shared WRAM between the CPUs
    pub fn map_shared_wram(&mut self, val: u8) {
        self.mem.map_shared_wram(val);
    }

    pub fn arm9_read8(&mut self, addr: u32) -> u8 {
        match addr >> 24 {
            0x02 => self.mem.main_ram[(addr & self.mem.main_ram_mask) as usize],
            0x03 => {
                let view = self.mem.swram_arm9;
                if view.mapped {
                    self.mem.shared_wram[(view.offset + (addr & view.mask)) as usize]
                } else {
                    trace!("ARM9 read8 from unmapped shared WRAM {:#010X}", addr);
                    0
                }
            }
            0x04 => io::arm9_io_read8(self, addr),
            _ => {
                trace!("unknown ARM9 read8 {:#010X}", addr);
                0
            }
        }
    }

    pub fn arm9_read16(&mut self, addr: u32) -> u16 {
        let addr = addr & !1;
        match addr >> 24 {
            0x02 => read16(&self.mem.main_ram, (addr & self.mem.main_ram_mask) as usize),
            0x03 => {
                let view = self.mem.swram_arm9;
                if view.mapped {
                    read16(
                        &self.mem.shared_wram,
                        (view.offset + (addr & view.mask)) as usize,
                    )
                } else {
                    trace!("ARM9 read16 from unmapped shared WRAM {:#010X}", addr);
                    0
                }
            }
            0x04 => io::arm9_io_read16(self, addr),
            _ => {
                trace!("unknown ARM9 read16 {:#010X}", addr);
                0
            }
        }
    }

    pub fn arm9_read32(&mut self, addr: u32) -> u32 {
        let addr = addr & !3;
        match addr >> 24 {
            0x02 => read32(&self.mem.main_ram, (addr & self.mem.main_ram_mask) as usize),
            0x03 => {
                let view = self.mem.swram_arm9;
                if view.mapped {
                    read32(
                        &self.mem.shared_wram,
                        (view.offset + (addr & view.mask)) as usize,
                    )
                } else {
                    trace!("ARM9 read32 from unmapped shared WRAM {:#010X}", addr);
                    0
                }
            }
            0x04 => io::arm9_io_read32(self, addr),
            _ => {
                trace!("unknown ARM9 read32 {:#010X}", addr);
                0
            }
        }
    }

    pub fn arm9_write8(&mut self, addr: u32, val: u8) {
        match addr >> 24 {
            0x02 => self.mem.main_ram[(addr & self.mem.main_ram_mask) as usize] = val,
            0x03 => {
                let view = self.mem.swram_arm9;
                if view.mapped {
                    self.mem.shared_wram[(view.offset + (addr & view.mask)) as usize] = val;
                } else {
                    trace!("ARM9 write8 to unmapped shared WRAM {:#010X}", addr);
                }
            }
            0x04 => io::arm9_io_write8(self, addr, val),
            _ => trace!("unknown ARM9 write8 {:#010X}", addr),
        }
    }

    pub fn arm9_write16(&mut self, addr: u32, val: u16) {
        let addr = addr & !1;
        match addr >> 24 {
            0x02 => write16(
                &mut self.mem.main_ram,
                (addr & self.mem.main_ram_mask) as usize,
                val,
            ),
            0x03 => {
                let view = self.mem.swram_arm9;
                if view.mapped {
                    write16(
                        &mut self.mem.shared_wram,
                        (view.offset + (addr & view.mask)) as usize,
                        val,
                    );
                } else {
                    trace!("ARM9 write16 to unmapped shared WRAM {:#010X}", addr);
                }
            }
            0x04 => io::arm9_io_write16(self, addr, val),
            _ => trace!("unknown ARM9 write16 {:#010X}", addr),
        }
    }

    pub fn arm9_write32(&mut self, addr: u32, val: u32) {
        let addr = addr & !3;
        match addr >> 24 {
            0x02 => write32(
                &mut self.mem.main_ram,
                (addr & self.mem.main_ram_mask) as usize,
                val,
            ),
            0x03 => {
                let view = self.mem.swram_arm9;
                if view.mapped {
                    write32(
                        &mut self.mem.shared_wram,
                        (view.offset + (addr & view.mask)) as usize,
                        val,
                    );
                } else {
                    trace!("ARM9 write32 to unmapped shared WRAM {:#010X}", addr);
                }
            }
            0x04 => io::arm9_io_write32(self, addr, val),
            _ => trace!("unknown ARM9 write32 {:#010X}", addr),
        }
    }

    /// The ARM7's 0x03xxxxxx region: shared WRAM when banked in, private
    /// WRAM above it or as the fallback
    fn arm7_wram_view(&self, addr: u32) -> (bool, u32) {
        if addr < oxidizds_hw::memory_map::arm7_wram::BASE && self.mem.swram_arm7.mapped {
            let view = self.mem.swram_arm7;
            (true, view.offset + (addr & view.mask))
        } else {
            (
                false,
                addr & (oxidizds_hw::memory_map::arm7_wram::SIZE - 1) as u32,
            )
        }
    }

    pub fn arm7_read8(&mut self, addr: u32) -> u8 {
        match addr >> 24 {
            0x02 => self.mem.main_ram[(addr & self.mem.main_ram_mask) as usize],
            0x03 => {
                let (shared, off) = self.arm7_wram_view(addr);
                if shared {
                    self.mem.shared_wram[off as usize]
                } else {
                    self.mem.arm7_wram[off as usize]
                }
            }
            0x04 => io::arm7_io_read8(self, addr),
            _ => {
                trace!("unknown ARM7 read8 {:#010X}", addr);
                0
            }
        }
    }

    pub fn arm7_read16(&mut self, addr: u32) -> u16 {
        let addr = addr & !1;
        match addr >> 24 {
            0x02 => read16(&self.mem.main_ram, (addr & self.mem.main_ram_mask) as usize),
            0x03 => {
                let (shared, off) = self.arm7_wram_view(addr);
                if shared {
                    read16(&self.mem.shared_wram, off as usize)
                } else {
                    read16(&self.mem.arm7_wram, off as usize)
                }
            }
            0x04 => io::arm7_io_read16(self, addr),
            _ => {
                trace!("unknown ARM7 read16 {:#010X}", addr);
                0
            }
        }
    }

    pub fn arm7_read32(&mut self, addr: u32) -> u32 {
        let addr = addr & !3;
        match addr >> 24 {
            0x02 => read32(&self.mem.main_ram, (addr & self.mem.main_ram_mask) as usize),
            0x03 => {
                let (shared, off) = self.arm7_wram_view(addr);
                if shared {
                    read32(&self.mem.shared_wram, off as usize)
                } else {
                    read32(&self.mem.arm7_wram, off as usize)
                }
            }
            0x04 => io::arm7_io_read32(self, addr),
            _ => {
                trace!("unknown ARM7 read32 {:#010X}", addr);
                0
            }
        }
    }

    pub fn arm7_write8(&mut self, addr: u32, val: u8) {
        match addr >> 24 {
            0x02 => self.mem.main_ram[(addr & self.mem.main_ram_mask) as usize] = val,
            0x03 => {
                let (shared, off) = self.arm7_wram_view(addr);
                if shared {
                    self.mem.shared_wram[off as usize] = val;
                } else {
                    self.mem.arm7_wram[off as usize] = val;
                }
            }
            0x04 => io::arm7_io_write8(self, addr, val),
            _ => trace!("unknown ARM7 write8 {:#010X}", addr),
        }
    }

    pub fn arm7_write16(&mut self, addr: u32, val: u16) {
        let addr = addr & !1;
        match addr >> 24 {
            0x02 => write16(
                &mut self.mem.main_ram,
                (addr & self.mem.main_ram_mask) as usize,
                val,
            ),
            0x03 => {
                let (shared, off) = self.arm7_wram_view(addr);
                if shared {
                    write16(&mut self.mem.shared_wram, off as usize, val);
                } else {
                    write16(&mut self.mem.arm7_wram, off as usize, val);
                }
            }
            0x04 => io::arm7_io_write16(self, addr, val),
            _ => trace!("unknown ARM7 write16 {:#010X}", addr),
        }
    }

    pub fn arm7_write32(&mut self, addr: u32, val: u32) {
        let addr = addr & !3;
        match addr >> 24 {
            0x02 => write32(
                &mut self.mem.main_ram,
                (addr & self.mem.main_ram_mask) as usize,
                val,
            ),
            0x03 => {
                let (shared, off) = self.arm7_wram_view(addr);
                if shared {
                    write32(&mut self.mem.shared_wram, off as usize, val);
                } else {
                    write32(&mut self.mem.arm7_wram, off as usize, val);
                }
            }
            0x04 => io::arm7_io_write32(self, addr, val),
            _ => trace!("unknown ARM7 write32 {:#010X}", addr),
        }
    }

    /// A direct view of the segment behind an ARM9 address, for the
    /// instruction-fetch/caching collaborator. Valid until the next call
    /// that changes memory mapping.
    pub fn arm9_get_mem_region(&self, addr: u32, _write: bool) -> Option<MemRegion<'_>> {
        match addr >> 24 {
            0x02 => Some(MemRegion {
                mem: &self.mem.main_ram,
                mask: self.mem.main_ram_mask,
            }),
            0x03 if self.mem.swram_arm9.mapped => {
                let view = self.mem.swram_arm9;
                let start = view.offset as usize;
                Some(MemRegion {
                    mem: &self.mem.shared_wram[start..start + view.mask as usize + 1],
                    mask: view.mask,
                })
            }
            _ => None,
        }
    }

    /// A direct view of the segment behind an ARM7 address
    pub fn arm7_get_mem_region(&self, addr: u32, _write: bool) -> Option<MemRegion<'_>> {
        match addr >> 24 {
            0x02 => Some(MemRegion {
                mem: &self.mem.main_ram,
                mask: self.mem.main_ram_mask,
            }),
            0x03 => {
                if addr < oxidizds_hw::memory_map::arm7_wram::BASE && self.mem.swram_arm7.mapped {
                    let view = self.mem.swram_arm7;
                    let start = view.offset as usize;
                    Some(MemRegion {
                        mem: &self.mem.shared_wram[start..start + view.mask as usize + 1],
                        mask: view.mask,
                    })
                } else {
                    Some(MemRegion {
                        mem: &self.mem.arm7_wram,
                        mask: (oxidizds_hw::memory_map::arm7_wram::SIZE - 1) as u32,
                    })
                }
            }
            _ => None,
        }
    }

    /// Diagnostic print used by homebrew: reads a NUL-terminated string from
    /// the requesting CPU's address space and emits it through the log
    pub fn nocash_print(&mut self, cpu: CpuId, addr: u32) {
        let mut out = Vec::new();
        for i in 0..1024 {
            let byte = match cpu {
                CpuId::Arm9 => self.arm9_read8(addr.wrapping_add(i)),
                CpuId::Arm7 => self.arm7_read8(addr.wrapping_add(i)),
            };
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        info!("{:?}: {}", cpu, String::from_utf8_lossy(&out));
    }

    // ============================================================================================
    // Savestates
    // ============================================================================================

    /// Serialize the machine into a fresh savestate stream
    pub fn write_savestate(&mut self) -> Vec<u8> {
        let mut file = Savestate::new_save(self.console_type as u8);
        self.do_savestate(&mut file);
        file.into_bytes()
    }

    /// Restore the machine from a savestate stream.
    ///
    /// A corrupt or incompatible stream leaves the live state untouched and
    /// reports the failure.
    pub fn load_savestate(&mut self, data: &[u8]) -> Result<(), String> {
        let (mut file, console_type) = Savestate::open_load(data.to_vec())?;
        if console_type != self.console_type as u8 {
            return Err(format!(
                "savestate console type {} does not match the running machine",
                console_type
            ));
        }
        let backup = self.write_savestate();
        self.do_savestate(&mut file);
        if file.has_error() || !file.at_end() {
            // the backup came from the same layout, so re-applying it
            // restores the exact pre-load state
            let (mut rollback, _) = Savestate::open_load(backup)?;
            self.do_savestate(&mut rollback);
            return Err("corrupt or truncated savestate stream".to_string());
        }
        Ok(())
    }

    fn do_savestate(&mut self, file: &mut Savestate) {
        file.section(b"CLKS");
        self.cpus[0].do_savestate(file);
        self.cpus[1].do_savestate(file);
        let mut cur = self.cur_cpu.index() as u8;
        file.var_u8(&mut cur);
        self.cur_cpu = if cur == 0 { CpuId::Arm9 } else { CpuId::Arm7 };
        file.var_u32(&mut self.cpu_stop);
        file.var_u32(&mut self.vcount);

        file.section(b"SCHD");
        self.sched.do_savestate(file);
        file.section(b"IRQS");
        self.irq.do_savestate(file);
        file.section(b"TIMR");
        self.timers.do_savestate(file);
        file.section(b"DMAS");
        self.dma.do_savestate(file);
        file.section(b"INPT");
        self.input.do_savestate(file);
        file.section(b"MEMG");
        self.mem.do_savestate(file);

        if !file.is_saving() {
            // derived lines are recomputed, not trusted from the stream
            self.update_irq(CpuId::Arm9);
            self.update_irq(CpuId::Arm7);
        }
    }
}

/// Convert a base-clock value into the ARM9 domain, saturating instead of
/// wrapping for the "no pending event" sentinel
fn to_arm9_domain(t: u64) -> u64 {
    if t >> (64 - cpu_specs::ARM9_CLOCK_SHIFT) != 0 {
        u64::MAX
    } else {
        t << cpu_specs::ARM9_CLOCK_SHIFT
    }
}

fn read16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn write16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn write32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn running_console() -> Console {
        let mut nds = Console::new(EmulatorConfig::default());
        nds.reset();
        nds
    }

    /// A core that halts its CPU the first time it runs and idles afterwards
    struct HaltCore {
        cpu: CpuId,
        halted_once: bool,
    }

    impl HaltCore {
        fn new(cpu: CpuId) -> Self {
            Self {
                cpu,
                halted_once: false,
            }
        }
    }

    impl CpuCore for HaltCore {
        fn execute(&mut self, nds: &mut Console) {
            if self.halted_once {
                let clock = nds.cpu_clock_mut(self.cpu);
                clock.timestamp = clock.target;
            } else {
                self.halted_once = true;
                nds.halt(self.cpu);
            }
        }
    }

    /// A core that counts its slices and idles to the target
    struct CountingCore {
        cpu: CpuId,
        runs: Rc<Cell<u32>>,
    }

    impl CpuCore for CountingCore {
        fn execute(&mut self, nds: &mut Console) {
            self.runs.set(self.runs.get() + 1);
            let clock = nds.cpu_clock_mut(self.cpu);
            clock.timestamp = clock.target;
        }
    }

    /// A hook that raises one IRQ whenever any event reaches it
    struct IrqHook(CpuId, Irq);

    impl EventHook for IrqHook {
        fn event(&mut self, nds: &mut Console, _kind: EventKind, _param: u32) {
            nds.set_irq(self.0, self.1);
        }
    }

    #[test]
    fn one_frame_advances_the_base_clock_by_one_frame() {
        let mut nds = running_console();
        assert_eq!(nds.run_frame(), FrameOutcome::Rendered);
        assert_eq!(nds.sys_clock_cycles(), display::FRAME_CYCLES);
        assert_eq!(nds.vcount(), 0);

        nds.run_frame();
        assert_eq!(nds.sys_clock_cycles(), 2 * display::FRAME_CYCLES);
    }

    #[test]
    fn timestamp_never_exceeds_target() {
        let mut nds = running_console();
        for _ in 0..3 {
            nds.run_frame();
            for cpu in [CpuId::Arm9, CpuId::Arm7] {
                let clock = nds.cpu_clock(cpu);
                assert!(clock.timestamp <= clock.target);
            }
        }
        // both CPUs ended the frame at the same base-clock position
        let arm9 = nds.cpu_clock(CpuId::Arm9).timestamp >> cpu_specs::ARM9_CLOCK_SHIFT;
        assert_eq!(arm9, nds.cpu_clock(CpuId::Arm7).timestamp);
    }

    #[test]
    fn skip_frame_suppresses_presentation() {
        let mut nds = Console::new(EmulatorConfig {
            skip_frame: true,
            ..EmulatorConfig::default()
        });
        nds.reset();
        assert_eq!(nds.run_frame(), FrameOutcome::Skipped);
        nds.set_skip_frame(false);
        assert_eq!(nds.run_frame(), FrameOutcome::Rendered);
    }

    #[test]
    fn run_frame_after_stop_does_nothing() {
        let mut nds = running_console();
        nds.stop();
        assert_eq!(nds.lifecycle(), LifecycleState::Stopped);
        assert_eq!(nds.run_frame(), FrameOutcome::Stopped);
        assert_eq!(nds.sys_clock_cycles(), 0);
    }

    #[test]
    fn reset_returns_state_to_power_on() {
        let mut nds = running_console();
        nds.run_frame();
        nds.set_irq(CpuId::Arm9, Irq::Wifi);
        nds.reset();
        assert_eq!(nds.sys_clock_cycles(), 0);
        assert_eq!(nds.irq.irf[0], 0);
        assert_eq!(nds.lifecycle(), LifecycleState::Running);
    }

    #[test]
    fn vblank_raises_irq_and_wakes_the_frame() {
        let mut nds = running_console();
        nds.run_frame();
        assert_ne!(nds.irq.irf[0] & (1 << Irq::VBlank as u32), 0);
        assert_ne!(nds.irq.irf[1] & (1 << Irq::VBlank as u32), 0);
    }

    #[test]
    fn irq_visibility_is_immediate_after_mmio_writes() {
        let mut nds = running_console();
        nds.arm9_write32(0x0400_0210, 1 << Irq::VBlank as u32); // IE
        nds.arm9_write32(0x0400_0208, 1); // IME
        assert!(!nds.cpu_clock(CpuId::Arm9).irq);

        nds.set_irq(CpuId::Arm9, Irq::VBlank);
        assert!(nds.cpu_clock(CpuId::Arm9).irq);

        // acknowledging through IF drops the line within the same step
        nds.arm9_write32(0x0400_0214, 1 << Irq::VBlank as u32);
        assert!(!nds.cpu_clock(CpuId::Arm9).irq);
    }

    #[test]
    fn halted_fast_forward_stops_at_the_nearest_bound() {
        let mut nds = running_console();
        nds.cpus[1].halted = true;
        nds.cpus[1].timestamp = 100;
        nds.cpus[1].target = 5000;

        // event at 800 is sooner than the ARM9 position at 1200
        nds.sched.schedule(EventKind::Wifi, false, 800, 0);
        nds.cpus[0].timestamp = 1200 << cpu_specs::ARM9_CLOCK_SHIFT;
        nds.fast_forward_halted(CpuId::Arm7);
        assert_eq!(nds.cpus[1].timestamp, 800);

        // the ARM9 position at 600 is sooner than the next event
        let mut nds = running_console();
        nds.cpus[1].halted = true;
        nds.cpus[1].timestamp = 100;
        nds.cpus[1].target = 5000;
        nds.sched.schedule(EventKind::Wifi, false, 800, 0);
        nds.cpus[0].timestamp = 600 << cpu_specs::ARM9_CLOCK_SHIFT;
        nds.fast_forward_halted(CpuId::Arm7);
        assert_eq!(nds.cpus[1].timestamp, 600);
    }

    #[test]
    fn halted_cpu_wakes_on_a_qualifying_interrupt() {
        let mut nds = running_console();
        nds.set_cpu_core(CpuId::Arm7, Box::new(HaltCore::new(CpuId::Arm7)));
        nds.set_event_hook(Box::new(IrqHook(CpuId::Arm7, Irq::Wifi)));
        nds.irq.ie[1] = 1 << Irq::Wifi as u32;

        // the hook raises the wake source mid-frame
        nds.schedule_event(EventKind::Wifi, false, 5000, 0);
        nds.run_frame();

        assert!(!nds.cpu_clock(CpuId::Arm7).halted);
        // the halt never blocked the timeline
        assert_eq!(nds.sys_clock_cycles(), display::FRAME_CYCLES);
    }

    #[test]
    fn halted_cpu_without_wake_source_sleeps_through_the_frame() {
        let mut nds = running_console();
        nds.set_cpu_core(CpuId::Arm7, Box::new(HaltCore::new(CpuId::Arm7)));
        nds.run_frame();
        assert!(nds.cpu_clock(CpuId::Arm7).halted);
        assert_eq!(nds.cpu_clock(CpuId::Arm7).timestamp, display::FRAME_CYCLES);
    }

    #[test]
    fn stop_bits_keep_a_core_off_the_bus() {
        let runs = Rc::new(Cell::new(0));
        let mut nds = running_console();
        nds.set_cpu_core(
            CpuId::Arm9,
            Box::new(CountingCore {
                cpu: CpuId::Arm9,
                runs: runs.clone(),
            }),
        );

        nds.stop_cpu(CpuId::Arm9, 0x1);
        nds.run_frame();
        assert_eq!(runs.get(), 0);

        nds.resume_cpu(CpuId::Arm9, 0x1);
        nds.run_frame();
        assert!(runs.get() > 0);
    }

    #[test]
    fn gxfifo_stall_blocks_only_the_arm9() {
        let mut nds = running_console();
        nds.gxfifo_stall();
        assert!(nds.cpu_stopped(CpuId::Arm9));
        assert!(!nds.cpu_stopped(CpuId::Arm7));
        nds.gxfifo_unstall();
        assert!(!nds.cpu_stopped(CpuId::Arm9));
    }

    #[test]
    fn immediate_dma_write_stalls_the_cpu_until_done() {
        let mut nds = running_console();
        // channel 1, immediate mode, enable
        nds.arm9_write32(0x0400_00C4, crate::dma::cnt::ENABLE);
        assert!(nds.cpu_stopped(CpuId::Arm9));
        assert!(nds.dmas_running(CpuId::Arm9));

        nds.dma_done(CpuId::Arm9, 1);
        assert!(!nds.cpu_stopped(CpuId::Arm9));
        assert!(!nds.dmas_running(CpuId::Arm9));
    }

    #[test]
    fn timer_overflow_irq_flows_through_the_frame_loop() {
        let mut nds = running_console();
        // reload just below the edge, prescaler 1024, IRQ on overflow
        nds.arm9_write16(0x0400_0100, 0xFF00);
        nds.arm9_write16(0x0400_0102, 0x00C3);
        for _ in 0..4 {
            nds.run_frame();
        }
        assert_ne!(nds.irq.irf[0] & (1 << Irq::Timer0 as u32), 0);
    }

    #[test]
    fn keypad_condition_raises_irq_on_key_change() {
        let mut nds = running_console();
        // KEYCNT: IRQ enable, OR over A and B
        nds.arm7_write16(0x0400_0132, 0x4000 | 0x3);
        assert_eq!(nds.irq.irf[1] & (1 << Irq::Keypad as u32), 0);
        nds.set_key_mask(0x1);
        assert_ne!(nds.irq.irf[1] & (1 << Irq::Keypad as u32), 0);
    }

    #[test]
    fn shared_wram_banking_moves_the_block_between_cpus() {
        let mut nds = running_console();
        // all to ARM9 at reset
        nds.arm9_write32(0x0300_0000, 0xCAFEBABE);
        assert_eq!(nds.arm9_read32(0x0300_0000), 0xCAFEBABE);

        // hand the whole block to the ARM7
        nds.arm9_write8(0x0400_0247, 3);
        assert_eq!(nds.arm9_read32(0x0300_0000), 0);
        assert!(nds.arm9_get_mem_region(0x0300_0000, false).is_none());
        assert_eq!(nds.arm7_read32(0x0300_0000), 0xCAFEBABE);
        assert_eq!(nds.arm7_read8(0x0400_0241), 3);
    }

    #[test]
    fn main_ram_is_shared_and_mirrored() {
        let mut nds = running_console();
        nds.arm9_write16(0x0200_0000, 0xBEEF);
        assert_eq!(nds.arm7_read16(0x0200_0000), 0xBEEF);
        // mirrored through the 4 MB mask
        assert_eq!(nds.arm7_read16(0x0240_0000), 0xBEEF);
    }

    #[test]
    fn mem_region_views_match_the_accessors() {
        let mut nds = running_console();
        nds.arm7_write32(0x0380_0000, 0x12345678);
        let region = nds.arm7_get_mem_region(0x0380_0000, false).unwrap();
        let off = (0x0380_0000u32 & region.mask) as usize;
        assert_eq!(region.mem[off], 0x78);
    }

    #[test]
    fn haltcnt_write_halts_the_arm7() {
        let mut nds = running_console();
        nds.arm7_write8(0x0400_0301, 0x80);
        assert!(nds.cpu_clock(CpuId::Arm7).halted);
    }

    #[test]
    fn savestate_round_trip_preserves_the_machine() {
        let mut nds = running_console();
        nds.run_frame();
        nds.set_key_mask(0x41);
        nds.arm9_write16(0x0400_0102, 0x0080);
        let saved = nds.write_savestate();

        nds.run_frame();
        nds.load_savestate(&saved).unwrap();
        assert_eq!(nds.write_savestate(), saved);
    }

    #[test]
    fn corrupt_savestate_leaves_live_state_untouched() {
        let mut nds = running_console();
        nds.run_frame();
        let mut corrupt = nds.write_savestate();
        corrupt.truncate(corrupt.len() - 10);

        let before = nds.write_savestate();
        assert!(nds.load_savestate(&corrupt).is_err());
        assert_eq!(nds.write_savestate(), before);
    }

    #[test]
    fn savestate_console_type_must_match() {
        let mut ds = running_console();
        let saved = ds.write_savestate();

        let mut dsi = Console::new(EmulatorConfig {
            console_type: ConsoleType::Dsi,
            ..EmulatorConfig::default()
        });
        dsi.reset();
        assert!(dsi.load_savestate(&saved).is_err());
    }

    #[test]
    fn secondary_irq_registers_exist_only_on_the_extended_arm7() {
        let mut dsi = Console::new(EmulatorConfig {
            console_type: ConsoleType::Dsi,
            ..EmulatorConfig::default()
        });
        dsi.reset();
        dsi.arm7_write32(0x0400_0218, 0x100);
        assert_eq!(dsi.arm7_read32(0x0400_0218), 0x100);
        // the ARM9 has no IE2
        dsi.arm9_write32(0x0400_0218, 0xFFFF);
        assert_eq!(dsi.irq.ie2, 0x100);

        let mut ds = running_console();
        ds.arm7_write32(0x0400_0218, 0x100);
        assert_eq!(ds.irq.ie2, 0);
    }
}
