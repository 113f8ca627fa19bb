//! Shared event timeline for dual-core emulation.
//!
//! Every timed piece of hardware (display, audio, wireless, transfer engines)
//! registers its next deadline here, and the frame driver uses the earliest
//! pending deadline to decide how far each CPU may run before it must yield.
//! All timestamps are in base-clock cycles.

use crate::core::Console;
use crate::savestate::Savestate;
use tracing::{trace, warn};

// ================================================================================================
// Event identities
// ================================================================================================

/// Number of fixed event slots
const FIXED_KINDS: usize = 9;

/// Identity of a scheduled callback slot.
///
/// The fixed kinds cover the built-in peripherals; `Ext` is an open pool of
/// slots for collaborator-registered one-shot or periodic events. At most one
/// entry per kind is ever pending: scheduling an already-pending kind replaces
/// the previous entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// End-of-scanline tick of the display clock (handled by the core itself)
    LcdScanline,
    /// Audio mixer sample deadline
    SpuSample,
    /// Wireless modem deadline
    Wifi,
    /// Display FIFO refill deadline
    DisplayFifo,
    /// Cart ROM transfer completion
    RomTransfer,
    /// Cart SPI transfer completion
    RomSpiTransfer,
    /// SPI bus transfer completion
    SpiTransfer,
    /// Hardware divider completion
    DivDone,
    /// Hardware square-root completion
    SqrtDone,
    /// Open pool for peripheral collaborators; the index must be below
    /// [`EventKind::EXT_SLOTS`]
    Ext(u8),
}

impl EventKind {
    /// Number of slots in the `Ext` pool
    pub const EXT_SLOTS: usize = 8;

    /// Total number of event slots
    pub const COUNT: usize = FIXED_KINDS + Self::EXT_SLOTS;

    /// Slot index; ties between events due at the same cycle are broken by
    /// this value, lowest first
    pub fn index(self) -> usize {
        match self {
            EventKind::LcdScanline => 0,
            EventKind::SpuSample => 1,
            EventKind::Wifi => 2,
            EventKind::DisplayFifo => 3,
            EventKind::RomTransfer => 4,
            EventKind::RomSpiTransfer => 5,
            EventKind::SpiTransfer => 6,
            EventKind::DivDone => 7,
            EventKind::SqrtDone => 8,
            EventKind::Ext(n) => FIXED_KINDS + (n as usize) % Self::EXT_SLOTS,
        }
    }

    fn from_index(idx: usize) -> EventKind {
        match idx {
            0 => EventKind::LcdScanline,
            1 => EventKind::SpuSample,
            2 => EventKind::Wifi,
            3 => EventKind::DisplayFifo,
            4 => EventKind::RomTransfer,
            5 => EventKind::RomSpiTransfer,
            6 => EventKind::SpiTransfer,
            7 => EventKind::DivDone,
            8 => EventKind::SqrtDone,
            n => EventKind::Ext((n - FIXED_KINDS) as u8),
        }
    }
}

/// Peripheral collaborator interface for event dispatch.
///
/// Fired events whose kind is not handled inside the core are routed here.
/// The console is handed back mutably so the handler can schedule or cancel
/// events, raise interrupts, and touch memory; such re-entrant scheduling is
/// visible to the remainder of the same event-processing pass.
pub trait EventHook {
    fn event(&mut self, console: &mut Console, kind: EventKind, param: u32);
}

// ================================================================================================
// Scheduler
// ================================================================================================

/// One pending entry: absolute due time, opaque parameter, and the repeat
/// period (0 for one-shot entries).
#[derive(Debug, Clone, Copy, Default)]
struct SchedEntry {
    timestamp: u64,
    param: u32,
    period: u64,
}

/// Ordered collection of pending timed callbacks.
///
/// Also owns the base-clock "now" that events are measured against; the frame
/// driver advances it as the CPUs make progress.
#[derive(Debug, Clone)]
pub struct Scheduler {
    entries: [SchedEntry; EventKind::COUNT],
    /// Bit per slot; set while that kind has a pending entry
    mask: u32,
    /// Current time in base-clock cycles
    timestamp: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: [SchedEntry::default(); EventKind::COUNT],
            mask: 0,
            timestamp: 0,
        }
    }

    pub fn reset(&mut self) {
        self.entries = [SchedEntry::default(); EventKind::COUNT];
        self.mask = 0;
        self.timestamp = 0;
    }

    /// Current time in base-clock cycles
    pub fn now(&self) -> u64 {
        self.timestamp
    }

    pub(crate) fn set_now(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Install an entry due `delay` base cycles from now.
    ///
    /// A pending entry of the same kind is replaced, never duplicated. For
    /// periodic entries the delay is also the repeat period and must be
    /// positive; a non-positive period is clamped to one cycle.
    pub fn schedule(&mut self, kind: EventKind, periodic: bool, delay: i64, param: u32) {
        let idx = kind.index();
        let bit = 1u32 << idx;
        if self.mask & bit != 0 {
            trace!("replacing pending event {:?}", kind);
        }
        let mut period = 0;
        if periodic {
            if delay < 1 {
                warn!("periodic event {:?} with period {} clamped to 1", kind, delay);
                period = 1;
            } else {
                period = delay as u64;
            }
        }
        self.entries[idx] = SchedEntry {
            timestamp: self.timestamp.saturating_add_signed(delay),
            param,
            period,
        };
        self.mask |= bit;
    }

    /// Remove a pending entry of this kind. No-op if none is pending.
    pub fn cancel(&mut self, kind: EventKind) {
        self.mask &= !(1u32 << kind.index());
    }

    /// Whether an entry of this kind is pending
    pub fn is_scheduled(&self, kind: EventKind) -> bool {
        self.mask & (1u32 << kind.index()) != 0
    }

    /// Timestamp of the earliest pending entry, if any
    pub fn next_timestamp(&self) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        let mut mask = self.mask;
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            let ts = self.entries[idx].timestamp;
            if earliest.is_none_or(|e| ts < e) {
                earliest = Some(ts);
            }
        }
        earliest
    }

    /// Take the earliest entry due at or before `up_to`.
    ///
    /// Ties are broken by slot index, lowest first, so firing order is
    /// deterministic. A periodic entry is re-armed at its *old* timestamp plus
    /// its period before being returned, so a chain of firings never drifts.
    /// Entries scheduled while a due entry is being handled are picked up by
    /// the next call within the same processing pass.
    pub fn pop_due(&mut self, up_to: u64) -> Option<(EventKind, u32)> {
        let mut best: Option<(usize, u64)> = None;
        let mut mask = self.mask;
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            let ts = self.entries[idx].timestamp;
            if ts <= up_to && best.is_none_or(|(_, t)| ts < t) {
                best = Some((idx, ts));
            }
        }
        let (idx, ts) = best?;
        let entry = &mut self.entries[idx];
        let param = entry.param;
        if entry.period > 0 {
            entry.timestamp = ts + entry.period;
        } else {
            self.mask &= !(1u32 << idx);
        }
        Some((EventKind::from_index(idx), param))
    }

    pub(crate) fn do_savestate(&mut self, file: &mut Savestate) {
        file.var_u64(&mut self.timestamp);
        file.var_u32(&mut self.mask);
        for entry in &mut self.entries {
            file.var_u64(&mut entry.timestamp);
            file.var_u32(&mut entry.param);
            file.var_u64(&mut entry.period);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
