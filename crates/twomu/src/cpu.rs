//! CPU-related type definitions
//!
//! The instruction-interpreting cores themselves live outside this crate; the
//! timing core only tracks each CPU's position on the shared timeline and its
//! power state, and drives an installed [`CpuCore`] implementation through the
//! frame loop.

use crate::core::Console;
use crate::savestate::Savestate;

/// Identifies one of the two CPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuId {
    /// The faster core (2x the base clock)
    Arm9,
    /// The slower core, running at the base clock
    Arm7,
}

impl CpuId {
    /// Index into per-CPU state arrays
    pub fn index(self) -> usize {
        match self {
            CpuId::Arm9 => 0,
            CpuId::Arm7 => 1,
        }
    }

    /// The other CPU
    pub fn other(self) -> CpuId {
        match self {
            CpuId::Arm9 => CpuId::Arm7,
            CpuId::Arm7 => CpuId::Arm9,
        }
    }
}

/// Per-CPU position on the shared timeline, plus power state.
///
/// `timestamp` and `target` are in the CPU's own clock domain: base cycles for
/// the ARM7, base cycles doubled for the ARM9. `timestamp <= target` holds
/// outside of a core's `execute` call; a core that overshoots its target by a
/// partial instruction has the target pulled up to match when it yields.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuClock {
    /// Cycles executed so far
    pub timestamp: u64,
    /// Cycles this CPU may run to before yielding back to the frame driver
    pub target: u64,
    /// Halted waiting for an interrupt
    pub halted: bool,
    /// An enabled interrupt is pending and should be taken at the next decode
    pub irq: bool,
}

impl CpuClock {
    pub(crate) fn reset(&mut self) {
        *self = CpuClock::default();
    }

    pub(crate) fn do_savestate(&mut self, file: &mut Savestate) {
        file.var_u64(&mut self.timestamp);
        file.var_u64(&mut self.target);
        file.var_bool(&mut self.halted);
        file.var_bool(&mut self.irq);
    }
}

/// An instruction-interpreting CPU core collaborator.
///
/// The frame driver calls `execute` only while the owning CPU is running
/// (not halted, no stop bits set). The implementation is expected to step
/// instructions, advancing `console.cpu_clock(id).timestamp` through the
/// timing core's accessors, until the timestamp reaches the target or the
/// core halts itself. Memory and IO go through the typed accessors on
/// [`Console`].
///
/// A CPU with no installed core is treated as fully idle: the driver advances
/// its timestamp straight to the target.
pub trait CpuCore {
    /// Reset the core to its power-on state
    fn reset(&mut self, _console: &mut Console) {}

    /// Execute until the owning CPU reaches its target or stops running
    fn execute(&mut self, console: &mut Console);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_id_other() {
        assert_eq!(CpuId::Arm9.other(), CpuId::Arm7);
        assert_eq!(CpuId::Arm7.other(), CpuId::Arm9);
        assert_eq!(CpuId::Arm9.index(), 0);
        assert_eq!(CpuId::Arm7.index(), 1);
    }
}
