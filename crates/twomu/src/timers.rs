//! Periodic timer banks, four timers per CPU.
//!
//! Each timer has a 16-bit reload and counter, a prescaler (1/64/256/1024
//! base cycles per tick), an interrupt-on-overflow flag, and a count-up flag
//! that chains it to the previous timer in the bank. The live 16-bit count is
//! kept in the top half of a `u32` so the prescaler reduces to a cycle shift
//! and overflow detection to a wrap check.
//!
//! Timers tick from their owning CPU's clock advancement: the frame driver
//! calls in with that CPU's base-clock position after every execution slice.

use crate::cpu::CpuId;
use crate::savestate::Savestate;
use tracing::warn;

/// Control word bits
mod cnt {
    /// Prescaler selector
    pub const PRESCALER_MASK: u16 = 0x0003;
    /// Count-up: tick once per overflow of the previous timer instead of
    /// counting cycles
    pub const COUNT_UP: u16 = 1 << 2;
    /// Raise the owning CPU's matching timer interrupt on overflow
    pub const IRQ_ENABLE: u16 = 1 << 6;
    /// Counter runs while set
    pub const ENABLE: u16 = 1 << 7;
}

/// log2 of base cycles per tick for each prescaler setting
const PRESCALER_SHIFT: [u32; 4] = [0, 6, 8, 10];

/// One up-counter
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    /// Value loaded into the counter on overflow and on enable
    pub reload: u16,
    /// Control word
    pub cnt: u16,
    /// Running counter; the 16-bit count lives in bits 16..32, the fraction
    /// accumulated toward the next tick below
    pub counter: u32,
    /// Derived shift applied to elapsed cycles before adding to `counter`
    pub cycle_shift: u32,
}

impl Timer {
    fn enabled(&self) -> bool {
        self.cnt & cnt::ENABLE != 0
    }

    fn count_up(&self) -> bool {
        self.cnt & cnt::COUNT_UP != 0
    }

    /// The architectural 16-bit counter value
    pub fn value(&self) -> u16 {
        (self.counter >> 16) as u16
    }
}

/// Both CPUs' timer banks plus their per-CPU tick cursors.
#[derive(Debug, Clone)]
pub struct TimerBank {
    /// Timers 0..4 belong to the ARM9, 4..8 to the ARM7
    timers: [Timer; 8],
    /// Base-clock position each bank has been ticked to
    timestamp: [u64; 2],
    /// Bank-local bitmask of timers that count cycles (enabled, not count-up)
    check_mask: [u8; 2],
    /// Bank-local bitmask of timers that overflowed with IRQ enabled since
    /// the last drain
    irq_mask: [u8; 2],
}

impl TimerBank {
    pub fn new() -> Self {
        Self {
            timers: [Timer::default(); 8],
            timestamp: [0; 2],
            check_mask: [0; 2],
            irq_mask: [0; 2],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The timer at a global index (0..8)
    pub fn timer(&self, tid: usize) -> &Timer {
        &self.timers[tid]
    }

    fn bank(cpu: CpuId) -> usize {
        cpu.index() * 4
    }

    fn update_check_mask(&mut self, cpu: CpuId) {
        let base = Self::bank(cpu);
        let mut mask = 0u8;
        for i in 0..4 {
            let timer = &self.timers[base + i];
            if timer.enabled() && !timer.count_up() {
                mask |= 1 << i;
            }
        }
        self.check_mask[cpu.index()] = mask;
    }

    /// Write a timer's reload value (the IO counter/reload register)
    pub fn write_reload(&mut self, cpu: CpuId, idx: usize, val: u16) {
        self.timers[Self::bank(cpu) + (idx & 3)].reload = val;
    }

    /// Write a timer's control word.
    ///
    /// Enabling a stopped timer loads the counter from the reload value.
    /// Count-up on the first timer of a bank has nothing to chain from and is
    /// ignored; chaining therefore only ever points from a timer to the next
    /// higher index within the same bank, so dependency cycles cannot form.
    pub fn write_cnt(&mut self, cpu: CpuId, idx: usize, mut val: u16) {
        let idx = idx & 3;
        if idx == 0 && val & cnt::COUNT_UP != 0 {
            warn!("count-up enabled on timer 0 of the {:?} bank; ignored", cpu);
            val &= !cnt::COUNT_UP;
        }
        let timer = &mut self.timers[Self::bank(cpu) + idx];
        let was_enabled = timer.enabled();
        timer.cnt = val;
        timer.cycle_shift = 16 - PRESCALER_SHIFT[(val & cnt::PRESCALER_MASK) as usize];
        if !was_enabled && timer.enabled() {
            timer.counter = (timer.reload as u32) << 16;
        }
        self.update_check_mask(cpu);
    }

    /// The architectural counter value of a timer, for IO reads
    pub fn read_counter(&self, cpu: CpuId, idx: usize) -> u16 {
        self.timers[Self::bank(cpu) + (idx & 3)].value()
    }

    /// The control word of a timer, for IO reads
    pub fn read_cnt(&self, cpu: CpuId, idx: usize) -> u16 {
        self.timers[Self::bank(cpu) + (idx & 3)].cnt
    }

    /// Tick a bank up to the owning CPU's base-clock position.
    ///
    /// Returns a bank-local bitmask of timers that overflowed with their
    /// interrupt flag enabled; the caller raises the matching IRQ sources.
    pub fn run(&mut self, cpu: CpuId, time: u64) -> u8 {
        let i = cpu.index();
        let cycles = time.saturating_sub(self.timestamp[i]);
        self.timestamp[i] = time;
        if cycles == 0 || self.check_mask[i] == 0 {
            return std::mem::take(&mut self.irq_mask[i]);
        }

        let base = Self::bank(cpu);
        let mut mask = self.check_mask[i];
        while mask != 0 {
            let idx = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            self.tick(base + idx, cycles);
        }
        std::mem::take(&mut self.irq_mask[i])
    }

    fn tick(&mut self, tid: usize, mut cycles: u64) {
        // chunk so the shifted add always fits; long fast-forward gaps land
        // here with far more cycles than a normal scanline slice
        let shift = self.timers[tid].cycle_shift;
        let max_chunk = (u32::MAX >> shift) as u64;
        while cycles > 0 {
            let chunk = cycles.min(max_chunk) as u32;
            cycles -= chunk as u64;
            let old = self.timers[tid].counter;
            let new = old.wrapping_add(chunk << shift);
            self.timers[tid].counter = new;
            if new < old {
                self.overflow(tid);
            }
        }
    }

    /// Reload, request the IRQ, and feed a chained neighbor one tick
    fn overflow(&mut self, tid: usize) {
        let reload = self.timers[tid].reload;
        let cnt_word = self.timers[tid].cnt;
        self.timers[tid].counter = (reload as u32) << 16;
        if cnt_word & cnt::IRQ_ENABLE != 0 {
            self.irq_mask[tid / 4] |= 1 << (tid & 3);
        }
        if tid & 3 != 3 && self.timers[tid + 1].enabled() && self.timers[tid + 1].count_up() {
            // exactly one count, regardless of the neighbor's prescaler
            let old = self.timers[tid + 1].counter;
            let new = old.wrapping_add(1 << 16);
            self.timers[tid + 1].counter = new;
            if new < old {
                self.overflow(tid + 1);
            }
        }
    }

    pub(crate) fn do_savestate(&mut self, file: &mut Savestate) {
        for timer in &mut self.timers {
            file.var_u16(&mut timer.reload);
            file.var_u16(&mut timer.cnt);
            file.var_u32(&mut timer.counter);
            file.var_u32(&mut timer.cycle_shift);
        }
        for i in 0..2 {
            file.var_u64(&mut self.timestamp[i]);
            file.var_u8(&mut self.check_mask[i]);
            file.var_u8(&mut self.irq_mask[i]);
        }
    }
}

impl Default for TimerBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_loads_reload_on_enable() {
        let mut bank = TimerBank::new();
        bank.write_reload(CpuId::Arm9, 0, 0x1234);
        bank.write_cnt(CpuId::Arm9, 0, cnt::ENABLE);
        assert_eq!(bank.read_counter(CpuId::Arm9, 0), 0x1234);
    }

    #[test]
    fn disabled_timer_does_not_count() {
        let mut bank = TimerBank::new();
        bank.write_reload(CpuId::Arm9, 0, 0);
        assert_eq!(bank.run(CpuId::Arm9, 1000), 0);
        assert_eq!(bank.read_counter(CpuId::Arm9, 0), 0);
    }

    #[test]
    fn counts_elapsed_cycles_at_prescaler_one() {
        let mut bank = TimerBank::new();
        bank.write_cnt(CpuId::Arm9, 0, cnt::ENABLE);
        bank.run(CpuId::Arm9, 100);
        assert_eq!(bank.read_counter(CpuId::Arm9, 0), 100);
        // the cursor is absolute, not relative
        bank.run(CpuId::Arm9, 250);
        assert_eq!(bank.read_counter(CpuId::Arm9, 0), 250);
    }

    #[test]
    fn prescaler_divides_the_base_clock() {
        let mut bank = TimerBank::new();
        // prescaler setting 1 = one tick per 64 cycles
        bank.write_cnt(CpuId::Arm7, 0, cnt::ENABLE | 1);
        bank.run(CpuId::Arm7, 640);
        assert_eq!(bank.read_counter(CpuId::Arm7, 0), 10);
    }

    #[test]
    fn overflow_reloads_and_requests_irq() {
        let mut bank = TimerBank::new();
        bank.write_reload(CpuId::Arm9, 0, 0xFFF0);
        bank.write_cnt(CpuId::Arm9, 0, cnt::ENABLE | cnt::IRQ_ENABLE);
        // 0x10 cycles to overflow, then reload
        let irqs = bank.run(CpuId::Arm9, 0x10);
        assert_eq!(irqs, 1 << 0);
        assert_eq!(bank.read_counter(CpuId::Arm9, 0), 0xFFF0);
    }

    #[test]
    fn overflow_without_irq_enable_is_silent() {
        let mut bank = TimerBank::new();
        bank.write_reload(CpuId::Arm9, 0, 0xFFFF);
        bank.write_cnt(CpuId::Arm9, 0, cnt::ENABLE);
        assert_eq!(bank.run(CpuId::Arm9, 2), 0);
    }

    #[test]
    fn chained_timer_ticks_once_per_overflow() {
        let mut bank = TimerBank::new();
        // timer 0: reload 0xFFFF, prescaler 1; timer 1 chained
        bank.write_reload(CpuId::Arm9, 0, 0xFFFF);
        bank.write_cnt(CpuId::Arm9, 0, cnt::ENABLE);
        bank.write_cnt(CpuId::Arm9, 1, cnt::ENABLE | cnt::COUNT_UP);

        // two base cycles: timer 0 overflows exactly once
        bank.run(CpuId::Arm9, 2);
        assert_eq!(bank.read_counter(CpuId::Arm9, 1), 1);

        // the chained timer ignores its own prescaler and elapsed cycles
        bank.run(CpuId::Arm9, 3);
        assert_eq!(bank.read_counter(CpuId::Arm9, 1), 2);
    }

    #[test]
    fn chain_propagates_through_the_bank() {
        let mut bank = TimerBank::new();
        bank.write_reload(CpuId::Arm7, 0, 0xFFFF);
        bank.write_cnt(CpuId::Arm7, 0, cnt::ENABLE);
        bank.write_reload(CpuId::Arm7, 1, 0xFFFF);
        bank.write_cnt(CpuId::Arm7, 1, cnt::ENABLE | cnt::COUNT_UP);
        bank.write_cnt(CpuId::Arm7, 2, cnt::ENABLE | cnt::COUNT_UP | cnt::IRQ_ENABLE);

        // timer 0 overflows, ticking timer 1 from 0xFFFF over the edge,
        // which in turn ticks timer 2
        let irqs = bank.run(CpuId::Arm7, 1);
        assert_eq!(irqs, 1 << 2);
        assert_eq!(bank.read_counter(CpuId::Arm7, 2), 1);
    }

    #[test]
    fn count_up_on_bank_slot_zero_is_rejected() {
        let mut bank = TimerBank::new();
        bank.write_cnt(CpuId::Arm9, 0, cnt::ENABLE | cnt::COUNT_UP);
        assert_eq!(bank.read_cnt(CpuId::Arm9, 0) & cnt::COUNT_UP, 0);
        // still counts cycles like a normal timer
        bank.run(CpuId::Arm9, 5);
        assert_eq!(bank.read_counter(CpuId::Arm9, 0), 5);
    }

    #[test]
    fn banks_are_independent_per_cpu() {
        let mut bank = TimerBank::new();
        bank.write_cnt(CpuId::Arm9, 0, cnt::ENABLE);
        bank.write_cnt(CpuId::Arm7, 0, cnt::ENABLE);
        bank.run(CpuId::Arm9, 100);
        bank.run(CpuId::Arm7, 40);
        assert_eq!(bank.read_counter(CpuId::Arm9, 0), 100);
        assert_eq!(bank.read_counter(CpuId::Arm7, 0), 40);
    }
}
