//! IO register addresses relevant to the timing/interrupt core.
//!
//! Both CPUs see the same addresses for most of these registers, but each CPU
//! has its own independent copy (timers, DMA, KEYCNT, interrupt state).
//!
//! # References
//! - <https://problemkaputt.de/gbatek.htm#dsiomaps>

/// DMA channel registers (4 channels per CPU)
pub mod dma {
    /// Source address of channel 0; channels are laid out back to back
    pub const BASE: u32 = 0x0400_00B0;
    /// Bytes between consecutive channels (SAD + DAD + CNT)
    pub const CHANNEL_STRIDE: u32 = 12;
    /// End of the DMA register block (exclusive)
    pub const END: u32 = BASE + 4 * CHANNEL_STRIDE;
    /// Offset of the source address register within a channel
    pub const SAD: u32 = 0;
    /// Offset of the destination address register within a channel
    pub const DAD: u32 = 4;
    /// Offset of the control register within a channel
    pub const CNT: u32 = 8;
}

/// Timer registers (4 timers per CPU)
pub mod timers {
    /// Counter/reload + control of timer 0; timers are laid out back to back
    pub const BASE: u32 = 0x0400_0100;
    /// Bytes between consecutive timers (counter/reload + control)
    pub const TIMER_STRIDE: u32 = 4;
    /// End of the timer register block (exclusive)
    pub const END: u32 = BASE + 4 * TIMER_STRIDE;
}

/// Keypad registers
pub mod keypad {
    /// Key status (active low)
    pub const KEYINPUT: u32 = 0x0400_0130;
    /// Key interrupt control (independent per CPU)
    pub const KEYCNT: u32 = 0x0400_0132;
    /// Extra key status: X/Y buttons, pen down, hinge (ARM7 only)
    pub const EXTKEYIN: u32 = 0x0400_0136;
}

/// Interrupt controller registers
pub mod irq {
    /// Interrupt master enable (bit 0)
    pub const IME: u32 = 0x0400_0208;
    /// Interrupt enable mask
    pub const IE: u32 = 0x0400_0210;
    /// Interrupt request flags (write 1 to acknowledge)
    pub const IF: u32 = 0x0400_0214;
    /// Secondary interrupt enable mask (extended console, ARM7 only)
    pub const IE2: u32 = 0x0400_0218;
    /// Secondary interrupt request flags (extended console, ARM7 only)
    pub const IF2: u32 = 0x0400_021C;
}

/// System control registers
pub mod system {
    /// External memory/bus priority control (EXMEMCNT on ARM9, EXMEMSTAT on
    /// ARM7; the upper bits of the ARM9 copy are mirrored into the ARM7 copy)
    pub const EXMEMCNT: u32 = 0x0400_0204;
    /// Shared WRAM banking status (read-only, ARM7)
    pub const WRAMSTAT: u32 = 0x0400_0241;
    /// Shared WRAM banking control (ARM9)
    pub const WRAMCNT: u32 = 0x0400_0247;
    /// Low-power control (ARM7; writing 0x80 halts the CPU)
    pub const HALTCNT: u32 = 0x0400_0301;
}
