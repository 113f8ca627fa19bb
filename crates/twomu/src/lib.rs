pub mod args;
pub mod core;
pub mod cpu;
pub mod dma;
pub mod input;
pub mod io;
pub mod irq;
pub mod memory;
pub mod savestate;
pub mod sched;
pub mod timers;

// Re-export commonly used types
pub use args::Args;
pub use core::{Console, ConsoleType, EmulatorConfig, FrameOutcome, LifecycleState};
pub use cpu::{CpuClock, CpuCore, CpuId};
pub use dma::DmaMode;
pub use irq::{Irq, Irq2};
pub use memory::MemRegion;
pub use savestate::Savestate;
pub use sched::{EventHook, EventKind};
