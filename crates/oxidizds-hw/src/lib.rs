//! Hardware definitions for the Nintendo DS family.
//!
//! This crate contains only constants and register maps derived from hardware
//! documentation. It has no dependencies and no behavior; the emulator crate
//! consumes it for addresses, sizes, and timing values.

pub mod io_map;
pub mod memory_map;
pub mod specs;
