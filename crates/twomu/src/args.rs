use crate::core::{ConsoleType, EmulatorConfig};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Number of frames to run
    #[arg(long, short = 'f', default_value_t = 60)]
    pub frames: u32,

    /// Emulate the extended (DSi-class) hardware feature set
    #[arg(long)]
    pub dsi: bool,

    /// Suppress presentation-affecting work every frame
    #[arg(long)]
    pub skip_frames: bool,

    /// Load a savestate before running
    #[arg(long)]
    pub load_state: Option<PathBuf>,

    /// Write a savestate after the run
    #[arg(long)]
    pub save_state: Option<PathBuf>,

    /// Key mask to hold for the whole run (hex: 0x3 or decimal: 3)
    #[arg(long, value_parser = parse_hex_or_dec)]
    pub keys: Option<u32>,
}

impl Args {
    /// Convert Args to EmulatorConfig
    pub fn to_emulator_config(&self) -> EmulatorConfig {
        EmulatorConfig {
            console_type: if self.dsi {
                ConsoleType::Dsi
            } else {
                ConsoleType::Ds
            },
            skip_frame: self.skip_frames,
        }
    }
}

pub fn parse_hex_or_dec(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}
