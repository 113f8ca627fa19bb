use clap::Parser;
use twomu::{Args, Console, FrameOutcome};
use tracing::info;

fn main() {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Create the machine and enter the running state. The CPU cores and
    // peripherals are collaborators; with none installed, both cores idle
    // and the timing fabric (scanline clock, timers, scheduler) still runs.
    info!("=== Creating Console ===");
    let mut console = Console::new(args.to_emulator_config());
    console.reset();

    if let Some(keys) = args.keys {
        console.set_key_mask(keys);
    }

    if let Some(path) = &args.load_state {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("Failed to read savestate {:?}: {}", path, e);
                std::process::exit(2);
            }
        };
        if let Err(e) = console.load_savestate(&data) {
            eprintln!("Failed to load savestate: {}", e);
            std::process::exit(2);
        }
        info!("Loaded savestate from {:?}", path);
    }

    // Run the requested number of frames
    info!("=== Running ({} frames) ===", args.frames);
    let mut rendered = 0u32;
    let mut skipped = 0u32;
    for _ in 0..args.frames {
        match console.run_frame() {
            FrameOutcome::Rendered => rendered += 1,
            FrameOutcome::Skipped => skipped += 1,
            FrameOutcome::Stopped => break,
        }
    }

    info!("=== Run Complete ===");
    info!(
        "Frames rendered: {} skipped: {} (lifecycle: {:?})",
        rendered,
        skipped,
        console.lifecycle()
    );
    info!("Base clock: {} cycles", console.sys_clock_cycles());

    if let Some(path) = &args.save_state {
        let data = console.write_savestate();
        if let Err(e) = std::fs::write(path, data) {
            eprintln!("Failed to write savestate {:?}: {}", path, e);
            std::process::exit(2);
        }
        info!("Wrote savestate to {:?}", path);
    }
}
