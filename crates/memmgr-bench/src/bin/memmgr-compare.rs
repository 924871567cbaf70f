//! Runs the sequential allocate/free workload against the memmgr engine or
//! the host allocator and prints one JSON timing record per run.

use clap::{Parser, ValueEnum};
use memmgr_bench::{DEFAULT_ITEMS, DEFAULT_START_SIZE, Engine, run};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// memmgr through its C ABI.
    Engine,
    /// Host malloc/free.
    System,
    /// Both, engine first.
    Both,
}

/// Compare memmgr against the system allocator.
#[derive(Debug, Parser)]
#[command(name = "memmgr-compare")]
#[command(about = "Time the sequential allocate/free workload")]
struct Cli {
    /// Allocator to drive.
    #[arg(long, value_enum, default_value = "both")]
    mode: Mode,
    /// Blocks allocated (and freed) per run.
    #[arg(long, default_value_t = DEFAULT_ITEMS)]
    items: usize,
    /// Size of the first request; each step adds one byte.
    #[arg(long, default_value_t = DEFAULT_START_SIZE)]
    start_size: usize,
    /// Repeat each run this many times.
    #[arg(long, default_value_t = 1)]
    repeat: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let engines: &[Engine] = match cli.mode {
        Mode::Engine => &[Engine::Engine],
        Mode::System => &[Engine::System],
        Mode::Both => &[Engine::Engine, Engine::System],
    };
    for _ in 0..cli.repeat {
        for &engine in engines {
            let report = run(engine, cli.items, cli.start_size);
            println!("{}", serde_json::to_string(&report)?);
        }
    }
    Ok(())
}
