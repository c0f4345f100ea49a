mod cli;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cli::check::{cmd_check, CheckArgs};
use cli::compile::{cmd_compile, CompileArgs};
use cli::run::{cmd_run, RunArgs};

#[derive(Parser)]
#[command(
    name = "kernelc",
    version,
    about = "Compile kernel IR to OpenCL C and run it on an accelerator or the CPU"
)]
struct Cli {
    /// Device preference, most preferred first (e.g. `acc,jtp`)
    #[arg(long, global = true, value_delimiter = ',')]
    devices: Vec<String>,
    /// Worker threads for the thread-pool device
    #[arg(long, global = true)]
    threads: Option<usize>,
    /// Retry on the next device when the accelerator fails
    #[arg(long, global = true)]
    fallback: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a kernel schema to OpenCL C
    Compile(CompileArgs),
    /// Validate a kernel schema without emitting source
    Check(CheckArgs),
    /// Execute a kernel on the configured devices and print its buffers
    Run(RunArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("KERNELC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let overrides = cli::DeviceOverrides {
        devices: cli.devices,
        threads: cli.threads,
        fallback: cli.fallback,
    };

    match cli.command {
        Command::Compile(args) => cmd_compile(args),
        Command::Check(args) => cmd_check(args),
        Command::Run(args) => cmd_run(args, &overrides),
    }
}
