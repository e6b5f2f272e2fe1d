use crate::{config::ConfigOverrides, controller::SamplerKind};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Sample host CPU, memory, disk and network usage into CSV files
#[derive(Parser)]
#[command(name = "host_monitor")]
#[command(version)]
#[command(about = "Sample host CPU, memory, disk and network usage into CSV files")]
#[command(after_help = "Examples:\n  \
    host_monitor run --out ./mon --duration 60\n  \
    host_monitor run --pids 1234,5678 --net-backend bpftrace\n  \
    host_monitor run --config monitor.yaml -v")]
#[command(arg_required_else_help = true)]
pub struct Options {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the four samplers until the duration elapses or a signal arrives
    Run(RunArgs),

    /// Run a single sampler (spawned by `run`)
    #[command(hide = true)]
    Sampler(SamplerArgs),
}

/// Arguments for the run command. Each one given here overrides the
/// config file.
#[derive(Args, Default)]
pub struct RunArgs {
    /// Output directory for cpu.csv, mem.csv, disk.csv and net.csv
    #[arg(long, short = 'o', value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Sampling interval in seconds [default: 1.0]
    #[arg(long, short = 'i', value_name = "SECONDS")]
    pub interval: Option<f64>,

    /// Stop after this many seconds; run until interrupted when omitted
    #[arg(long, short = 'd', value_name = "SECONDS")]
    pub duration: Option<f64>,

    /// Comma-separated PIDs to aggregate per-process usage over
    #[arg(long, value_name = "PID,...", value_delimiter = ',')]
    pub pids: Option<Vec<u32>>,

    /// Filesystem path whose usage is reported [default: /]
    #[arg(long, value_name = "PATH")]
    pub disk_path: Option<PathBuf>,

    /// Network backend: direct or bpftrace [default: direct]
    #[arg(long, value_name = "BACKEND")]
    pub net_backend: Option<String>,

    /// Only report interfaces matching this regex
    #[arg(long, value_name = "REGEX")]
    pub nic_include: Option<String>,

    /// Skip interfaces matching this regex; pass "" to report all
    #[arg(long, value_name = "REGEX")]
    pub nic_exclude: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose output (INFO level logging).
    /// Without this flag, only warnings and errors are shown.
    /// Use RUST_LOG env var for debug-level logging.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            out_dir: self.out.clone(),
            interval_s: self.interval,
            duration_s: self.duration,
            pids: self.pids.clone(),
            disk_path: self.disk_path.clone(),
            net_backend: self.net_backend.clone(),
            nic_include: self.nic_include.clone(),
            nic_exclude: self.nic_exclude.clone(),
        }
    }
}

/// Arguments the controller passes to each sampler process
#[derive(Args)]
pub struct SamplerArgs {
    pub kind: SamplerKind,

    /// CSV file to append rows to
    #[arg(long)]
    pub output: PathBuf,

    /// Stop file watched by the bpftrace backend
    #[arg(long)]
    pub sentinel: PathBuf,

    /// Sampler configuration as JSON
    #[arg(long)]
    pub config: String,
}
