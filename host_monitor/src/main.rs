mod cgroup;
mod config;
mod controller;
mod cpu;
mod csv_sink;
mod disk;
mod error;
mod mem;
mod net;
mod options;
mod procfs;
mod sampler;
mod snapshot;
mod stop;

use crate::{
    config::{load_monitor_config, SamplerConfig},
    controller::{run_sampler, Controller},
    options::{Command, Options, RunArgs, SamplerArgs},
};
use clap::Parser;
use eyre::WrapErr;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> eyre::Result<()> {
    let opts = Options::parse();

    match opts.command {
        Command::Run(args) => run(args),
        Command::Sampler(args) => sampler(args),
    }
}

/// Log to stderr. RUST_LOG wins; otherwise `default_level` applies.
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run the controller with all four samplers.
fn run(args: RunArgs) -> eyre::Result<()> {
    let level = if args.verbose { "info" } else { "warn" };
    if std::env::var_os("RUST_LOG").is_none() {
        // Sampler processes inherit the level through the environment
        std::env::set_var("RUST_LOG", level);
    }
    init_logging(level);

    let config = load_monitor_config(args.config.as_deref(), args.overrides())?;
    info!(
        "Sampling every {}s into {} (net backend: {})",
        config.sampler.interval_s,
        config.out_dir.display(),
        config.sampler.net_backend
    );

    let duration = config.duration();
    let mut controller = Controller::new(config);
    controller.run(duration)?;

    info!("All samplers stopped");
    Ok(())
}

/// Body of one sampler process spawned by `run`.
fn sampler(args: SamplerArgs) -> eyre::Result<()> {
    init_logging("warn");

    let config = SamplerConfig::from_json(&args.config)?;
    run_sampler(args.kind, &args.output, &args.sentinel, &config)
        .wrap_err_with(|| format!("{} sampler failed", args.kind.as_str()))
}
