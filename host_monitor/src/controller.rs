//! Supervisor running the four samplers as child processes

use crate::{
    config::{MonitorConfig, SamplerConfig},
    cpu::CpuSampler,
    disk::DiskSampler,
    error::MonitorError,
    mem::MemSampler,
    net::NetSampler,
    sampler::run_loop,
    stop::{SentinelFile, StopSignal},
};
use eyre::{Result, WrapErr};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    process::{Child, ChildStdin},
    runtime::Runtime,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// The four sampler processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SamplerKind {
    Cpu,
    Mem,
    Disk,
    Net,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 4] = [
        SamplerKind::Cpu,
        SamplerKind::Mem,
        SamplerKind::Disk,
        SamplerKind::Net,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SamplerKind::Cpu => "cpu",
            SamplerKind::Mem => "mem",
            SamplerKind::Disk => "disk",
            SamplerKind::Net => "net",
        }
    }

    /// CSV file name inside the output directory
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.as_str())
    }
}

/// Everything a sampler process needs besides its kind
#[derive(Debug, Clone)]
pub struct SamplerLaunch {
    pub output: PathBuf,
    pub sentinel: PathBuf,
    pub config_json: String,
}

/// Builds the command that runs one sampler. The controller pipes its
/// stdin; everything else is up to the factory.
pub type CommandFactory = Box<dyn Fn(SamplerKind, &SamplerLaunch) -> Command + Send>;

/// Re-run the current executable with the hidden `sampler` subcommand.
pub fn self_exec_command(kind: SamplerKind, launch: &SamplerLaunch) -> Command {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("host_monitor"));
    let mut command = Command::new(exe);
    command
        .arg("sampler")
        .arg(kind.as_str())
        .arg("--output")
        .arg(&launch.output)
        .arg("--sentinel")
        .arg(&launch.sentinel)
        .arg("--config")
        .arg(&launch.config_json);
    command
}

struct SamplerProcess {
    kind: SamplerKind,
    child: Child,
    stdin: Option<ChildStdin>,
    status: Option<ExitStatus>,
}

impl SamplerProcess {
    fn record(&mut self, status: ExitStatus) {
        if status.success() {
            debug!("{} sampler exited", self.kind.as_str());
        } else {
            warn!("{} sampler exited with {}", self.kind.as_str(), status);
        }
        self.status = Some(status);
    }

    /// Write the stop line and close stdin.
    async fn request_stop(&mut self) {
        let Some(mut stdin) = self.stdin.take() else {
            return;
        };
        match StopSignal::notify(&mut stdin).await {
            Ok(()) => {}
            // already exited
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => debug!("Failed to notify {} sampler: {}", self.kind.as_str(), e),
        }
    }

    async fn exited(&mut self) {
        if self.status.is_some() {
            return;
        }
        match self.child.wait().await {
            Ok(status) => self.record(status),
            Err(e) => warn!("Error waiting for {} sampler: {}", self.kind.as_str(), e),
        }
    }

    /// Wait for the sampler to exit until `deadline`, then kill it.
    async fn join(&mut self, deadline: Instant) {
        if self.status.is_some() {
            return;
        }

        tokio::select! {
            result = self.child.wait() => match result {
                Ok(status) => self.record(status),
                Err(e) => warn!("Error waiting for {} sampler: {}", self.kind.as_str(), e),
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    "{} sampler (pid {:?}) did not stop in time, killing it",
                    self.kind.as_str(),
                    self.child.id()
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill {} sampler: {}", self.kind.as_str(), e);
                }
                match self.child.wait().await {
                    Ok(status) => self.status = Some(status),
                    Err(e) => error!("Failed to reap {} sampler: {}", self.kind.as_str(), e),
                }
            }
        }
    }
}

/// Owns the sampler processes, the stop signal and the sentinel file.
pub struct Controller {
    config: MonitorConfig,
    stop: StopSignal,
    sentinel: SentinelFile,
    factory: CommandFactory,
    children: Vec<SamplerProcess>,
    /// Present once started; drives the child processes
    runtime: Option<Runtime>,
}

impl Controller {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_command_factory(config, Box::new(self_exec_command))
    }

    pub fn with_command_factory(config: MonitorConfig, factory: CommandFactory) -> Self {
        let sentinel = SentinelFile::in_dir(&config.out_dir);
        Self {
            config,
            stop: StopSignal::new(),
            sentinel,
            factory,
            children: Vec::new(),
            runtime: None,
        }
    }

    pub fn output_path(&self, kind: SamplerKind) -> PathBuf {
        self.config.out_dir.join(kind.file_name())
    }

    /// Create the output directory, clear a stale sentinel and launch the
    /// four samplers.
    pub fn start(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            eyre::bail!("Controller already started");
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .wrap_err("Failed to build tokio runtime")?;
        self.runtime = Some(runtime);

        let out_dir = self.config.out_dir.clone();
        fs::create_dir_all(&out_dir)
            .wrap_err_with(|| format!("Failed to create output directory {}", out_dir.display()))?;
        self.sentinel
            .clear()
            .wrap_err_with(|| format!("Failed to remove {}", self.sentinel.path().display()))?;

        let config_json = self.config.sampler.to_json()?;
        for kind in SamplerKind::ALL {
            let launch = SamplerLaunch {
                output: self.output_path(kind),
                sentinel: self.sentinel.path().to_path_buf(),
                config_json: config_json.clone(),
            };
            if let Err(e) = self.spawn(kind, &launch) {
                self.stop_all();
                return Err(e);
            }
        }

        info!(
            "Started {} samplers writing to {}",
            self.children.len(),
            out_dir.display()
        );
        Ok(())
    }

    fn spawn(&mut self, kind: SamplerKind, launch: &SamplerLaunch) -> Result<()> {
        let mut command = (self.factory)(kind, launch);

        // Own process group: a terminal Ctrl-C reaches the controller only,
        // which then stops the samplers through their stdin.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut command: tokio::process::Command = command.into();
        command.kill_on_drop(true);
        command.stdin(Stdio::piped());

        let Some(runtime) = &self.runtime else {
            eyre::bail!("Controller is not started");
        };
        let _guard = runtime.enter();
        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn {} sampler", kind.as_str()))?;
        debug!("Spawned {} sampler (pid {:?})", kind.as_str(), child.id());

        let stdin = child.stdin.take();
        self.children.push(SamplerProcess {
            kind,
            child,
            stdin,
            status: None,
        });
        Ok(())
    }

    /// Ask every sampler to stop, wait up to the join timeout, then kill
    /// the stragglers. Safe to call any number of times.
    pub fn stop_all(&mut self) {
        if self.stop.set() {
            info!("Stopping samplers");
        }

        let Some(runtime) = &self.runtime else {
            return;
        };

        if let Err(e) = self.sentinel.raise() {
            warn!(
                "Failed to write sentinel {}: {}",
                self.sentinel.path().display(),
                e
            );
        }

        let timeout = self.config.join_timeout();
        let children = &mut self.children;
        runtime.block_on(async {
            for process in children.iter_mut() {
                process.request_stop().await;
            }

            // one deadline shared by all samplers
            let deadline = Instant::now() + timeout;
            for process in children.iter_mut() {
                process.join(deadline).await;
            }
        });
    }

    /// Start, then block until `duration` elapses, SIGINT/SIGTERM arrives
    /// or every sampler has exited; stop everything on the way out.
    pub fn run(&mut self, duration: Option<Duration>) -> Result<()> {
        let result = self.start().and_then(|()| self.wait_for_shutdown(duration));
        self.stop_all();
        result
    }

    fn wait_for_shutdown(&mut self, duration: Option<Duration>) -> Result<()> {
        let Some(runtime) = &self.runtime else {
            return Ok(());
        };
        let children = &mut self.children;

        runtime.block_on(async {
            #[cfg(unix)]
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .wrap_err("Failed to register SIGTERM handler")?;

            let deadline = async {
                match duration {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending().await,
                }
            };
            let all_exited = async {
                for process in children.iter_mut() {
                    process.exited().await;
                }
            };

            #[cfg(unix)]
            tokio::select! {
                _ = deadline => info!("Run duration elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl-C), shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                _ = all_exited => warn!("All samplers exited on their own"),
            }

            #[cfg(not(unix))]
            tokio::select! {
                _ = deadline => info!("Run duration elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl-C), shutting down..."),
                _ = all_exited => warn!("All samplers exited on their own"),
            }

            Ok::<(), eyre::Report>(())
        })
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            self.stop_all();
        }
    }
}

/// Body of a sampler process: build the sampler and loop until the
/// controller closes or writes to stdin.
pub fn run_sampler(
    kind: SamplerKind,
    output: &Path,
    sentinel: &Path,
    config: &SamplerConfig,
) -> Result<(), MonitorError> {
    config.validate()?;
    let stop = StopSignal::linked_to(io::stdin())?;

    match kind {
        SamplerKind::Cpu => run_loop(CpuSampler::new(config, output)?, &stop),
        SamplerKind::Mem => run_loop(MemSampler::new(config, output)?, &stop),
        SamplerKind::Disk => run_loop(DiskSampler::new(config, output)?, &stop),
        SamplerKind::Net => {
            let sampler = NetSampler::build(config, output, SentinelFile::new(sentinel))?;
            info!("net sampler using the {} backend", sampler.kind());
            sampler.run(&stop)
        }
    }
}
