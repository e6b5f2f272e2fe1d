//! Cooperative cancellation shared between the controller and sampler processes

use std::{
    fs,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Line the controller writes to a sampler's stdin to request shutdown
pub const STOP_LINE: &[u8] = b"stop\n";

/// Granularity of [`StopSignal::wait_timeout`]
const POLL_SLICE: Duration = Duration::from_millis(50);

/// One-shot stop flag.
///
/// The controller holds the first handle and sets it at most once. Each sampler
/// process holds a linked copy fed by its stdin pipe: a line or end-of-file
/// on that pipe sets it, so a sampler also stops if the controller dies.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns `true` only for the call that set it.
    pub fn set(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for up to `duration`, returning early once the signal is set.
    /// Returns whether the signal is set.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    /// Build a signal that is set once `reader` yields a line or hits
    /// end-of-file. Used on the sampler side with the process's stdin.
    pub fn linked_to<R>(reader: R) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let signal = Self::new();
        let watcher = signal.clone();

        thread::Builder::new()
            .name("stop-watch".to_string())
            .spawn(move || {
                let mut line = String::new();
                let result = BufReader::new(reader).read_line(&mut line);
                debug!("Stop channel fired ({:?})", result.map(|_| line.trim().to_string()));
                watcher.set();
            })?;

        Ok(signal)
    }

    /// Deliver the stop request over a sampler's stdin.
    pub async fn notify<W: AsyncWrite + Unpin>(mut writer: W) -> io::Result<()> {
        writer.write_all(STOP_LINE).await?;
        writer.flush().await
    }
}

/// Filesystem-backed stop indicator for the bpftrace network backend, whose
/// loop is blocked on subprocess output rather than sleeping.
#[derive(Debug, Clone)]
pub struct SentinelFile {
    path: PathBuf,
}

impl SentinelFile {
    /// Default file name inside the output directory
    pub const FILE_NAME: &'static str = ".stop_net_bpftrace";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove a stale sentinel left by a previous run.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub fn raise(&self) -> io::Result<()> {
        fs::write(&self.path, STOP_LINE)
    }

    pub fn is_raised(&self) -> bool {
        self.path.exists()
    }
}
