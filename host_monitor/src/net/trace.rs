//! Network backend streaming per-interval byte sums from a bpftrace
//! subprocess.
//!
//! The script prints a `=== <nsecs> ===` marker every interval followed by
//! the `@tx` and `@rx` maps, then clears both maps. Everything between two
//! markers is one block; byte counts are local to their block.

use super::{mbps, InterfaceFilter, NetBackendKind};
use crate::{
    config::SamplerConfig,
    csv_sink::{CsvRecord, CsvSink},
    error::MonitorError,
    snapshot::Timestamp,
    stop::{SentinelFile, StopSignal},
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    io,
    path::Path,
    process::Stdio,
    sync::LazyLock,
    time::Duration,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::{Child, Command},
    runtime::Runtime,
};
use tracing::{debug, info, warn};

pub const BPFTRACE_BIN: &str = "bpftrace";

/// How long bpftrace gets to exit after SIGTERM before it is killed
const TERM_GRACE: Duration = Duration::from_secs(2);

/// bpftrace program summing transmitted and received bytes per device,
/// printed and reset every `interval_secs`.
pub fn bpftrace_script(interval_secs: u64) -> String {
    format!(
        r#"tracepoint:net:net_dev_queue
{{
  @tx[str(args->name)] = sum(args->len);
}}

tracepoint:net:netif_receive_skb
{{
  @rx[str(args->name)] = sum(args->len);
}}

interval:s:{interval_secs}
{{
  printf("=== %lld ===\n", nsecs);
  print(@tx);
  print(@rx);
  clear(@tx);
  clear(@rx);
}}
"#
    )
}

/// bpftrace intervals are whole seconds, at least one
pub fn window_secs(interval_s: f64) -> u64 {
    interval_s.round().max(1.0) as u64
}

/// Parser state over the bpftrace output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    /// No block marker seen yet
    Starting,
    /// Collecting map lines of the current block
    Accumulating,
    /// A completed block is waiting to be taken
    EmitPending,
    /// Stream ended or stop requested; input is ignored
    Stopped,
}

/// Transmitted and received bytes per interface within one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceBlock {
    pub tx: BTreeMap<String, u64>,
    pub rx: BTreeMap<String, u64>,
}

impl TraceBlock {
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty() && self.rx.is_empty()
    }

    /// Union of interfaces seen in either map, in name order
    pub fn interfaces(&self) -> BTreeSet<&str> {
        self.tx.keys().chain(self.rx.keys()).map(String::as_str).collect()
    }
}

// @tx[eth0]: 123 or @tx["eth0"]: 123
static MAP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*@(?P<map>\w+)\[\s*"?(?P<nic>[^"\]]+?)"?\s*\]\s*:\s*(?P<val>\d+)\s*$"#)
        .expect("map line pattern is valid")
});

fn is_marker(line: &str) -> bool {
    line.trim_start().starts_with("===")
}

/// Four-state parser turning bpftrace output lines into blocks.
#[derive(Debug)]
pub struct TraceParser {
    state: TraceState,
    filter: InterfaceFilter,
    current: TraceBlock,
    ready: VecDeque<TraceBlock>,
}

impl TraceParser {
    pub fn new(filter: InterfaceFilter) -> Self {
        Self {
            state: TraceState::Starting,
            filter,
            current: TraceBlock::default(),
            ready: VecDeque::new(),
        }
    }

    /// Consume one output line and return the resulting state.
    pub fn feed(&mut self, line: &str) -> TraceState {
        if self.state == TraceState::Stopped {
            return self.state;
        }

        if is_marker(line) {
            if !self.current.is_empty() {
                self.ready.push_back(std::mem::take(&mut self.current));
            }
        } else if let Some(caps) = MAP_LINE.captures(line) {
            let nic = &caps["nic"];
            if self.filter.keeps(nic) {
                if let Ok(value) = caps["val"].parse::<u64>() {
                    let map = match &caps["map"] {
                        "tx" => Some(&mut self.current.tx),
                        "rx" => Some(&mut self.current.rx),
                        _ => None,
                    };
                    if let Some(map) = map {
                        map.insert(nic.to_string(), value);
                    }
                }
            }
        } else if self.state == TraceState::Starting {
            // banner or blank lines before the first block
            return self.state;
        }

        self.state = if self.ready.is_empty() {
            TraceState::Accumulating
        } else {
            TraceState::EmitPending
        };
        self.state
    }

    /// Take the oldest completed block, if any.
    pub fn take_pending(&mut self) -> Option<TraceBlock> {
        let block = self.ready.pop_front();
        if self.state == TraceState::EmitPending && self.ready.is_empty() {
            self.state = TraceState::Accumulating;
        }
        block
    }

    /// Enter `Stopped` and return every block not yet taken, including the
    /// partially accumulated one.
    pub fn finish(&mut self) -> Vec<TraceBlock> {
        if !self.current.is_empty() {
            self.ready.push_back(std::mem::take(&mut self.current));
        }
        self.state = TraceState::Stopped;
        self.ready.drain(..).collect()
    }
}

/// One interface within one bpftrace block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNetRow {
    pub timestamp: String,
    pub ts_mono_s: f64,
    pub seq: u64,
    pub dt_s: Option<f64>,
    pub backend: &'static str,
    pub nic: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_mbps: Option<f64>,
    pub tx_mbps: Option<f64>,
}

impl CsvRecord for TraceNetRow {
    const HEADER: &'static [&'static str] = &[
        "timestamp",
        "ts_mono_s",
        "seq",
        "dt_s",
        "backend",
        "nic",
        "rx_bytes",
        "tx_bytes",
        "rx_mbps",
        "tx_mbps",
    ];
}

/// Rows for one block; an interface missing from one map moved no bytes
/// in that direction.
pub fn block_rows(
    now: Timestamp,
    seq: u64,
    window_s: f64,
    block: &TraceBlock,
) -> Vec<TraceNetRow> {
    block
        .interfaces()
        .into_iter()
        .map(|nic| {
            let rx_bytes = block.rx.get(nic).copied().unwrap_or(0);
            let tx_bytes = block.tx.get(nic).copied().unwrap_or(0);
            TraceNetRow {
                timestamp: now.wall_rfc3339(),
                ts_mono_s: now.mono_secs(),
                seq,
                dt_s: Some(window_s),
                backend: NetBackendKind::Bpftrace.as_str(),
                nic: nic.to_string(),
                rx_bytes,
                tx_bytes,
                rx_mbps: mbps(rx_bytes, window_s),
                tx_mbps: mbps(tx_bytes, window_s),
            }
        })
        .collect()
}

/// Drives the parser over a line source and writes each completed block.
pub struct TraceEmitter {
    parser: TraceParser,
    sink: CsvSink<TraceNetRow>,
    sentinel: SentinelFile,
    window_s: f64,
    blocks: u64,
}

impl TraceEmitter {
    pub fn new(
        filter: InterfaceFilter,
        sink: CsvSink<TraceNetRow>,
        sentinel: SentinelFile,
        window_s: f64,
    ) -> Self {
        Self {
            parser: TraceParser::new(filter),
            sink,
            sentinel,
            window_s,
            blocks: 0,
        }
    }

    fn emit(&mut self, block: &TraceBlock) {
        let rows = block_rows(Timestamp::now(), self.blocks, self.window_s, block);
        self.blocks += 1;
        for row in &rows {
            if let Err(e) = self.sink.write(row) {
                warn!("net: failed to write row for {}: {}", row.nic, e);
            }
        }
    }

    /// Read lines until the sentinel is raised, `stop` is set or the stream
    /// ends; then flush what is pending, including a partial block.
    pub async fn pump<R: AsyncBufRead + Unpin>(&mut self, reader: R, stop: &StopSignal) {
        let mut lines = reader.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("net: failed to read bpftrace output: {}", e);
                    break;
                }
            };
            if self.sentinel.is_raised() || stop.is_set() {
                debug!("net: stop observed, leaving bpftrace stream");
                break;
            }

            if self.parser.feed(&line) == TraceState::EmitPending {
                while let Some(block) = self.parser.take_pending() {
                    self.emit(&block);
                }
            }
        }

        for block in self.parser.finish() {
            self.emit(&block);
        }
    }

    pub fn close(self) -> Result<(), MonitorError> {
        debug!("net: {} bpftrace blocks written", self.blocks);
        self.sink.close()
    }
}

/// Owns the bpftrace child; killed if dropped while still running.
struct TraceProcess {
    child: Child,
}

impl TraceProcess {
    /// Must be called inside a tokio runtime context.
    fn spawn(bin: &Path, script: &str) -> io::Result<Self> {
        let mut child = Command::new(bin)
            .args(["-q", "-e", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("bpftrace: {}", line);
                }
            });
        }

        Ok(Self { child })
    }

    /// SIGTERM, bounded wait, then SIGKILL.
    async fn terminate(&mut self) {
        match self.child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                debug!("bpftrace already exited: {}", status);
                return;
            }
            Err(e) => {
                warn!("Failed to poll bpftrace: {}", e);
                return;
            }
        }

        if let Some(pid) = self.child.id() {
            let pid = Pid::from_raw(pid as i32);
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                debug!("Failed to send SIGTERM to bpftrace ({}): {}", pid, e);
            }
        }

        tokio::select! {
            result = self.child.wait() => match result {
                Ok(status) => debug!("bpftrace exited: {}", status),
                Err(e) => warn!("Error waiting for bpftrace: {}", e),
            },
            _ = tokio::time::sleep(TERM_GRACE) => {
                warn!("bpftrace did not exit after SIGTERM, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill bpftrace: {}", e);
                }
            }
        }
    }
}

/// bpftrace-backed network sampler
pub struct ExternalTraceBackend {
    runtime: Runtime,
    process: TraceProcess,
    emitter: TraceEmitter,
}

impl ExternalTraceBackend {
    pub fn new(
        config: &SamplerConfig,
        output: &Path,
        sentinel: SentinelFile,
    ) -> Result<Self, MonitorError> {
        let bin = which::which(BPFTRACE_BIN)
            .map_err(|_| MonitorError::ExternalToolMissing(BPFTRACE_BIN.to_string()))?;
        let filter = InterfaceFilter::from_config(config)?;
        let window = window_secs(config.interval_s);
        let sink = CsvSink::open(output)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let process = {
            let _guard = runtime.enter();
            TraceProcess::spawn(&bin, &bpftrace_script(window))?
        };
        info!(
            "Started {} (pid {:?}, window {}s)",
            bin.display(),
            process.child.id(),
            window
        );

        Ok(Self {
            runtime,
            process,
            emitter: TraceEmitter::new(filter, sink, sentinel, window as f64),
        })
    }

    pub fn run(self, stop: &StopSignal) -> Result<(), MonitorError> {
        let Self {
            runtime,
            mut process,
            mut emitter,
        } = self;
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("bpftrace stdout is not piped"))?;

        runtime.block_on(async {
            emitter.pump(BufReader::new(stdout), stop).await;
            process.terminate().await;
        });
        emitter.close()
    }
}
