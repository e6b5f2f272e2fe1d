//! Memory sampler: system memory, swap and tracked-process footprint

use crate::{
    config::SamplerConfig,
    csv_sink::{CsvRecord, CsvSink},
    error::MonitorError,
    procfs::{page_size, read_meminfo, read_smaps_rollup, read_vmstat_swap, MemInfoExtras},
    sampler::Sampler,
    snapshot::{option_delta, percent, Cycle, SnapshotState, Timestamp},
};
use serde::Serialize;
use std::{path::Path, time::Duration};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Cumulative swap traffic in pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapCounters {
    pub pswpin: Option<u64>,
    pub pswpout: Option<u64>,
}

/// Footprint sums over the tracked processes.
///
/// `count` processes had RSS/VMS readings; `ext_count` of them also exposed
/// smaps_rollup, so `uss`/`pss` cover only those.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcMemSums {
    pub rss: u64,
    pub vms: u64,
    pub uss: Option<u64>,
    pub pss: Option<u64>,
    pub count: usize,
    pub ext_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemInstant {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_free: u64,
    pub extras: MemInfoExtras,
    /// `None` when no PIDs are tracked
    pub procs: Option<ProcMemSums>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemRow {
    pub timestamp: String,
    pub ts_mono_s: f64,
    pub seq: u64,
    pub dt_s: Option<f64>,
    pub mem_total_bytes: u64,
    pub mem_available_bytes: u64,
    pub mem_used_bytes: u64,
    pub mem_percent: Option<f64>,
    pub buffers_bytes: Option<u64>,
    pub cached_bytes: Option<u64>,
    pub shared_bytes: Option<u64>,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub swap_free_bytes: u64,
    pub swap_percent: Option<f64>,
    pub swap_sin_bytes_d: Option<u64>,
    pub swap_sout_bytes_d: Option<u64>,
    pub proc_rss_bytes_sum: Option<u64>,
    pub proc_vms_bytes_sum: Option<u64>,
    pub proc_uss_bytes_sum: Option<u64>,
    pub proc_pss_bytes_sum: Option<u64>,
    pub proc_count_sampled: Option<usize>,
    pub proc_ext_count_sampled: Option<usize>,
}

impl CsvRecord for MemRow {
    const HEADER: &'static [&'static str] = &[
        "timestamp",
        "ts_mono_s",
        "seq",
        "dt_s",
        "mem_total_bytes",
        "mem_available_bytes",
        "mem_used_bytes",
        "mem_percent",
        "buffers_bytes",
        "cached_bytes",
        "shared_bytes",
        "swap_total_bytes",
        "swap_used_bytes",
        "swap_free_bytes",
        "swap_percent",
        "swap_sin_bytes_d",
        "swap_sout_bytes_d",
        "proc_rss_bytes_sum",
        "proc_vms_bytes_sum",
        "proc_uss_bytes_sum",
        "proc_pss_bytes_sum",
        "proc_count_sampled",
        "proc_ext_count_sampled",
    ];
}

pub fn derive_row(
    now: Timestamp,
    instant: &MemInstant,
    current: &SwapCounters,
    cycle: &Cycle<SwapCounters>,
    page_size: u64,
) -> MemRow {
    let previous = cycle.previous.as_ref();
    let swap_delta = |cur: Option<u64>, field: fn(&SwapCounters) -> Option<u64>| {
        let prev = previous.and_then(|p| field(&p.reading));
        option_delta(cur, prev).map(|pages| pages * page_size)
    };
    // Sums are only meaningful when at least one process was read
    let procs = instant.procs.filter(|p| p.count > 0);

    MemRow {
        timestamp: now.wall_rfc3339(),
        ts_mono_s: now.mono_secs(),
        seq: cycle.seq,
        dt_s: previous.and_then(|p| p.elapsed_secs()),
        mem_total_bytes: instant.total,
        mem_available_bytes: instant.available,
        mem_used_bytes: instant.used,
        mem_percent: percent(
            instant.total.saturating_sub(instant.available) as f64,
            instant.total as f64,
        ),
        buffers_bytes: instant.extras.buffers,
        cached_bytes: instant.extras.cached,
        shared_bytes: instant.extras.shared,
        swap_total_bytes: instant.swap_total,
        swap_used_bytes: instant.swap_used,
        swap_free_bytes: instant.swap_free,
        swap_percent: percent(instant.swap_used as f64, instant.swap_total as f64),
        swap_sin_bytes_d: swap_delta(current.pswpin, |c| c.pswpin),
        swap_sout_bytes_d: swap_delta(current.pswpout, |c| c.pswpout),
        proc_rss_bytes_sum: procs.map(|p| p.rss),
        proc_vms_bytes_sum: procs.map(|p| p.vms),
        proc_uss_bytes_sum: procs.and_then(|p| p.uss),
        proc_pss_bytes_sum: procs.and_then(|p| p.pss),
        proc_count_sampled: instant.procs.map(|p| p.count),
        proc_ext_count_sampled: instant.procs.map(|p| p.ext_count),
    }
}

fn add(acc: Option<u64>, value: Option<u64>) -> Option<u64> {
    match (acc, value) {
        (acc, None) => acc,
        (acc, Some(v)) => Some(acc.unwrap_or(0) + v),
    }
}

pub struct MemSampler {
    interval: Duration,
    pids: Vec<Pid>,
    system: System,
    page_size: u64,
    snapshot: SnapshotState<SwapCounters>,
    sink: CsvSink<MemRow>,
}

impl MemSampler {
    pub fn new(config: &SamplerConfig, output: &Path) -> Result<Self, MonitorError> {
        Ok(Self {
            interval: config.interval(),
            pids: config
                .tracked_pids()
                .iter()
                .map(|&pid| Pid::from_u32(pid))
                .collect(),
            system: System::new(),
            page_size: page_size(),
            snapshot: SnapshotState::new(),
            sink: CsvSink::open(output)?,
        })
    }

    fn proc_sums(&mut self) -> Option<ProcMemSums> {
        if self.pids.is_empty() {
            return None;
        }

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&self.pids),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let mut sums = ProcMemSums::default();
        for pid in &self.pids {
            let Some(process) = self.system.process(*pid) else {
                debug!("mem: pid {} not found", pid);
                continue;
            };
            sums.rss += process.memory();
            sums.vms += process.virtual_memory();
            sums.count += 1;

            match read_smaps_rollup(pid.as_u32()) {
                Ok(rollup) if rollup.pss.is_some() || rollup.uss.is_some() => {
                    sums.uss = add(sums.uss, rollup.uss);
                    sums.pss = add(sums.pss, rollup.pss);
                    sums.ext_count += 1;
                }
                Ok(_) => debug!("mem: pid {} has an empty smaps_rollup", pid),
                Err(e) => debug!("mem: no extended accounting for pid {}: {:#}", pid, e),
            }
        }
        Some(sums)
    }

    fn read_instant(&mut self) -> MemInstant {
        self.system.refresh_memory();
        let extras = read_meminfo().unwrap_or_else(|e| {
            debug!("mem: {:#}", e);
            MemInfoExtras::default()
        });

        MemInstant {
            total: self.system.total_memory(),
            available: self.system.available_memory(),
            used: self.system.used_memory(),
            swap_total: self.system.total_swap(),
            swap_used: self.system.used_swap(),
            swap_free: self.system.free_swap(),
            extras,
            procs: self.proc_sums(),
        }
    }
}

impl Sampler for MemSampler {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn sample_once(&mut self) -> eyre::Result<()> {
        let now = Timestamp::now();
        let instant = self.read_instant();
        let swap = match read_vmstat_swap() {
            Ok((pswpin, pswpout)) => SwapCounters { pswpin, pswpout },
            Err(e) => {
                debug!("mem: {:#}", e);
                SwapCounters::default()
            }
        };

        let cycle = self.snapshot.replace(now, swap);
        let row = derive_row(now, &instant, &swap, &cycle, self.page_size);
        self.sink.write(&row)?;
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn close(self) -> Result<(), MonitorError> {
        self.sink.close()
    }
}
