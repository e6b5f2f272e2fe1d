//! CPU sampler: utilization, saturation and time breakdown per interval

use crate::{
    cgroup::{read_self_cpu_stat, CgroupCpuStat},
    config::SamplerConfig,
    csv_sink::{CsvRecord, CsvSink},
    error::MonitorError,
    procfs::{
        parse_physical_cores, read_pid_cpu_secs, read_proc_stat, read_text, clock_ticks_per_sec,
        ProcStat, CPU_CATEGORIES,
    },
    sampler::Sampler,
    snapshot::{option_delta, percent, seconds_delta, Cycle, SnapshotState, Timestamp},
};
use serde::Serialize;
use std::{collections::HashMap, path::Path, thread, time::Duration};
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::debug;

/// Cumulative counters compared across cycles
#[derive(Debug, Clone, Default)]
pub struct CpuCounters {
    pub stat: ProcStat,
    pub cgroup: Option<CgroupCpuStat>,
    /// user + system CPU seconds of each tracked PID that could be read
    pub pid_cpu_secs: HashMap<u32, f64>,
}

/// Readings taken over or at the end of the measurement window
#[derive(Debug, Clone, Default)]
pub struct CpuInstant {
    pub logical: usize,
    pub physical: Option<usize>,
    pub total_percent: Option<f64>,
    pub core_percents: Vec<f64>,
    pub freqs_mhz: Vec<u64>,
    pub load: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuRow {
    pub timestamp: String,
    pub ts_mono_s: f64,
    pub seq: u64,
    pub dt_s: Option<f64>,
    pub cpu_logical: usize,
    pub cpu_physical: Option<usize>,
    pub cpu_freq_cur_mhz_mean: Option<f64>,
    pub cpu_freq_cur_mhz_max: Option<f64>,
    pub cpu_total_percent: Option<f64>,
    pub cpu_mean_core_percent: Option<f64>,
    pub cpu_max_core_percent: Option<f64>,
    pub cpu_core_count_sampled: usize,
    pub loadavg_1: Option<f64>,
    pub loadavg_5: Option<f64>,
    pub loadavg_15: Option<f64>,
    pub procs_running: Option<u64>,
    pub procs_blocked: Option<u64>,
    pub ctx_switches_d: Option<u64>,
    pub interrupts_d: Option<u64>,
    pub soft_interrupts_d: Option<u64>,
    /// Linux exposes no system-wide syscall counter
    pub syscalls_d: Option<u64>,
    pub cg_nr_periods: Option<u64>,
    pub cg_nr_throttled: Option<u64>,
    pub cg_throttled_usec: Option<u64>,
    pub cg_nr_throttled_d: Option<u64>,
    pub cg_throttled_usec_d: Option<u64>,
    pub sec_user_d: Option<f64>,
    pub sec_nice_d: Option<f64>,
    pub sec_system_d: Option<f64>,
    pub sec_idle_d: Option<f64>,
    pub sec_iowait_d: Option<f64>,
    pub sec_irq_d: Option<f64>,
    pub sec_softirq_d: Option<f64>,
    pub sec_steal_d: Option<f64>,
    pub sec_guest_d: Option<f64>,
    pub sec_guest_nice_d: Option<f64>,
    pub sec_total_d: Option<f64>,
    pub pct_user: Option<f64>,
    pub pct_nice: Option<f64>,
    pub pct_system: Option<f64>,
    pub pct_idle: Option<f64>,
    pub pct_iowait: Option<f64>,
    pub pct_irq: Option<f64>,
    pub pct_softirq: Option<f64>,
    pub pct_steal: Option<f64>,
    pub pct_guest: Option<f64>,
    pub pct_guest_nice: Option<f64>,
    pub proc_cpu_sec_d_sum: Option<f64>,
    pub proc_cpu_pct_total_sum: Option<f64>,
}

impl CsvRecord for CpuRow {
    const HEADER: &'static [&'static str] = &[
        "timestamp",
        "ts_mono_s",
        "seq",
        "dt_s",
        "cpu_logical",
        "cpu_physical",
        "cpu_freq_cur_mhz_mean",
        "cpu_freq_cur_mhz_max",
        "cpu_total_percent",
        "cpu_mean_core_percent",
        "cpu_max_core_percent",
        "cpu_core_count_sampled",
        "loadavg_1",
        "loadavg_5",
        "loadavg_15",
        "procs_running",
        "procs_blocked",
        "ctx_switches_d",
        "interrupts_d",
        "soft_interrupts_d",
        "syscalls_d",
        "cg_nr_periods",
        "cg_nr_throttled",
        "cg_throttled_usec",
        "cg_nr_throttled_d",
        "cg_throttled_usec_d",
        "sec_user_d",
        "sec_nice_d",
        "sec_system_d",
        "sec_idle_d",
        "sec_iowait_d",
        "sec_irq_d",
        "sec_softirq_d",
        "sec_steal_d",
        "sec_guest_d",
        "sec_guest_nice_d",
        "sec_total_d",
        "pct_user",
        "pct_nice",
        "pct_system",
        "pct_idle",
        "pct_iowait",
        "pct_irq",
        "pct_softirq",
        "pct_steal",
        "pct_guest",
        "pct_guest_nice",
        "proc_cpu_sec_d_sum",
        "proc_cpu_pct_total_sum",
    ];
}

/// Build the row for one cycle from the window readings and the counters
/// of this cycle and the previous one.
pub fn derive_row(
    now: Timestamp,
    instant: &CpuInstant,
    current: &CpuCounters,
    cycle: &Cycle<CpuCounters>,
    pids: &[u32],
    ticks_per_sec: u64,
) -> CpuRow {
    let cores = &instant.core_percents;
    let freqs: Vec<f64> = instant
        .freqs_mhz
        .iter()
        .filter(|&&mhz| mhz > 0)
        .map(|&mhz| mhz as f64)
        .collect();

    let mut row = CpuRow {
        timestamp: now.wall_rfc3339(),
        ts_mono_s: now.mono_secs(),
        seq: cycle.seq,
        cpu_logical: instant.logical,
        cpu_physical: instant.physical,
        cpu_freq_cur_mhz_mean: mean(&freqs),
        cpu_freq_cur_mhz_max: freqs.iter().copied().reduce(f64::max),
        cpu_total_percent: instant.total_percent,
        cpu_mean_core_percent: mean(cores),
        cpu_max_core_percent: cores.iter().copied().reduce(f64::max),
        cpu_core_count_sampled: cores.len(),
        loadavg_1: instant.load.map(|l| l[0]),
        loadavg_5: instant.load.map(|l| l[1]),
        loadavg_15: instant.load.map(|l| l[2]),
        procs_running: current.stat.procs_running,
        procs_blocked: current.stat.procs_blocked,
        syscalls_d: None,
        cg_nr_periods: current.cgroup.and_then(|cg| cg.nr_periods),
        cg_nr_throttled: current.cgroup.and_then(|cg| cg.nr_throttled),
        cg_throttled_usec: current.cgroup.and_then(|cg| cg.throttled_usec),
        ..CpuRow::default()
    };

    let Some(previous) = &cycle.previous else {
        return row;
    };
    let prev = &previous.reading;
    let dt = previous.elapsed_secs();
    row.dt_s = dt;

    row.ctx_switches_d = option_delta(current.stat.ctx_switches, prev.stat.ctx_switches);
    row.interrupts_d = option_delta(current.stat.interrupts, prev.stat.interrupts);
    row.soft_interrupts_d = option_delta(current.stat.soft_interrupts, prev.stat.soft_interrupts);

    let cg_delta = |field: fn(&CgroupCpuStat) -> Option<u64>| {
        option_delta(current.cgroup.and_then(|c| field(&c)), prev.cgroup.and_then(|c| field(&c)))
    };
    row.cg_nr_throttled_d = cg_delta(|c| c.nr_throttled);
    row.cg_throttled_usec_d = cg_delta(|c| c.throttled_usec);

    // Category seconds; a category whose counter went backwards stays null
    // and is left out of the total.
    let mut secs = [None; CPU_CATEGORIES.len()];
    if let (Some(cur), Some(old)) = (current.stat.cpu, prev.stat.cpu) {
        for (i, slot) in secs.iter_mut().enumerate() {
            *slot = option_delta(cur.0[i], old.0[i]).map(|t| t as f64 / ticks_per_sec as f64);
        }
    }
    let total: f64 = secs.iter().flatten().sum();
    let sec_total = (total > 0.0).then_some(total);
    let pcts = secs.map(|s| s.zip(sec_total).and_then(|(s, t)| percent(s, t)));

    [
        row.sec_user_d,
        row.sec_nice_d,
        row.sec_system_d,
        row.sec_idle_d,
        row.sec_iowait_d,
        row.sec_irq_d,
        row.sec_softirq_d,
        row.sec_steal_d,
        row.sec_guest_d,
        row.sec_guest_nice_d,
    ] = secs;
    [
        row.pct_user,
        row.pct_nice,
        row.pct_system,
        row.pct_idle,
        row.pct_iowait,
        row.pct_irq,
        row.pct_softirq,
        row.pct_steal,
        row.pct_guest,
        row.pct_guest_nice,
    ] = pcts;
    row.sec_total_d = sec_total;

    if !pids.is_empty() {
        let sum: f64 = pids
            .iter()
            .filter_map(|pid| {
                let cur = current.pid_cpu_secs.get(pid)?;
                let old = prev.pid_cpu_secs.get(pid)?;
                seconds_delta(*cur, *old)
            })
            .sum();
        row.proc_cpu_sec_d_sum = Some(sum);
        row.proc_cpu_pct_total_sum = dt
            .filter(|_| instant.logical > 0)
            .and_then(|dt| percent(sum, dt * instant.logical as f64));
    }

    row
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

pub struct CpuSampler {
    interval: Duration,
    pids: Vec<u32>,
    system: System,
    ticks_per_sec: u64,
    physical: Option<usize>,
    snapshot: SnapshotState<CpuCounters>,
    sink: CsvSink<CpuRow>,
}

impl CpuSampler {
    pub fn new(config: &SamplerConfig, output: &Path) -> Result<Self, MonitorError> {
        let mut system = System::new();
        system.refresh_cpu_usage();

        let physical = match read_text("/proc/cpuinfo") {
            Ok(cpuinfo) => parse_physical_cores(&cpuinfo),
            Err(e) => {
                debug!("cpu: physical core count unavailable: {:#}", e);
                None
            }
        };

        Ok(Self {
            interval: config.interval(),
            pids: config.tracked_pids().to_vec(),
            system,
            ticks_per_sec: clock_ticks_per_sec(),
            physical,
            snapshot: SnapshotState::new(),
            sink: CsvSink::open(output)?,
        })
    }

    /// Block for the interval and read utilization over it.
    fn measure_window(&mut self) -> CpuInstant {
        self.system.refresh_cpu_usage();
        thread::sleep(self.interval.max(MINIMUM_CPU_UPDATE_INTERVAL));
        self.system.refresh_cpu_usage();
        self.system.refresh_cpu_frequency();

        let cpus = self.system.cpus();
        let load = System::load_average();
        CpuInstant {
            logical: cpus.len(),
            physical: self.physical,
            total_percent: (!cpus.is_empty()).then(|| self.system.global_cpu_usage() as f64),
            core_percents: cpus.iter().map(|cpu| cpu.cpu_usage() as f64).collect(),
            freqs_mhz: cpus.iter().map(|cpu| cpu.frequency()).collect(),
            load: Some([load.one, load.five, load.fifteen]),
        }
    }

    fn read_counters(&self) -> CpuCounters {
        let stat = read_proc_stat().unwrap_or_else(|e| {
            debug!("cpu: {:#}", e);
            ProcStat::default()
        });
        let cgroup = read_self_cpu_stat().unwrap_or_else(|e| {
            debug!("cpu: cgroup counters unavailable: {:#}", e);
            None
        });
        let pid_cpu_secs = self
            .pids
            .iter()
            .filter_map(|&pid| match read_pid_cpu_secs(pid, self.ticks_per_sec) {
                Ok(secs) => Some((pid, secs)),
                Err(e) => {
                    debug!("cpu: skipping pid {}: {:#}", pid, e);
                    None
                }
            })
            .collect();

        CpuCounters {
            stat,
            cgroup,
            pid_cpu_secs,
        }
    }
}

impl Sampler for CpuSampler {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn sample_once(&mut self) -> eyre::Result<()> {
        let instant = self.measure_window();
        let now = Timestamp::now();
        let counters = self.read_counters();

        let cycle = self.snapshot.replace(now, counters.clone());
        let row = derive_row(now, &instant, &counters, &cycle, &self.pids, self.ticks_per_sec);
        self.sink.write(&row)?;
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn paces_itself(&self) -> bool {
        true
    }

    fn close(self) -> Result<(), MonitorError> {
        self.sink.close()
    }
}
