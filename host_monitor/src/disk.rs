//! Disk sampler: filesystem usage, whole-disk throughput and tracked-process I/O

use crate::{
    config::SamplerConfig,
    csv_sink::{CsvRecord, CsvSink},
    error::MonitorError,
    procfs::{parse_diskstats, read_pid_io, read_text, DiskCounters, PidIo},
    sampler::Sampler,
    snapshot::{counter_delta, per_second, percent, Cycle, SnapshotState, Timestamp},
};
use nix::sys::statvfs::statvfs;
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

const SYS_BLOCK: &str = "/sys/block";

/// Capacity of the filesystem holding the configured path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl FsUsage {
    /// Used share of the space available to unprivileged users, the way
    /// `df` reports it
    pub fn percent(&self) -> Option<f64> {
        percent(self.used as f64, (self.used + self.free) as f64)
    }
}

pub fn fs_usage(path: &Path) -> Result<FsUsage, MonitorError> {
    let stat = statvfs(path).map_err(|source| MonitorError::InvalidPath {
        path: path.to_path_buf(),
        source,
    })?;
    let fragment = stat.fragment_size() as u64;
    let blocks = stat.blocks() as u64;
    let blocks_free = stat.blocks_free() as u64;
    let blocks_available = stat.blocks_available() as u64;

    Ok(FsUsage {
        total: blocks * fragment,
        used: blocks.saturating_sub(blocks_free) * fragment,
        free: blocks_available * fragment,
    })
}

/// Whole disks only: partitions have no /sys/block entry, and loop and ram
/// devices are not real storage.
pub fn is_whole_disk(name: &str, sys_block: &Path) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") {
        return false;
    }
    sys_block.join(name.replace('/', "!")).exists()
}

/// Cumulative counters compared across cycles
#[derive(Debug, Clone, Default)]
pub struct DiskReading {
    pub disk: Option<DiskCounters>,
    pub pid_io: HashMap<u32, PidIo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskRow {
    pub timestamp: String,
    pub ts_mono_s: f64,
    pub seq: u64,
    pub dt_s: Option<f64>,
    pub fs_path: String,
    pub fs_total_bytes: Option<u64>,
    pub fs_used_bytes: Option<u64>,
    pub fs_free_bytes: Option<u64>,
    pub fs_percent: Option<f64>,
    pub disk_read_bytes_d: Option<u64>,
    pub disk_write_bytes_d: Option<u64>,
    pub disk_read_count_d: Option<u64>,
    pub disk_write_count_d: Option<u64>,
    pub disk_read_mbps: Option<f64>,
    pub disk_write_mbps: Option<f64>,
    pub disk_read_iops: Option<f64>,
    pub disk_write_iops: Option<f64>,
    pub disk_busy_time_ms_d: Option<u64>,
    pub proc_read_bytes_d_sum: Option<u64>,
    pub proc_write_bytes_d_sum: Option<u64>,
}

impl CsvRecord for DiskRow {
    const HEADER: &'static [&'static str] = &[
        "timestamp",
        "ts_mono_s",
        "seq",
        "dt_s",
        "fs_path",
        "fs_total_bytes",
        "fs_used_bytes",
        "fs_free_bytes",
        "fs_percent",
        "disk_read_bytes_d",
        "disk_write_bytes_d",
        "disk_read_count_d",
        "disk_write_count_d",
        "disk_read_mbps",
        "disk_write_mbps",
        "disk_read_iops",
        "disk_write_iops",
        "disk_busy_time_ms_d",
        "proc_read_bytes_d_sum",
        "proc_write_bytes_d_sum",
    ];
}

pub fn derive_row(
    now: Timestamp,
    fs_path: &Path,
    usage: Option<FsUsage>,
    current: &DiskReading,
    cycle: &Cycle<DiskReading>,
    pids: &[u32],
) -> DiskRow {
    let mut row = DiskRow {
        timestamp: now.wall_rfc3339(),
        ts_mono_s: now.mono_secs(),
        seq: cycle.seq,
        fs_path: fs_path.display().to_string(),
        fs_total_bytes: usage.map(|u| u.total),
        fs_used_bytes: usage.map(|u| u.used),
        fs_free_bytes: usage.map(|u| u.free),
        fs_percent: usage.and_then(|u| u.percent()),
        ..DiskRow::default()
    };

    let Some(previous) = &cycle.previous else {
        return row;
    };
    let dt = previous.elapsed_secs();
    row.dt_s = dt;

    if let (Some(cur), Some(old)) = (current.disk, previous.reading.disk) {
        row.disk_read_bytes_d = counter_delta(cur.read_bytes, old.read_bytes);
        row.disk_write_bytes_d = counter_delta(cur.write_bytes, old.write_bytes);
        row.disk_read_count_d = counter_delta(cur.read_count, old.read_count);
        row.disk_write_count_d = counter_delta(cur.write_count, old.write_count);
        row.disk_busy_time_ms_d = counter_delta(cur.busy_time_ms, old.busy_time_ms);
        row.disk_read_mbps = per_second(row.disk_read_bytes_d, dt).map(|b| b / 1e6);
        row.disk_write_mbps = per_second(row.disk_write_bytes_d, dt).map(|b| b / 1e6);
        row.disk_read_iops = per_second(row.disk_read_count_d, dt);
        row.disk_write_iops = per_second(row.disk_write_count_d, dt);
    }

    let mut read_sum = None;
    let mut write_sum = None;
    for pid in pids {
        let (Some(cur), Some(old)) = (current.pid_io.get(pid), previous.reading.pid_io.get(pid))
        else {
            continue;
        };
        // A negative delta means the PID was reused; skip the process entirely
        let (Some(read), Some(write)) = (
            counter_delta(cur.read_bytes, old.read_bytes),
            counter_delta(cur.write_bytes, old.write_bytes),
        ) else {
            continue;
        };
        read_sum = Some(read_sum.unwrap_or(0) + read);
        write_sum = Some(write_sum.unwrap_or(0) + write);
    }
    row.proc_read_bytes_d_sum = read_sum;
    row.proc_write_bytes_d_sum = write_sum;

    row
}

pub struct DiskSampler {
    interval: Duration,
    fs_path: PathBuf,
    sys_block: PathBuf,
    pids: Vec<u32>,
    snapshot: SnapshotState<DiskReading>,
    sink: CsvSink<DiskRow>,
}

impl DiskSampler {
    /// Fails with [`MonitorError::InvalidPath`] when the usage path cannot
    /// be queried.
    pub fn new(config: &SamplerConfig, output: &Path) -> Result<Self, MonitorError> {
        fs_usage(&config.disk_path)?;

        Ok(Self {
            interval: config.interval(),
            fs_path: config.disk_path.clone(),
            sys_block: PathBuf::from(SYS_BLOCK),
            pids: config.tracked_pids().to_vec(),
            snapshot: SnapshotState::new(),
            sink: CsvSink::open(output)?,
        })
    }

    fn read_counters(&self) -> DiskReading {
        let disk = match read_text("/proc/diskstats") {
            Ok(content) => Some(parse_diskstats(&content, |name| {
                is_whole_disk(name, &self.sys_block)
            })),
            Err(e) => {
                debug!("disk: {:#}", e);
                None
            }
        };

        let pid_io = self
            .pids
            .iter()
            .filter_map(|&pid| match read_pid_io(pid) {
                Ok(io) => Some((pid, io)),
                Err(e) => {
                    debug!("disk: skipping pid {}: {:#}", pid, e);
                    None
                }
            })
            .collect();

        DiskReading { disk, pid_io }
    }
}

impl Sampler for DiskSampler {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn sample_once(&mut self) -> eyre::Result<()> {
        let now = Timestamp::now();
        let usage = match fs_usage(&self.fs_path) {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!("disk: {}", e);
                None
            }
        };
        let reading = self.read_counters();

        let cycle = self.snapshot.replace(now, reading.clone());
        let row = derive_row(now, &self.fs_path, usage, &reading, &cycle, &self.pids);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        csv_sink::serde_header,
        snapshot::{timestamp_at, Previous},
    };
    use std::fs;
    use tempfile::tempdir;

    fn reading(read_bytes: u64, read_count: u64, pids: &[(u32, u64, u64)]) -> DiskReading {
        DiskReading {
            disk: Some(DiskCounters {
                read_count,
                write_count: read_count / 2,
                read_bytes,
                write_bytes: read_bytes / 2,
                busy_time_ms: read_count * 10,
            }),
            pid_io: pids
                .iter()
                .map(|&(pid, r, w)| {
                    (
                        pid,
                        PidIo {
                            read_bytes: r,
                            write_bytes: w,
                        },
                    )
                })
                .collect(),
        }
    }

    fn after_one_second(previous: DiskReading) -> Cycle<DiskReading> {
        Cycle {
            seq: 1,
            previous: Some(Previous {
                reading: previous,
                elapsed: Duration::from_secs(1),
            }),
        }
    }

    #[test]
    fn test_header_matches_fields() {
        assert_eq!(serde_header(&DiskRow::default()), DiskRow::HEADER);
    }

    #[test]
    fn test_fs_usage_and_invalid_path() {
        let tmp = tempdir().unwrap();
        let usage = fs_usage(tmp.path()).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);

        let missing = tmp.path().join("missing");
        assert!(matches!(
            fs_usage(&missing),
            Err(MonitorError::InvalidPath { path, .. }) if path == missing
        ));
    }

    #[test]
    fn test_fs_percent() {
        let usage = FsUsage {
            total: 100,
            used: 30,
            free: 60,
        };
        let percent = usage.percent().unwrap();
        assert!((percent - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_whole_disk_detection() {
        let tmp = tempdir().unwrap();
        for dev in ["sda", "loop0", "ram0", "cciss!c0d0"] {
            fs::create_dir(tmp.path().join(dev)).unwrap();
        }
        assert!(is_whole_disk("sda", tmp.path()));
        assert!(is_whole_disk("cciss/c0d0", tmp.path()));
        assert!(!is_whole_disk("sda1", tmp.path()));
        assert!(!is_whole_disk("loop0", tmp.path()));
        assert!(!is_whole_disk("ram0", tmp.path()));
    }

    #[test]
    fn test_first_row_has_no_deltas() {
        let current = reading(1000, 10, &[(1, 5, 5)]);
        let cycle = Cycle {
            seq: 0,
            previous: None,
        };
        let row = derive_row(timestamp_at(1.0), Path::new("/"), None, &current, &cycle, &[1]);
        assert_eq!(row.fs_path, "/");
        assert_eq!(row.fs_total_bytes, None);
        assert_eq!(row.disk_read_bytes_d, None);
        assert_eq!(row.disk_read_iops, None);
        assert_eq!(row.proc_read_bytes_d_sum, None);
    }

    #[test]
    fn test_one_megabyte_over_one_second() {
        let previous = reading(4_000_000, 100, &[]);
        let current = reading(5_000_000, 150, &[]);
        let row = derive_row(
            timestamp_at(2.0),
            Path::new("/"),
            None,
            &current,
            &after_one_second(previous),
            &[],
        );
        assert_eq!(row.disk_read_bytes_d, Some(1_000_000));
        assert_eq!(row.disk_read_mbps, Some(1.0));
        assert_eq!(row.disk_write_bytes_d, Some(500_000));
        assert_eq!(row.disk_read_iops, Some(50.0));
        assert_eq!(row.disk_write_iops, Some(25.0));
        assert_eq!(row.disk_busy_time_ms_d, Some(500));
        assert_eq!(row.proc_read_bytes_d_sum, None);
    }

    #[test]
    fn test_process_io_sums_skip_new_and_reused_pids() {
        let previous = reading(0, 0, &[(1, 100, 100), (2, 500, 500)]);
        // pid 2 went backwards (reused), pid 3 is new
        let current = reading(0, 0, &[(1, 150, 400), (2, 10, 10), (3, 99, 99)]);
        let row = derive_row(
            timestamp_at(2.0),
            Path::new("/"),
            None,
            &current,
            &after_one_second(previous),
            &[1, 2, 3],
        );
        assert_eq!(row.proc_read_bytes_d_sum, Some(50));
        assert_eq!(row.proc_write_bytes_d_sum, Some(300));

        let only_new = reading(0, 0, &[(3, 1, 1)]);
        let row = derive_row(
            timestamp_at(2.0),
            Path::new("/"),
            None,
            &only_new,
            &after_one_second(reading(0, 0, &[])),
            &[3],
        );
        assert_eq!(row.proc_read_bytes_d_sum, None);
    }

    #[test]
    fn test_disk_counter_reset_nulls_fields() {
        let previous = reading(5_000, 50, &[]);
        let current = reading(1_000, 60, &[]);
        let row = derive_row(
            timestamp_at(2.0),
            Path::new("/"),
            None,
            &current,
            &after_one_second(previous),
            &[],
        );
        assert_eq!(row.disk_read_bytes_d, None);
        assert_eq!(row.disk_read_mbps, None);
        assert_eq!(row.disk_read_count_d, Some(10));
    }

    #[test]
    fn test_new_rejects_missing_path() {
        let tmp = tempdir().unwrap();
        let config = SamplerConfig {
            disk_path: tmp.path().join("does-not-exist"),
            ..SamplerConfig::default()
        };
        let result = DiskSampler::new(&config, &tmp.path().join("disk.csv"));
        assert!(matches!(result, Err(MonitorError::InvalidPath { .. })));
    }
}
