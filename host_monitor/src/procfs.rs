//! Readers for the kernel pseudo-files the samplers pull counters from.
//!
//! Every `parse_*` function works on the file's text so it can be tested
//! against literal kernel output; the matching `read_*` function only adds
//! the file access.

use eyre::{Result, WrapErr};
use nix::unistd::{sysconf, SysconfVar};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

/// Fallback when sysconf(_SC_CLK_TCK) is unavailable
const DEFAULT_CLK_TCK: u64 = 100;
const DEFAULT_PAGE_SIZE: u64 = 4096;
/// /proc/diskstats always counts 512-byte sectors, whatever the device's
/// logical block size
pub const SECTOR_SIZE: u64 = 512;

pub fn read_text(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path).wrap_err_with(|| format!("Failed to read {}", path.display()))
}

/// USER_HZ: the unit of /proc/stat and /proc/<pid>/stat CPU times
pub fn clock_ticks_per_sec() -> u64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => DEFAULT_CLK_TCK,
    }
}

pub fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// Column names of the aggregate `cpu` line of /proc/stat, in kernel order
pub const CPU_CATEGORIES: [&str; 10] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

/// Aggregate CPU time per category in clock ticks. Older kernels print
/// fewer columns; the missing trailing categories are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes(pub [Option<u64>; 10]);

/// The parts of /proc/stat the CPU sampler uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStat {
    pub cpu: Option<CpuTimes>,
    pub ctx_switches: Option<u64>,
    pub interrupts: Option<u64>,
    pub soft_interrupts: Option<u64>,
    pub procs_running: Option<u64>,
    pub procs_blocked: Option<u64>,
}

pub fn parse_proc_stat(content: &str) -> ProcStat {
    let mut stat = ProcStat::default();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else {
            continue;
        };
        // intr and softirq lines carry the total first, then per-source counts
        let first = || line.split_whitespace().nth(1).and_then(|v| v.parse().ok());

        match key {
            "cpu" => {
                let mut ticks = [None; 10];
                for (slot, value) in ticks.iter_mut().zip(parts) {
                    *slot = value.parse().ok();
                }
                stat.cpu = Some(CpuTimes(ticks));
            }
            "ctxt" => stat.ctx_switches = first(),
            "intr" => stat.interrupts = first(),
            "softirq" => stat.soft_interrupts = first(),
            "procs_running" => stat.procs_running = first(),
            "procs_blocked" => stat.procs_blocked = first(),
            _ => {}
        }
    }

    stat
}

pub fn read_proc_stat() -> Result<ProcStat> {
    read_text("/proc/stat").map(|content| parse_proc_stat(&content))
}

/// (utime, stime) in clock ticks from /proc/<pid>/stat
pub fn parse_pid_stat(content: &str) -> Result<(u64, u64)> {
    // Format: pid (comm) state ppid pgrp ... utime stime cutime cstime ...
    // comm can contain spaces and parentheses, so split after the last ')'
    let Some((_, rest)) = content.rsplit_once(')') else {
        return Err(eyre::eyre!("Invalid stat format: missing ')'"));
    };

    // After ')': 0 = state, 11 = utime, 12 = stime
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 13 {
        return Err(eyre::eyre!(
            "Insufficient fields in stat (got {}, need 13)",
            fields.len()
        ));
    }

    let utime: u64 = fields[11].parse().wrap_err("Failed to parse utime")?;
    let stime: u64 = fields[12].parse().wrap_err("Failed to parse stime")?;
    Ok((utime, stime))
}

/// Total CPU seconds (user + system) consumed by `pid`
pub fn read_pid_cpu_secs(pid: u32, ticks_per_sec: u64) -> Result<f64> {
    let stat_path = format!("/proc/{}/stat", pid);
    let (utime, stime) = parse_pid_stat(&read_text(&stat_path)?)
        .wrap_err_with(|| format!("Failed to parse {}", stat_path))?;
    Ok((utime + stime) as f64 / ticks_per_sec as f64)
}

/// Storage-level I/O byte counters of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidIo {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

pub fn parse_pid_io(content: &str) -> Result<PidIo> {
    let mut read_bytes = None;
    let mut write_bytes = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "read_bytes" => read_bytes = value.trim().parse().ok(),
            "write_bytes" => write_bytes = value.trim().parse().ok(),
            _ => {}
        }
    }

    match (read_bytes, write_bytes) {
        (Some(read_bytes), Some(write_bytes)) => Ok(PidIo {
            read_bytes,
            write_bytes,
        }),
        _ => Err(eyre::eyre!("read_bytes/write_bytes missing from io")),
    }
}

pub fn read_pid_io(pid: u32) -> Result<PidIo> {
    let path = format!("/proc/{}/io", pid);
    parse_pid_io(&read_text(&path)?).wrap_err_with(|| format!("Failed to parse {}", path))
}

/// Parse `Key:   1234 kB` tables (/proc/meminfo, smaps_rollup) into bytes.
/// Values without a unit are taken as-is.
pub fn parse_kb_table(content: &str) -> HashMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let bytes = match parts.next() {
                Some("kB") => value * 1024,
                _ => value,
            };
            Some((key.trim().to_string(), bytes))
        })
        .collect()
}

/// Memory categories psutil-style tools report as "buffers/cached/shared"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfoExtras {
    pub buffers: Option<u64>,
    pub cached: Option<u64>,
    pub shared: Option<u64>,
}

pub fn parse_meminfo(content: &str) -> MemInfoExtras {
    let table = parse_kb_table(content);
    MemInfoExtras {
        buffers: table.get("Buffers").copied(),
        cached: table.get("Cached").copied(),
        shared: table.get("Shmem").copied(),
    }
}

pub fn read_meminfo() -> Result<MemInfoExtras> {
    read_text("/proc/meminfo").map(|content| parse_meminfo(&content))
}

/// Unique and proportional set size of one process, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmapsRollup {
    pub uss: Option<u64>,
    pub pss: Option<u64>,
}

pub fn parse_smaps_rollup(content: &str) -> SmapsRollup {
    let table = parse_kb_table(content);
    let private = ["Private_Clean", "Private_Dirty", "Private_Hugetlb"]
        .iter()
        .filter_map(|key| table.get(*key))
        .fold(None, |acc: Option<u64>, v| Some(acc.unwrap_or(0) + v));

    SmapsRollup {
        uss: private,
        pss: table.get("Pss").copied(),
    }
}

pub fn read_smaps_rollup(pid: u32) -> Result<SmapsRollup> {
    read_text(format!("/proc/{}/smaps_rollup", pid)).map(|content| parse_smaps_rollup(&content))
}

/// Pages swapped in and out since boot (pswpin, pswpout)
pub fn parse_vmstat_swap(content: &str) -> (Option<u64>, Option<u64>) {
    let mut pswpin = None;
    let mut pswpout = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("pswpin"), Some(v)) => pswpin = v.parse().ok(),
            (Some("pswpout"), Some(v)) => pswpout = v.parse().ok(),
            _ => {}
        }
    }
    (pswpin, pswpout)
}

pub fn read_vmstat_swap() -> Result<(Option<u64>, Option<u64>)> {
    read_text("/proc/vmstat").map(|content| parse_vmstat_swap(&content))
}

/// Whole-system block I/O counters summed over the selected devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub busy_time_ms: u64,
}

/// Sum /proc/diskstats rows whose device name passes `keep`.
///
/// Format: major minor name reads merged sectors_read ms_reading writes
/// merged sectors_written ms_writing in_flight ms_doing_io ...
pub fn parse_diskstats(content: &str, keep: impl Fn(&str) -> bool) -> DiskCounters {
    let mut total = DiskCounters::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue; // Skip malformed lines
        }
        if !keep(parts[2]) {
            continue;
        }

        let field = |i: usize| parts[i].parse::<u64>().unwrap_or(0);
        total.read_count += field(3);
        total.read_bytes += field(5) * SECTOR_SIZE;
        total.write_count += field(7);
        total.write_bytes += field(9) * SECTOR_SIZE;
        total.busy_time_ms += field(12);
    }

    total
}

/// Per-interface counters from /proc/net/dev
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetDevCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_drops: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_drops: u64,
}

pub fn parse_net_dev(content: &str) -> BTreeMap<String, NetDevCounters> {
    content
        .lines()
        .filter_map(|line| {
            // The two header lines contain '|' and no interface name before ':'
            let (name, rest) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() || name.contains('|') {
                return None;
            }
            let fields: Vec<u64> = rest
                .split_whitespace()
                .map(|v| v.parse().unwrap_or(0))
                .collect();
            if fields.len() < 12 {
                return None;
            }
            Some((
                name.to_string(),
                NetDevCounters {
                    rx_bytes: fields[0],
                    rx_packets: fields[1],
                    rx_errors: fields[2],
                    rx_drops: fields[3],
                    tx_bytes: fields[8],
                    tx_packets: fields[9],
                    tx_errors: fields[10],
                    tx_drops: fields[11],
                },
            ))
        })
        .collect()
}

pub fn read_net_dev() -> Result<BTreeMap<String, NetDevCounters>> {
    read_text("/proc/net/dev").map(|content| parse_net_dev(&content))
}

/// Distinct (physical id, core id) pairs in /proc/cpuinfo
pub fn parse_physical_cores(cpuinfo: &str) -> Option<usize> {
    let mut cores = HashSet::new();
    let mut physical_id = None;

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "physical id" => physical_id = Some(value.trim().to_string()),
            "core id" => {
                cores.insert((physical_id.clone(), value.trim().to_string()));
            }
            _ => {}
        }
    }

    (!cores.is_empty()).then_some(cores.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "\
cpu  4705 150 1120 16250 520 30 45 7 0 0
cpu0 2352 75 560 8125 260 15 22 3 0 0
cpu1 2353 75 560 8125 260 15 23 4 0 0
intr 114930548 113199788 3 0 5 263 0 4 0 1 0
ctxt 1990473
btime 1062191376
processes 2915
procs_running 3
procs_blocked 1
softirq 183433 0 21755 12 39 1137 231 21459 2263
";

    #[test]
    fn test_parse_proc_stat() {
        let stat = parse_proc_stat(PROC_STAT);
        let cpu = stat.cpu.unwrap();
        assert_eq!(cpu.0[0], Some(4705));
        assert_eq!(cpu.0[3], Some(16250));
        assert_eq!(cpu.0[9], Some(0));
        assert_eq!(stat.ctx_switches, Some(1990473));
        assert_eq!(stat.interrupts, Some(114930548));
        assert_eq!(stat.soft_interrupts, Some(183433));
        assert_eq!(stat.procs_running, Some(3));
        assert_eq!(stat.procs_blocked, Some(1));
    }

    #[test]
    fn test_parse_proc_stat_short_cpu_line() {
        let stat = parse_proc_stat("cpu  10 0 5 100 2 0 0\n");
        let cpu = stat.cpu.unwrap();
        assert_eq!(cpu.0[6], Some(0));
        assert_eq!(cpu.0[7], None);
        assert_eq!(cpu.0[9], None);
        assert_eq!(stat.procs_running, None);
    }

    #[test]
    fn test_parse_pid_stat_with_spaces_in_comm() {
        let content = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 500 0 0 0 250 75 0 0 20 0 4 0 100 0 0";
        assert_eq!(parse_pid_stat(content).unwrap(), (250, 75));
        assert!(parse_pid_stat("1234 (short) S 1 2").is_err());
        assert!(parse_pid_stat("garbage").is_err());
    }

    #[test]
    fn test_parse_pid_io() {
        let content = "rchar: 323934931\nwchar: 323929600\nsyscr: 632687\nsyscw: 632675\nread_bytes: 4096\nwrite_bytes: 323932160\ncancelled_write_bytes: 0\n";
        let io = parse_pid_io(content).unwrap();
        assert_eq!(io.read_bytes, 4096);
        assert_eq!(io.write_bytes, 323932160);
        assert!(parse_pid_io("rchar: 1\n").is_err());
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16303428 kB\nBuffers:          123456 kB\nCached:          2345678 kB\nShmem:             34567 kB\nHugePages_Total:       0\n";
        let extras = parse_meminfo(content);
        assert_eq!(extras.buffers, Some(123456 * 1024));
        assert_eq!(extras.cached, Some(2345678 * 1024));
        assert_eq!(extras.shared, Some(34567 * 1024));

        let table = parse_kb_table(content);
        assert_eq!(table.get("HugePages_Total"), Some(&0));
    }

    #[test]
    fn test_parse_smaps_rollup() {
        let content = "\
55c1e0a00000-7ffd8a1ff000 ---p 00000000 00:00 0                          [rollup]
Rss:                4096 kB
Pss:                2048 kB
Shared_Clean:       1024 kB
Private_Clean:       512 kB
Private_Dirty:      1536 kB
";
        let rollup = parse_smaps_rollup(content);
        assert_eq!(rollup.pss, Some(2048 * 1024));
        assert_eq!(rollup.uss, Some(2048 * 1024));
        assert_eq!(parse_smaps_rollup(""), SmapsRollup::default());
    }

    #[test]
    fn test_parse_vmstat_swap() {
        let content = "nr_free_pages 12345\npswpin 10\npswpout 20\n";
        assert_eq!(parse_vmstat_swap(content), (Some(10), Some(20)));
        assert_eq!(parse_vmstat_swap("nr_free_pages 1\n"), (None, None));
    }

    #[test]
    fn test_parse_diskstats_filters_devices() {
        let content = "\
   7       0 loop0 100 0 200 10 0 0 0 0 0 10 10 0 0 0 0
   8       0 sda 1000 10 8000 500 2000 20 16000 900 0 700 1400 0 0 0 0
   8       1 sda1 900 10 7000 450 1900 20 15000 850 0 650 1300 0 0 0 0
 259       0 nvme0n1 10 0 80 5 20 0 160 9 0 7 14
   1       0 ram0 1 2 3
";
        let counters = parse_diskstats(content, |name| name == "sda" || name == "nvme0n1");
        assert_eq!(counters.read_count, 1010);
        assert_eq!(counters.write_count, 2020);
        assert_eq!(counters.read_bytes, 8080 * SECTOR_SIZE);
        assert_eq!(counters.write_bytes, 16160 * SECTOR_SIZE);
        assert_eq!(counters.busy_time_ms, 707);
    }

    #[test]
    fn test_parse_net_dev() {
        let content = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0:5000 50 1 2 0 0 0 0 7000 70 3 4 0 0 0 0
";
        let devs = parse_net_dev(content);
        assert_eq!(devs.len(), 2);
        let eth0 = devs["eth0"];
        assert_eq!(eth0.rx_bytes, 5000);
        assert_eq!(eth0.rx_packets, 50);
        assert_eq!(eth0.rx_errors, 1);
        assert_eq!(eth0.rx_drops, 2);
        assert_eq!(eth0.tx_bytes, 7000);
        assert_eq!(eth0.tx_packets, 70);
        assert_eq!(eth0.tx_errors, 3);
        assert_eq!(eth0.tx_drops, 4);
    }

    #[test]
    fn test_parse_physical_cores() {
        let cpuinfo = "\
processor\t: 0
physical id\t: 0
core id\t\t: 0

processor\t: 1
physical id\t: 0
core id\t\t: 0

processor\t: 2
physical id\t: 0
core id\t\t: 1
";
        assert_eq!(parse_physical_cores(cpuinfo), Some(2));
        assert_eq!(parse_physical_cores("processor : 0\n"), None);
    }

    #[test]
    fn test_sysconf_values_are_positive() {
        assert!(clock_ticks_per_sec() > 0);
        assert!(page_size() > 0);
    }
}
