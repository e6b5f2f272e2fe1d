//! CPU throttling counters of the cgroup this process runs in (v1 or v2)

use crate::procfs::read_text;
use eyre::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CPU_STAT: &str = "cpu.stat";

/// Throttling counters from a cgroup `cpu.stat` file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupCpuStat {
    pub nr_periods: Option<u64>,
    pub nr_throttled: Option<u64>,
    pub throttled_usec: Option<u64>,
}

/// Candidate `cpu.stat` paths for the cgroup described by `self_cgroup`
/// (contents of /proc/self/cgroup), in probing order without duplicates.
///
/// The v2 root comes first. Each `id:controllers:path` line then adds the
/// unified path when the controller list is empty, or the named v1 hierarchy
/// followed by the merged `cpu,cpuacct` hierarchy when `cpu` is among the
/// controllers.
pub fn cpu_stat_candidates(root: &Path, self_cgroup: &str) -> Vec<PathBuf> {
    let mut candidates = vec![root.join(CPU_STAT)];

    for line in self_cgroup.lines() {
        let parts: Vec<&str> = line.trim().split(':').collect();
        let [_, controllers, path] = parts.as_slice() else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let relative = path.trim_start_matches('/');

        if controllers.is_empty() {
            candidates.push(root.join(relative).join(CPU_STAT));
        } else if controllers.split(',').any(|c| c == "cpu") {
            candidates.push(root.join(controllers).join(relative).join(CPU_STAT));
            candidates.push(root.join("cpu,cpuacct").join(relative).join(CPU_STAT));
        }
    }

    let mut seen = Vec::with_capacity(candidates.len());
    candidates.retain(|path| {
        if seen.contains(path) {
            false
        } else {
            seen.push(path.clone());
            true
        }
    });
    candidates
}

pub fn parse_cpu_stat(content: &str) -> CgroupCpuStat {
    let mut stat = CgroupCpuStat::default();
    let mut throttled_ns = None;
    let mut throttled_time = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().ok();
        match key {
            "nr_periods" => stat.nr_periods = value,
            "nr_throttled" => stat.nr_throttled = value,
            "throttled_usec" => stat.throttled_usec = value,
            "throttled_ns" => throttled_ns = value,
            // cgroup v1 reports nanoseconds under this name
            "throttled_time" => throttled_time = value,
            _ => {}
        }
    }

    stat.throttled_usec = stat
        .throttled_usec
        .or(throttled_ns.map(|ns| ns / 1000))
        .or(throttled_time.map(|ns| ns / 1000));
    stat
}

/// First candidate that exists and has content, parsed.
pub fn read_from_candidates(candidates: &[PathBuf]) -> Option<CgroupCpuStat> {
    candidates.iter().find_map(|path| match read_text(path) {
        Ok(content) if !content.trim().is_empty() => Some(parse_cpu_stat(&content)),
        Ok(_) => None,
        Err(e) => {
            debug!("Skipping cgroup candidate: {:#}", e);
            None
        }
    })
}

/// Throttling counters of the current process's cgroup, or `None` when no
/// readable `cpu.stat` exists.
pub fn read_self_cpu_stat() -> Result<Option<CgroupCpuStat>> {
    let self_cgroup = read_text("/proc/self/cgroup")?;
    let candidates = cpu_stat_candidates(Path::new(CGROUP_ROOT), &self_cgroup);
    Ok(read_from_candidates(&candidates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn root() -> PathBuf {
        PathBuf::from(CGROUP_ROOT)
    }

    #[test]
    fn test_candidates_cgroup_v2() {
        let candidates = cpu_stat_candidates(&root(), "0::/user.slice/session-1.scope\n");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/sys/fs/cgroup/cpu.stat"),
                PathBuf::from("/sys/fs/cgroup/user.slice/session-1.scope/cpu.stat"),
            ]
        );
    }

    #[test]
    fn test_candidates_cgroup_v1_cpu_controller() {
        let self_cgroup = "\
12:memory:/docker/abc
4:cpu,cpuacct:/docker/abc
3:cpuacct:/docker/abc
1:name=systemd:/docker/abc
";
        let candidates = cpu_stat_candidates(&root(), self_cgroup);
        // the named hierarchy and the merged fallback are the same directory here
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/sys/fs/cgroup/cpu.stat"),
                PathBuf::from("/sys/fs/cgroup/cpu,cpuacct/docker/abc/cpu.stat"),
            ]
        );
    }

    #[test]
    fn test_candidates_split_cpu_hierarchy() {
        let candidates = cpu_stat_candidates(&root(), "5:cpu:/batch\n");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/sys/fs/cgroup/cpu.stat"),
                PathBuf::from("/sys/fs/cgroup/cpu/batch/cpu.stat"),
                PathBuf::from("/sys/fs/cgroup/cpu,cpuacct/batch/cpu.stat"),
            ]
        );
    }

    #[test]
    fn test_candidates_skip_malformed_and_root() {
        let self_cgroup = "garbage\n0::/\n2:cpu:\n";
        let candidates = cpu_stat_candidates(&root(), self_cgroup);
        assert_eq!(candidates, vec![PathBuf::from("/sys/fs/cgroup/cpu.stat")]);
    }

    #[test]
    fn test_parse_cpu_stat_v2() {
        let content = "usage_usec 100\nnr_periods 40\nnr_throttled 3\nthrottled_usec 1500\n";
        assert_eq!(
            parse_cpu_stat(content),
            CgroupCpuStat {
                nr_periods: Some(40),
                nr_throttled: Some(3),
                throttled_usec: Some(1500),
            }
        );
    }

    #[test]
    fn test_parse_cpu_stat_nanosecond_fallbacks() {
        let stat = parse_cpu_stat("nr_periods 1\nnr_throttled 0\nthrottled_ns 2500000\n");
        assert_eq!(stat.throttled_usec, Some(2500));

        let v1 = parse_cpu_stat("nr_periods 9\nnr_throttled 2\nthrottled_time 7000\n");
        assert_eq!(v1.throttled_usec, Some(7));

        assert_eq!(parse_cpu_stat(""), CgroupCpuStat::default());
    }

    #[test]
    fn test_read_from_candidates_skips_missing_and_empty() {
        let tmp = tempdir().unwrap();
        let empty = tmp.path().join("empty.stat");
        let full = tmp.path().join("full.stat");
        fs::write(&empty, "").unwrap();
        fs::write(&full, "nr_periods 5\nnr_throttled 1\nthrottled_usec 10\n").unwrap();

        let candidates = vec![tmp.path().join("missing.stat"), empty, full];
        let stat = read_from_candidates(&candidates).unwrap();
        assert_eq!(stat.nr_periods, Some(5));

        assert_eq!(read_from_candidates(&[tmp.path().join("missing.stat")]), None);
    }
}
