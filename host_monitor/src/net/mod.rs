//! Network sampler: backend selection and interface filtering

pub mod direct;
pub mod trace;

use crate::{
    config::SamplerConfig, error::MonitorError, sampler::run_loop, stop::SentinelFile,
    stop::StopSignal,
};
use regex::Regex;
use std::{fmt, path::Path, str::FromStr};

pub use direct::DirectCounterBackend;
pub use trace::ExternalTraceBackend;

/// Which data source the network sampler reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetBackendKind {
    /// Cumulative per-interface counters from /proc/net/dev
    Direct,
    /// Per-interval byte sums streamed from a bpftrace subprocess
    Bpftrace,
}

impl NetBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetBackendKind::Direct => "direct",
            NetBackendKind::Bpftrace => "bpftrace",
        }
    }
}

impl fmt::Display for NetBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetBackendKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // `psutil` is accepted for configs written for the older tool
            "direct" | "psutil" => Ok(NetBackendKind::Direct),
            "bpftrace" => Ok(NetBackendKind::Bpftrace),
            other => Err(MonitorError::UnknownBackend(other.to_string())),
        }
    }
}

/// Include/exclude patterns over interface names, with search semantics:
/// a pattern matches if it matches anywhere in the name.
#[derive(Debug, Clone, Default)]
pub struct InterfaceFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl InterfaceFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, MonitorError> {
        Ok(Self {
            include: include.map(compile).transpose()?,
            exclude: exclude.map(compile).transpose()?,
        })
    }

    pub fn from_config(config: &SamplerConfig) -> Result<Self, MonitorError> {
        Self::new(config.nic_include.as_deref(), config.nic_exclude.as_deref())
    }

    /// Kept iff (no include or include matches) and (no exclude or exclude
    /// does not match).
    pub fn keeps(&self, name: &str) -> bool {
        let included = self.include.as_ref().map_or(true, |re| re.is_match(name));
        let excluded = self.exclude.as_ref().is_some_and(|re| re.is_match(name));
        included && !excluded
    }
}

fn compile(pattern: &str) -> Result<Regex, MonitorError> {
    Regex::new(pattern).map_err(|source| MonitorError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Megabits per second for `bytes` transferred over `secs`
pub fn mbps(bytes: u64, secs: f64) -> Option<f64> {
    (secs > 0.0).then(|| bytes as f64 * 8.0 / 1e6 / secs)
}

/// A constructed network sampler of either backend
pub enum NetSampler {
    Direct(DirectCounterBackend),
    Trace(ExternalTraceBackend),
}

impl NetSampler {
    /// Select and construct the backend named by `config.net_backend`.
    pub fn build(
        config: &SamplerConfig,
        output: &Path,
        sentinel: SentinelFile,
    ) -> Result<Self, MonitorError> {
        let sampler = match config.net_backend.parse::<NetBackendKind>()? {
            NetBackendKind::Direct => Self::Direct(DirectCounterBackend::new(config, output)?),
            NetBackendKind::Bpftrace => {
                Self::Trace(ExternalTraceBackend::new(config, output, sentinel)?)
            }
        };
        Ok(sampler)
    }

    pub fn kind(&self) -> NetBackendKind {
        match self {
            NetSampler::Direct(_) => NetBackendKind::Direct,
            NetSampler::Trace(_) => NetBackendKind::Bpftrace,
        }
    }

    /// Sample until stopped, then close the output.
    pub fn run(self, stop: &StopSignal) -> Result<(), MonitorError> {
        match self {
            NetSampler::Direct(backend) => run_loop(backend, stop),
            NetSampler::Trace(backend) => backend.run(stop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_NIC_EXCLUDE;
    use tempfile::tempdir;

    #[test]
    fn test_backend_selector() {
        assert_eq!("direct".parse::<NetBackendKind>().unwrap(), NetBackendKind::Direct);
        assert_eq!("psutil".parse::<NetBackendKind>().unwrap(), NetBackendKind::Direct);
        assert_eq!(
            "bpftrace".parse::<NetBackendKind>().unwrap(),
            NetBackendKind::Bpftrace
        );
        assert!(matches!(
            "Direct".parse::<NetBackendKind>(),
            Err(MonitorError::UnknownBackend(_))
        ));
        assert_eq!(NetBackendKind::Bpftrace.to_string(), "bpftrace");
    }

    #[test]
    fn test_default_exclude_pattern() {
        let filter = InterfaceFilter::new(None, Some(DEFAULT_NIC_EXCLUDE)).unwrap();
        for name in ["lo", "docker0", "br-1a2b", "veth12ab", "virbr0", "cni0", "flannel.1"] {
            assert!(!filter.keeps(name), "{name} should be excluded");
        }
        for name in ["eth0", "enp3s0", "wlan0", "tun-lo"] {
            assert!(filter.keeps(name), "{name} should be kept");
        }
    }

    #[test]
    fn test_include_and_exclude_combine() {
        let filter = InterfaceFilter::new(Some("^eth"), Some("1$")).unwrap();
        assert!(filter.keeps("eth0"));
        assert!(!filter.keeps("eth1"));
        assert!(!filter.keeps("wlan0"));

        // search semantics: an unanchored pattern matches anywhere
        let filter = InterfaceFilter::new(Some("th"), None).unwrap();
        assert!(filter.keeps("eth0"));

        let everything = InterfaceFilter::new(None, None).unwrap();
        assert!(everything.keeps("lo"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = InterfaceFilter::new(None, Some("[")).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidPattern { pattern, .. } if pattern == "["));
    }

    #[test]
    fn test_mbps() {
        assert_eq!(mbps(1_000_000, 1.0), Some(8.0));
        assert_eq!(mbps(500_000, 2.0), Some(2.0));
        assert_eq!(mbps(1, 0.0), None);
    }

    #[test]
    fn test_build_rejects_unknown_backend() {
        let tmp = tempdir().unwrap();
        let config = SamplerConfig {
            net_backend: "pcap".to_string(),
            ..SamplerConfig::default()
        };
        let result = NetSampler::build(
            &config,
            &tmp.path().join("net.csv"),
            SentinelFile::in_dir(tmp.path()),
        );
        assert!(matches!(result, Err(MonitorError::UnknownBackend(_))));
    }

    #[test]
    fn test_build_direct_backend() {
        let tmp = tempdir().unwrap();
        let sampler = NetSampler::build(
            &SamplerConfig::default(),
            &tmp.path().join("net.csv"),
            SentinelFile::in_dir(tmp.path()),
        )
        .unwrap();
        assert_eq!(sampler.kind(), NetBackendKind::Direct);
        assert!(tmp.path().join("net.csv").exists());
    }
}
