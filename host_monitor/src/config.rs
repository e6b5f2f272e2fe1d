use crate::{error::MonitorError, net::NetBackendKind, net::InterfaceFilter};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Interfaces skipped unless the user overrides the exclude pattern:
/// loopback plus common container/virtual bridge and tunnel prefixes.
pub const DEFAULT_NIC_EXCLUDE: &str = r"^(lo|docker\d+|br-|veth|virbr|cni\d+|flannel\.)";

/// Settings shared by every sampler. Immutable once a sampler starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Sampling interval in seconds (default: 1.0)
    #[serde(default = "default_interval_s")]
    pub interval_s: f64,

    /// Tracked process IDs for per-process aggregates
    #[serde(default)]
    pub pids: Option<Vec<u32>>,

    /// Filesystem path whose usage the disk sampler reports (default: /)
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,

    /// Network backend selector: `direct` or `bpftrace`
    #[serde(default = "default_net_backend")]
    pub net_backend: String,

    /// Only report interfaces matching this regex
    #[serde(default)]
    pub nic_include: Option<String>,

    /// Never report interfaces matching this regex
    #[serde(default = "default_nic_exclude")]
    pub nic_exclude: Option<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_s: default_interval_s(),
            pids: None,
            disk_path: default_disk_path(),
            net_backend: default_net_backend(),
            nic_include: None,
            nic_exclude: default_nic_exclude(),
        }
    }
}

fn default_interval_s() -> f64 {
    1.0
}
fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}
fn default_net_backend() -> String {
    "direct".to_string()
}
fn default_nic_exclude() -> Option<String> {
    Some(DEFAULT_NIC_EXCLUDE.to_string())
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_s)
    }

    /// Tracked PIDs, empty when per-process aggregates are disabled
    pub fn tracked_pids(&self) -> &[u32] {
        self.pids.as_deref().unwrap_or_default()
    }

    /// Check everything that can be checked without touching the host.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if !(self.interval_s.is_finite() && self.interval_s > 0.0) {
            return Err(MonitorError::Config(format!(
                "interval_s must be a positive number of seconds (got {})",
                self.interval_s
            )));
        }
        self.net_backend.parse::<NetBackendKind>()?;
        InterfaceFilter::new(self.nic_include.as_deref(), self.nic_exclude.as_deref())?;
        Ok(())
    }

    /// Encode for the sampler process command line
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).wrap_err("Failed to encode sampler configuration")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).wrap_err("Failed to decode sampler configuration")
    }
}

/// Controller settings: where to write, how long to run, how long to wait
/// for samplers on shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Output directory for the CSV files (default: ./mon)
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Run duration in seconds; run until interrupted when unset
    #[serde(default)]
    pub duration_s: Option<f64>,

    /// How long `stop_all` waits for each sampler before killing it (default: 5000)
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default)]
    pub sampler: SamplerConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            duration_s: None,
            join_timeout_ms: default_join_timeout_ms(),
            sampler: SamplerConfig::default(),
        }
    }
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("./mon")
}
fn default_join_timeout_ms() -> u64 {
    5000
}

impl MonitorConfig {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_s.map(Duration::from_secs_f64)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if let Some(duration) = self.duration_s {
            if !(duration.is_finite() && duration >= 0.0) {
                return Err(MonitorError::Config(format!(
                    "duration_s must be a non-negative number of seconds (got {duration})"
                )));
            }
        }
        if self.join_timeout_ms == 0 {
            return Err(MonitorError::Config(
                "join_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.sampler.validate()
    }
}

/// Values given on the command line; each one that is set wins over the
/// config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub out_dir: Option<PathBuf>,
    pub interval_s: Option<f64>,
    pub duration_s: Option<f64>,
    pub pids: Option<Vec<u32>>,
    pub disk_path: Option<PathBuf>,
    pub net_backend: Option<String>,
    pub nic_include: Option<String>,
    pub nic_exclude: Option<String>,
}

/// Load the YAML config file (or defaults), apply CLI overrides and validate.
pub fn load_monitor_config(
    config_path: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<MonitorConfig> {
    let mut config = if let Some(path) = config_path {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str::<MonitorConfig>(&content)
            .wrap_err_with(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        MonitorConfig::default()
    };

    let ConfigOverrides {
        out_dir,
        interval_s,
        duration_s,
        pids,
        disk_path,
        net_backend,
        nic_include,
        nic_exclude,
    } = overrides;

    if let Some(out_dir) = out_dir {
        config.out_dir = out_dir;
    }
    if let Some(interval_s) = interval_s {
        config.sampler.interval_s = interval_s;
    }
    if duration_s.is_some() {
        config.duration_s = duration_s;
    }
    if pids.is_some() {
        config.sampler.pids = pids;
    }
    if let Some(disk_path) = disk_path {
        config.sampler.disk_path = disk_path;
    }
    if let Some(net_backend) = net_backend {
        config.sampler.net_backend = net_backend;
    }
    if nic_include.is_some() {
        config.sampler.nic_include = nic_include;
    }
    if nic_exclude.is_some() {
        config.sampler.nic_exclude = nic_exclude;
    }

    // An empty pattern on the command line disables that filter
    config.sampler.nic_include = config.sampler.nic_include.filter(|p| !p.is_empty());
    config.sampler.nic_exclude = config.sampler.nic_exclude.filter(|p| !p.is_empty());
    config.sampler.pids = config.sampler.pids.filter(|pids| !pids.is_empty());

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.out_dir, PathBuf::from("./mon"));
        assert_eq!(config.duration_s, None);
        assert_eq!(config.join_timeout(), Duration::from_secs(5));
        assert_eq!(config.sampler.interval(), Duration::from_secs(1));
        assert_eq!(config.sampler.disk_path, PathBuf::from("/"));
        assert_eq!(config.sampler.net_backend, "direct");
        assert_eq!(config.sampler.nic_include, None);
        assert_eq!(
            config.sampler.nic_exclude.as_deref(),
            Some(DEFAULT_NIC_EXCLUDE)
        );
        assert!(config.sampler.tracked_pids().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        for interval_s in [0.0, -1.0, f64::NAN] {
            let config = SamplerConfig {
                interval_s,
                ..SamplerConfig::default()
            };
            assert!(matches!(config.validate(), Err(MonitorError::Config(_))));
        }
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let config = SamplerConfig {
            net_backend: "pcap".to_string(),
            ..SamplerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MonitorError::UnknownBackend(name)) if name == "pcap"
        ));
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let config = SamplerConfig {
            nic_include: Some("(eth".to_string()),
            ..SamplerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MonitorError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip_keeps_pids() {
        let config = SamplerConfig {
            pids: Some(vec![10, 20]),
            ..SamplerConfig::default()
        };
        let decoded = SamplerConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_yaml_file_with_overrides() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("monitor.yaml");
        fs::write(
            &path,
            "out_dir: /tmp/run1\nduration_s: 30\nsampler:\n  interval_s: 0.5\n  net_backend: bpftrace\n  pids: [1, 2]\n",
        )
        .unwrap();

        let config = load_monitor_config(
            Some(&path),
            ConfigOverrides {
                interval_s: Some(2.0),
                nic_exclude: Some(String::new()),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();

        assert_eq!(config.out_dir, PathBuf::from("/tmp/run1"));
        assert_eq!(config.duration_s, Some(30.0));
        assert_eq!(config.sampler.interval_s, 2.0);
        assert_eq!(config.sampler.net_backend, "bpftrace");
        assert_eq!(config.sampler.tracked_pids(), &[1, 2]);
        assert_eq!(config.sampler.nic_exclude, None);
        // unspecified keys keep their defaults
        assert_eq!(config.join_timeout_ms, 5000);
        assert_eq!(config.sampler.disk_path, PathBuf::from("/"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = load_monitor_config(
            Some(Path::new("/nonexistent/monitor.yaml")),
            ConfigOverrides::default(),
        );
        assert!(result.is_err());
    }
}
