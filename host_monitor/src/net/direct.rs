//! Network backend reading cumulative interface counters from /proc/net/dev
//!
//! Parsed directly rather than through `sysinfo::Networks`, which does not
//! expose per-interface drop counters.

use super::{mbps, InterfaceFilter, NetBackendKind};
use crate::{
    config::SamplerConfig,
    csv_sink::{CsvRecord, CsvSink},
    error::MonitorError,
    procfs::{read_net_dev, NetDevCounters},
    sampler::Sampler,
    snapshot::{counter_delta, Previous, SnapshotState, Timestamp},
};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path, time::Duration};
use tracing::debug;

type Counters = BTreeMap<String, NetDevCounters>;

/// One interface over one interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectNetRow {
    pub timestamp: String,
    pub ts_mono_s: f64,
    pub seq: u64,
    pub dt_s: Option<f64>,
    pub backend: &'static str,
    pub nic: String,
    pub rx_bytes_d: Option<u64>,
    pub tx_bytes_d: Option<u64>,
    pub rx_mbps: Option<f64>,
    pub tx_mbps: Option<f64>,
    pub rx_pkts_d: Option<u64>,
    pub tx_pkts_d: Option<u64>,
    pub dropin_d: Option<u64>,
    pub dropout_d: Option<u64>,
    pub errin_d: Option<u64>,
    pub errout_d: Option<u64>,
}

impl CsvRecord for DirectNetRow {
    const HEADER: &'static [&'static str] = &[
        "timestamp",
        "ts_mono_s",
        "seq",
        "dt_s",
        "backend",
        "nic",
        "rx_bytes_d",
        "tx_bytes_d",
        "rx_mbps",
        "tx_mbps",
        "rx_pkts_d",
        "tx_pkts_d",
        "dropin_d",
        "dropout_d",
        "errin_d",
        "errout_d",
    ];
}

pub struct DirectCounterBackend {
    interval: Duration,
    filter: InterfaceFilter,
    snapshot: SnapshotState<Counters>,
    sink: CsvSink<DirectNetRow>,
}

impl DirectCounterBackend {
    pub fn new(config: &SamplerConfig, output: &Path) -> Result<Self, MonitorError> {
        Ok(Self {
            interval: config.interval(),
            filter: InterfaceFilter::from_config(config)?,
            snapshot: SnapshotState::new(),
            sink: CsvSink::open(output)?,
        })
    }

    /// Store `current` and write one row per kept interface that was also
    /// present last cycle.
    fn record(&mut self, now: Timestamp, current: Counters) -> Result<usize, MonitorError> {
        let kept: Counters = current
            .into_iter()
            .filter(|(name, _)| self.filter.keeps(name))
            .collect();

        let cycle = self.snapshot.replace(now, kept.clone());
        let Some(previous) = cycle.previous else {
            debug!("net: first cycle, {} interfaces baselined", kept.len());
            return Ok(0);
        };

        let rows = derive_rows(now, cycle.seq, &kept, &previous);
        for row in &rows {
            self.sink.write(row)?;
        }
        Ok(rows.len())
    }
}

/// Rows for interfaces present in both readings, in name order.
pub fn derive_rows(
    now: Timestamp,
    seq: u64,
    current: &Counters,
    previous: &Previous<Counters>,
) -> Vec<DirectNetRow> {
    let dt = previous.elapsed_secs();

    current
        .iter()
        .filter_map(|(nic, cur)| {
            let prev = previous.reading.get(nic)?;
            let rx_bytes_d = counter_delta(cur.rx_bytes, prev.rx_bytes);
            let tx_bytes_d = counter_delta(cur.tx_bytes, prev.tx_bytes);

            Some(DirectNetRow {
                timestamp: now.wall_rfc3339(),
                ts_mono_s: now.mono_secs(),
                seq,
                dt_s: dt,
                backend: NetBackendKind::Direct.as_str(),
                nic: nic.clone(),
                rx_bytes_d,
                tx_bytes_d,
                rx_mbps: rx_bytes_d.zip(dt).and_then(|(b, s)| mbps(b, s)),
                tx_mbps: tx_bytes_d.zip(dt).and_then(|(b, s)| mbps(b, s)),
                rx_pkts_d: counter_delta(cur.rx_packets, prev.rx_packets),
                tx_pkts_d: counter_delta(cur.tx_packets, prev.tx_packets),
                dropin_d: counter_delta(cur.rx_drops, prev.rx_drops),
                dropout_d: counter_delta(cur.tx_drops, prev.tx_drops),
                errin_d: counter_delta(cur.rx_errors, prev.rx_errors),
                errout_d: counter_delta(cur.tx_errors, prev.tx_errors),
            })
        })
        .collect()
}

impl Sampler for DirectCounterBackend {
    fn name(&self) -> &'static str {
        "net"
    }

    fn sample_once(&mut self) -> eyre::Result<()> {
        let now = Timestamp::now();
        let current = read_net_dev()?;
        self.record(now, current)?;
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn close(self) -> Result<(), MonitorError> {
        self.sink.close()
    }
}
