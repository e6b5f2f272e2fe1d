//! Previous-reading store and counter delta arithmetic shared by all samplers

use chrono::{DateTime, SecondsFormat, Utc};
use nix::time::{clock_gettime, ClockId};
use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

/// A sampling instant: wall clock for labeling rows, monotonic clock for
/// measuring intervals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    pub wall: DateTime<Utc>,
    pub mono: Duration,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: monotonic_now(),
        }
    }

    /// Monotonic clock reading in seconds
    pub fn mono_secs(&self) -> f64 {
        self.mono.as_secs_f64()
    }

    /// Format the wall clock as ISO 8601 (YYYY-MM-DDTHH:MM:SS.mmmZ)
    pub fn wall_rfc3339(&self) -> String {
        self.wall.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// CLOCK_MONOTONIC as a duration since boot. Shared by all sampler processes
/// on the host, so `ts_mono_s` columns line up across CSV files.
fn monotonic_now() -> Duration {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32),
        Err(_) => {
            static ORIGIN: OnceLock<Instant> = OnceLock::new();
            ORIGIN.get_or_init(Instant::now).elapsed()
        }
    }
}

/// The reading stored by the previous cycle and the time elapsed since it.
#[derive(Debug, Clone)]
pub struct Previous<T> {
    pub reading: T,
    pub elapsed: Duration,
}

impl<T> Previous<T> {
    /// Elapsed seconds, or `None` when the monotonic clock did not advance.
    pub fn elapsed_secs(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then_some(secs)
    }
}

/// Outcome of storing a new reading.
#[derive(Debug, Clone)]
pub struct Cycle<T> {
    /// 0-based sample counter within this process lifetime
    pub seq: u64,
    /// `None` on the first cycle of a process lifetime
    pub previous: Option<Previous<T>>,
}

/// Previous counter reading and timestamp of one sampler.
///
/// Created empty, so the first cycle never has a previous snapshot and every
/// delta-derived field of that row is null.
#[derive(Debug)]
pub struct SnapshotState<T> {
    previous: Option<(Timestamp, T)>,
    samples: u64,
}

impl<T> Default for SnapshotState<T> {
    fn default() -> Self {
        Self {
            previous: None,
            samples: 0,
        }
    }
}

impl<T> SnapshotState<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `reading` taken at `now` and hand back the one it replaces.
    pub fn replace(&mut self, now: Timestamp, reading: T) -> Cycle<T> {
        let seq = self.samples;
        self.samples += 1;

        let previous = self
            .previous
            .replace((now, reading))
            .map(|(then, reading)| Previous {
                reading,
                elapsed: now.mono.saturating_sub(then.mono),
            });

        Cycle { seq, previous }
    }
}

/// `current - previous`, or `None` when the counter went backwards
/// (wraparound, process restart, PID reuse).
pub fn counter_delta(current: u64, previous: u64) -> Option<u64> {
    current.checked_sub(previous)
}

/// Delta of two optional counters; null if either side is missing.
pub fn option_delta(current: Option<u64>, previous: Option<u64>) -> Option<u64> {
    counter_delta(current?, previous?)
}

/// Delta of floating point counters (e.g. CPU seconds); negative is invalid.
pub fn seconds_delta(current: f64, previous: f64) -> Option<f64> {
    let delta = current - previous;
    (delta >= 0.0 && delta.is_finite()).then_some(delta)
}

/// Per-second rate of a delta over `elapsed_secs`.
pub fn per_second(delta: Option<u64>, elapsed_secs: Option<f64>) -> Option<f64> {
    Some(delta? as f64 / elapsed_secs?)
}

/// `part / whole * 100`, null when `whole` is zero.
pub fn percent(part: f64, whole: f64) -> Option<f64> {
    (whole > 0.0).then(|| part / whole * 100.0)
}

/// Fixed wall clock with a chosen monotonic reading, for deterministic tests.
#[cfg(test)]
pub(crate) fn timestamp_at(mono_secs: f64) -> Timestamp {
    Timestamp {
        wall: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
        mono: Duration::from_secs_f64(mono_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: f64) -> Timestamp {
        timestamp_at(secs)
    }

    #[test]
    fn test_first_cycle_has_no_previous() {
        let mut state = SnapshotState::new();
        let cycle = state.replace(at(10.0), 5u64);
        assert_eq!(cycle.seq, 0);
        assert!(cycle.previous.is_none());
        assert_eq!(state.replace(at(11.0), 6).seq, 1);
    }

    #[test]
    fn test_replace_returns_previous_and_elapsed() {
        let mut state = SnapshotState::new();
        state.replace(at(10.0), 5u64);
        let cycle = state.replace(at(11.5), 9u64);
        assert_eq!(cycle.seq, 1);
        let prev = cycle.previous.unwrap();
        assert_eq!(prev.reading, 5);
        assert_eq!(prev.elapsed, Duration::from_millis(1500));
    }

    #[test]
    fn test_clock_not_advancing_yields_no_elapsed() {
        let mut state = SnapshotState::new();
        state.replace(at(3.0), ());
        let prev = state.replace(at(3.0), ()).previous.unwrap();
        assert_eq!(prev.elapsed_secs(), None);
    }

    #[test]
    fn test_counter_delta() {
        for (cur, prev) in [(10u64, 3u64), (7, 7), (u64::MAX, 0)] {
            assert_eq!(counter_delta(cur, prev), Some(cur - prev));
        }
        assert_eq!(counter_delta(3, 10), None);
        assert_eq!(option_delta(Some(5), None), None);
        assert_eq!(option_delta(Some(5), Some(2)), Some(3));
        assert_eq!(option_delta(Some(1), Some(2)), None);
    }

    #[test]
    fn test_seconds_delta_rejects_negative() {
        assert_eq!(seconds_delta(2.5, 1.0), Some(1.5));
        assert_eq!(seconds_delta(1.0, 2.5), None);
        assert_eq!(seconds_delta(f64::NAN, 1.0), None);
    }

    #[test]
    fn test_one_megabyte_over_one_second() {
        let mut state = SnapshotState::new();
        state.replace(at(100.0), 4_000_000u64);
        let cycle = state.replace(at(101.0), 5_000_000u64);
        let prev = cycle.previous.unwrap();
        let rate = per_second(counter_delta(5_000_000, prev.reading), prev.elapsed_secs());
        assert!((rate.unwrap() - 1_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(1.0, 4.0), Some(25.0));
        assert_eq!(percent(1.0, 0.0), None);
    }

    #[test]
    fn test_format_timestamp() {
        let ts = Timestamp {
            wall: DateTime::<Utc>::from_timestamp(1234567890, 0).unwrap_or_default(),
            mono: Duration::ZERO,
        };
        assert!(ts.wall_rfc3339().starts_with("2009-02-13"));
        assert!(ts.wall_rfc3339().ends_with(".000Z"));
    }
}
