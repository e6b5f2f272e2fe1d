//! Loop shared by the periodic samplers

use crate::{error::MonitorError, stop::StopSignal};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A periodic sampler: one call to [`Sampler::sample_once`] produces the
/// rows for one interval.
pub trait Sampler {
    /// Short name used in logs (`cpu`, `mem`, ...)
    fn name(&self) -> &'static str;

    /// Perform one measurement cycle and write its row(s).
    fn sample_once(&mut self) -> eyre::Result<()>;

    fn interval(&self) -> Duration;

    /// Whether `sample_once` already blocks for the interval, so the loop
    /// must not sleep again.
    fn paces_itself(&self) -> bool {
        false
    }

    /// Flush and close the output.
    fn close(self) -> Result<(), MonitorError>;
}

/// Run `sampler` until `stop` is set, then close it.
///
/// A failed cycle is logged and the loop carries on; only closing the output
/// can fail.
pub fn run_loop<S: Sampler>(mut sampler: S, stop: &StopSignal) -> Result<(), MonitorError> {
    let name = sampler.name();
    let interval = sampler.interval();
    info!("{} sampler started (interval {:?})", name, interval);

    let mut cycles = 0u64;
    let mut failures = 0u64;
    while !stop.is_set() {
        cycles += 1;
        if let Err(e) = sampler.sample_once() {
            failures += 1;
            warn!("{} sample failed: {:#}", name, e);
        }

        if !sampler.paces_itself() && stop.wait_timeout(interval) {
            break;
        }
    }

    debug!("{} sampler stopping after {} cycles ({} failed)", name, cycles, failures);
    sampler.close()
}
