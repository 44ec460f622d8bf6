//! Bounded sampling of a packet counter.
//!
//! Used both to detect ramp-up (per-interval rate) and to wait for a packet
//! count. The loop is synchronous and ends after a fixed number of samples.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::stats::PacketCounter;

/// Samples taken after the baseline before giving up.
pub const DEFAULT_ITERATIONS: u32 = 50;
/// Spacing between samples.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// What a packet poll waits for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollTarget {
    /// More than `pps / 10` packets within a single interval.
    Rate { pps: u64 },
    /// More than `packets` packets since the first sample.
    Count { packets: u64 },
}

/// Polls `counter` until `target` is met or `iterations` samples have been
/// taken after the baseline.
///
/// Running out of iterations is `Ok(false)`; only a failed counter read is an
/// error. In rate mode the baseline moves to each new sample, so the check is
/// on the instantaneous per-interval delta rather than an average.
pub fn poll_packets<C>(
    counter: &mut C,
    target: PollTarget,
    iterations: u32,
    interval: Duration,
) -> Result<bool>
where
    C: PacketCounter + ?Sized,
{
    let mut start = counter.rx_packets()?;
    for i in 0..iterations {
        thread::sleep(interval);
        let now = counter.rx_packets()?;
        let delta = now.saturating_sub(start);
        match target {
            PollTarget::Rate { pps } => {
                // Real division: pps = 5 needs more than 0.5 packets.
                if delta as f64 > pps as f64 / 10.0 {
                    tracing::debug!(iteration = i, delta, pps, "traffic rate reached");
                    return Ok(true);
                }
                start = now;
            }
            PollTarget::Count { packets } => {
                if delta > packets {
                    tracing::debug!(iteration = i, delta, packets, "packet count reached");
                    return Ok(true);
                }
            }
        }
    }
    tracing::debug!(?target, iterations, "packet poll exhausted");
    Ok(false)
}
