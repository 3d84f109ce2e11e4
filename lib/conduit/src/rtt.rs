//! Smoothed round-trip estimation and retransmission timeouts.

use std::time::Duration;

const ALPHA: f64 = 0.125;
const MIN_RTO_MS: f64 = 50.0;
const MAX_RTO_MS: f64 = 2000.0;
const RTO_FACTOR: f64 = 1.5;

/// Assumed round trip before the first sample arrives.
const INITIAL_SRTT_MS: f64 = 200.0;

/// Exponential moving average of the round trip time, fed exclusively from
/// heartbeat echoes so that retransmitted segments never skew the estimate.
pub struct RttEstimator {
    smoothed_ms: Option<f64>,
}

impl RttEstimator {
    #[inline]
    pub fn new() -> RttEstimator {
        RttEstimator { smoothed_ms: None }
    }

    /// Feeds one round-trip sample in milliseconds. Non-positive samples are
    /// ignored. The first sample bootstraps the average.
    pub fn sample(&mut self, rtt_ms: i64) {
        if rtt_ms <= 0 {
            return;
        }

        let sample = rtt_ms as f64;

        self.smoothed_ms = Some(match self.smoothed_ms {
            Some(smoothed) => ALPHA * sample + (1.0 - ALPHA) * smoothed,
            None => sample,
        });
    }

    /// The current smoothed round trip, if any sample has been observed.
    #[inline]
    pub fn smoothed(&self) -> Option<Duration> {
        self.smoothed_ms.map(|ms| Duration::from_micros((ms * 1000.0) as u64))
    }

    /// Retransmission timeout for the given backoff exponent: the base
    /// timeout doubles per prior attempt, clamped to the ceiling.
    pub fn rto(&self, backoff: u32) -> Duration {
        let smoothed = self.smoothed_ms.unwrap_or(INITIAL_SRTT_MS);
        let base = (RTO_FACTOR * smoothed).max(MIN_RTO_MS);

        let backoff = backoff.min(16);
        let timeout = (base * f64::from(1u32 << backoff)).min(MAX_RTO_MS);

        Duration::from_micros((timeout * 1000.0) as u64)
    }
}
