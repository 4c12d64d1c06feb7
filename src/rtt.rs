//! Round-trip time estimation and retransmission timeouts.

use std::sync::Mutex;
use std::time::Duration;

use crate::session::SEGMENT_POLL_INTERVAL;

/// Multiplier applied to the computed retransmission timeout.
pub const DEFAULT_RTO_MULTIPLIER: f64 = 1.5;

/// How long an acknowledgement may be withheld waiting for outbound
/// traffic to carry it.
pub const DEFAULT_MAX_ACK_DELAY: Duration =
    Duration::from_millis(2 * SEGMENT_POLL_INTERVAL.as_millis() as u64);

/// The timeout used before any round trip has been measured.
const INITIAL_RTO: Duration = Duration::from_secs(1);

/// Floor applied to the timeout before the multiplier, so a fast local
/// path does not retransmit on scheduling jitter.
const MIN_RTO: Duration = Duration::from_millis(100);

/// Smoothed round-trip statistics.
///
/// Samples feed the standard exponentially weighted estimate: the first
/// sample seeds the mean and sets the variance to half of it; each later
/// sample `r` updates
///
/// ```text
/// rttvar <- 3/4 rttvar + 1/4 |srtt - r|
/// srtt   <- 7/8 srtt   + 1/8 r
/// ```
///
/// and the retransmission timeout is `(srtt + 4 * rttvar)` floored,
/// then scaled by the configured multiplier.
#[derive(Debug)]
pub struct RttStats {
    inner: Mutex<Estimate>,
}

#[derive(Debug)]
struct Estimate {
    srtt: Duration,
    rttvar: Duration,
    has_sample: bool,
    rto_multiplier: f64,
    max_ack_delay: Duration,
}

impl RttStats {
    /// Creates statistics with no samples and default tunables.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Estimate {
                srtt: Duration::ZERO,
                rttvar: Duration::ZERO,
                has_sample: false,
                rto_multiplier: DEFAULT_RTO_MULTIPLIER,
                max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            }),
        }
    }

    /// Folds one measured round trip into the estimate.
    pub fn record(&self, sample: Duration) {
        let mut estimate = self.inner.lock().unwrap();
        if estimate.has_sample {
            let deviation = if estimate.srtt > sample {
                estimate.srtt - sample
            } else {
                sample - estimate.srtt
            };
            estimate.rttvar = estimate.rttvar * 3 / 4 + deviation / 4;
            estimate.srtt = estimate.srtt * 7 / 8 + sample / 8;
        } else {
            estimate.srtt = sample;
            estimate.rttvar = sample / 2;
            estimate.has_sample = true;
        }
    }

    /// The smoothed round-trip time; zero before the first sample.
    pub fn smoothed(&self) -> Duration {
        self.inner.lock().unwrap().srtt
    }

    /// The current retransmission timeout.
    pub fn rto(&self) -> Duration {
        let estimate = self.inner.lock().unwrap();
        let base = if estimate.has_sample {
            estimate.srtt + estimate.rttvar * 4
        } else {
            INITIAL_RTO
        };
        base.max(MIN_RTO).mul_f64(estimate.rto_multiplier)
    }

    /// Replaces the retransmission-timeout multiplier.
    pub fn set_rto_multiplier(&self, multiplier: f64) {
        assert!(multiplier > 0.0, "RTO multiplier must be positive");
        self.inner.lock().unwrap().rto_multiplier = multiplier;
    }

    /// The longest an acknowledgement may be delayed.
    pub fn max_ack_delay(&self) -> Duration {
        self.inner.lock().unwrap().max_ack_delay
    }

    /// Replaces the acknowledgement delay bound.
    pub fn set_max_ack_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().max_ack_delay = delay;
    }
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_estimate() {
        let stats = RttStats::new();
        assert_eq!(stats.smoothed(), Duration::ZERO);
        stats.record(Duration::from_millis(80));
        assert_eq!(stats.smoothed(), Duration::from_millis(80));
        // srtt + 4 * rttvar = 80 + 4 * 40 = 240ms, times the 1.5 multiplier.
        assert_eq!(stats.rto(), Duration::from_millis(360));
    }

    #[test]
    fn estimate_tracks_steady_samples() {
        let stats = RttStats::new();
        for _ in 0..50 {
            stats.record(Duration::from_millis(100));
        }
        let smoothed = stats.smoothed();
        assert!(
            smoothed > Duration::from_millis(95) && smoothed < Duration::from_millis(105),
            "smoothed = {smoothed:?}"
        );
    }

    #[test]
    fn rto_before_any_sample_is_conservative() {
        let stats = RttStats::new();
        assert_eq!(stats.rto(), INITIAL_RTO.mul_f64(DEFAULT_RTO_MULTIPLIER));
    }

    #[test]
    fn rto_has_a_floor() {
        let stats = RttStats::new();
        stats.record(Duration::from_micros(300));
        assert!(stats.rto() >= MIN_RTO);
    }

    #[test]
    fn multiplier_scales_the_timeout() {
        let stats = RttStats::new();
        stats.record(Duration::from_millis(100));
        let base = stats.rto();
        stats.set_rto_multiplier(3.0);
        assert_eq!(stats.rto(), base * 2);
    }

    #[test]
    fn ack_delay_is_configurable() {
        let stats = RttStats::new();
        assert_eq!(stats.max_ack_delay(), DEFAULT_MAX_ACK_DELAY);
        stats.set_max_ack_delay(Duration::from_millis(5));
        assert_eq!(stats.max_ack_delay(), Duration::from_millis(5));
    }
}
