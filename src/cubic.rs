//! CUBIC congestion window, measured in segments.

use std::sync::Mutex;
use std::time::Instant;

/// Smallest congestion window the sender is allowed.
pub const MIN_WINDOW: usize = 32;

/// Largest congestion window the sender is allowed.
pub const MAX_WINDOW: usize = 4096;

/// CUBIC growth constant.
const C: f64 = 0.4;

/// Multiplicative decrease factor applied on loss.
const BETA: f64 = 0.7;

/// The CUBIC send algorithm.
///
/// The window grows along `w(t) = C * (t - K)^3 + w_max`, where `w_max` is
/// the window at the last loss event and `K` is chosen so that the curve
/// re-reaches `w_max` after the multiplicative decrease: concave recovery
/// toward the old ceiling, then convex probing past it. Below the slow
/// start threshold the window instead grows by one segment per
/// acknowledged segment. The result is always clamped to
/// [[`MIN_WINDOW`], [`MAX_WINDOW`]].
#[derive(Debug)]
pub struct Cubic {
    inner: Mutex<State>,
}

#[derive(Debug)]
struct State {
    cwnd: f64,
    w_max: f64,
    k: f64,
    ssthresh: f64,
    epoch_start: Option<Instant>,
}

impl Cubic {
    /// Creates an algorithm at the minimum window, in slow start.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State {
                cwnd: MIN_WINDOW as f64,
                w_max: MAX_WINDOW as f64,
                k: 0.0,
                ssthresh: MAX_WINDOW as f64,
                epoch_start: None,
            }),
        }
    }

    /// The current congestion window in segments.
    pub fn window(&self) -> usize {
        clamp(self.inner.lock().unwrap().cwnd)
    }

    /// Grows the window in response to `acked` newly acknowledged
    /// segments.
    pub fn on_ack(&self, acked: usize) {
        let mut state = self.inner.lock().unwrap();
        if state.cwnd < state.ssthresh {
            state.cwnd = (state.cwnd + acked as f64).min(MAX_WINDOW as f64);
            return;
        }
        let now = Instant::now();
        let epoch = match state.epoch_start {
            Some(epoch) => epoch,
            None => {
                state.epoch_start = Some(now);
                state.k = ((state.w_max * (1.0 - BETA)) / C).cbrt();
                now
            }
        };
        let t = now.duration_since(epoch).as_secs_f64();
        let target = cubic_window(t, state.k, state.w_max);
        if target > state.cwnd {
            state.cwnd = target.min(MAX_WINDOW as f64);
        }
    }

    /// Shrinks the window in response to a loss event.
    pub fn on_loss(&self) {
        let mut state = self.inner.lock().unwrap();
        state.w_max = state.cwnd;
        state.cwnd = (state.cwnd * BETA).max(MIN_WINDOW as f64);
        state.ssthresh = state.cwnd;
        state.epoch_start = None;
    }
}

impl Default for Cubic {
    fn default() -> Self {
        Self::new()
    }
}

/// The cubic growth curve, in segments, `t` seconds into the epoch.
fn cubic_window(t: f64, k: f64, w_max: f64) -> f64 {
    C * (t - k).powi(3) + w_max
}

fn clamp(window: f64) -> usize {
    (window as usize).clamp(MIN_WINDOW, MAX_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_the_minimum_window() {
        assert_eq!(Cubic::new().window(), MIN_WINDOW);
    }

    #[test]
    fn slow_start_grows_linearly_with_acks() {
        let cubic = Cubic::new();
        cubic.on_ack(8);
        assert_eq!(cubic.window(), MIN_WINDOW + 8);
        cubic.on_ack(8);
        assert_eq!(cubic.window(), MIN_WINDOW + 16);
    }

    #[test]
    fn loss_applies_multiplicative_decrease() {
        let cubic = Cubic::new();
        cubic.on_ack(968); // window reaches 1000
        assert_eq!(cubic.window(), 1000);
        cubic.on_loss();
        assert_eq!(cubic.window(), 700);
    }

    #[test]
    fn window_never_falls_below_the_minimum() {
        let cubic = Cubic::new();
        for _ in 0..16 {
            cubic.on_loss();
        }
        assert_eq!(cubic.window(), MIN_WINDOW);
    }

    #[test]
    fn window_never_exceeds_the_maximum() {
        let cubic = Cubic::new();
        cubic.on_ack(1 << 20);
        assert_eq!(cubic.window(), MAX_WINDOW);
    }

    #[test]
    fn curve_dips_to_the_reduced_window_then_recovers() {
        let w_max = 1000.0;
        let k = ((w_max * (1.0 - BETA)) / C).cbrt();
        // At the start of the epoch the curve sits at the post-loss window.
        let at_zero = cubic_window(0.0, k, w_max);
        assert!((at_zero - w_max * BETA).abs() < 1e-6, "at_zero = {at_zero}");
        // At t = K the curve has climbed back to the old ceiling.
        let at_k = cubic_window(k, k, w_max);
        assert!((at_k - w_max).abs() < 1e-6);
        // Beyond K it probes past the ceiling.
        assert!(cubic_window(k + 1.0, k, w_max) > w_max);
    }
}
