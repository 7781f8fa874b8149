/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::{
    sync::atomic::{AtomicI64, Ordering::SeqCst},
    time::Duration,
};

const DEFAULT_ALPHA: f64 = 0.125;
const DEFAULT_BETA: f64 = 0.25;

/// Round-trip time estimator implementing the Jacobson/Karels
/// algorithm: an exponentially smoothed mean plus an exponentially
/// smoothed deviation.
///
/// The estimate feeds the indirect-probe timer: a peer that hasn't
/// acked within [`Rtt::timeout`] of its probe is worth probing
/// indirectly.
#[derive(Debug, Default)]
pub struct Rtt {
    mean: AtomicI64,
    dev: AtomicI64,
}

impl Rtt {
    /// Starts with no estimate. The first [`Rtt::sample`] (or
    /// [`Rtt::hint`]) seeds the mean.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the mean to `mean` and the deviation to zero.
    ///
    /// Use after a known change in network conditions, or to seed a
    /// fresh estimator with the configured probe timeout.
    pub fn hint(&self, mean: Duration) {
        self.mean.store(duration_to_nanos(mean), SeqCst);
        self.dev.store(0, SeqCst);
    }

    /// The estimated mean round-trip time.
    pub fn mean(&self) -> Duration {
        nanos_to_duration(self.mean.load(SeqCst))
    }

    /// The estimated round-trip time deviation.
    pub fn deviation(&self) -> Duration {
        nanos_to_duration(self.dev.load(SeqCst))
    }

    /// Feeds a measured round-trip time into the estimate using the
    /// standard gains (α = 0.125, β = 0.25).
    pub fn sample(&self, value: Duration) {
        self.sample_with(value, DEFAULT_ALPHA, DEFAULT_BETA);
    }

    /// Feeds a measured round-trip time with explicit gains.
    pub fn sample_with(&self, value: Duration, alpha: f64, beta: f64) {
        let value = duration_to_nanos(value) as f64;
        let mean = self.mean.load(SeqCst);
        let dev = self.dev.load(SeqCst);

        let new_mean = (1.0 - alpha) * mean as f64 + alpha * value;
        let new_dev = (1.0 - beta) * dev as f64 + beta * (value - mean as f64).abs();

        // If a parallel sampler won the race its estimate is just as
        // good as ours; losing a CAS is not worth retrying.
        let _ = self
            .mean
            .compare_exchange(mean, new_mean as i64, SeqCst, SeqCst);
        let _ = self.dev.compare_exchange(dev, new_dev as i64, SeqCst, SeqCst);
    }

    /// The retransmission-style timeout: `mean + 4 * deviation`.
    pub fn timeout(&self) -> Duration {
        nanos_to_duration(self.mean.load(SeqCst).saturating_add(4 * self.dev.load(SeqCst)))
    }
}

fn duration_to_nanos(value: Duration) -> i64 {
    i64::try_from(value.as_nanos()).unwrap_or(i64::MAX)
}

fn nanos_to_duration(value: i64) -> Duration {
    Duration::from_nanos(value.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_resets_the_estimate() {
        let rtt = Rtt::new();
        rtt.sample(Duration::from_millis(80));

        rtt.hint(Duration::from_millis(20));

        assert_eq!(Duration::from_millis(20), rtt.mean());
        assert_eq!(Duration::ZERO, rtt.deviation());
        assert_eq!(Duration::from_millis(20), rtt.timeout());
    }

    #[test]
    fn converges_on_constant_input() {
        let rtt = Rtt::new();
        let value = Duration::from_millis(5);

        for _ in 0..10_000 {
            rtt.sample(value);
        }

        let mean_error = if rtt.mean() > value {
            rtt.mean() - value
        } else {
            value - rtt.mean()
        };
        assert!(
            mean_error < Duration::from_micros(1),
            "mean should converge to the sampled value, off by {mean_error:?}"
        );
        assert!(
            rtt.deviation() < Duration::from_micros(1),
            "deviation should decay to zero, got {:?}",
            rtt.deviation()
        );
    }

    #[test]
    fn timeout_tracks_variance() {
        let rtt = Rtt::new();
        rtt.hint(Duration::from_millis(10));

        // Alternating samples keep the deviation positive, pushing the
        // timeout past the mean
        for i in 0..100 {
            let jitter = if i % 2 == 0 { 5 } else { 15 };
            rtt.sample(Duration::from_millis(jitter));
        }

        assert!(rtt.timeout() > rtt.mean());
    }
}
