use std::time::Duration;

use rand::RngExt;

use crate::config::ReconnectConfig;

/// Exponential backoff with jitter and no attempt limit.
///
/// Owned by the reconnect supervisor and lent to the stream reader, which
/// calls [`reset`](Self::reset) whenever a message gets through so that a
/// healthy connection keeps future reconnects fast.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    randomization_factor: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let max = Duration::from_millis(config.max_delay_ms);
        let initial = Duration::from_millis(config.initial_delay_ms).min(max);
        // A multiplier below 1 or NaN would shrink the interval towards zero
        let multiplier = if config.multiplier.is_finite() && config.multiplier >= 1.0 {
            config.multiplier
        } else {
            1.0
        };
        Self {
            initial,
            max,
            multiplier,
            randomization_factor: config.randomization_factor,
            current: initial,
        }
    }

    /// Restore the initial interval
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// The un-jittered interval the next call to `next_delay` is based on
    pub fn current_interval(&self) -> Duration {
        self.current
    }

    /// Delay to wait before the next attempt. Advances the interval.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current);

        let next_nanos = (self.current.as_nanos() as f64 * self.multiplier) as u64;
        self.current = Duration::from_nanos(next_nanos).min(self.max);

        delay
    }

    /// Pick uniformly from `[interval * (1 - f), interval * (1 + f)]`.
    fn jittered(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let base = interval.as_secs_f64();
        let delta = base * self.randomization_factor;
        let low = (base - delta).max(0.0);
        let high = base + delta;
        if high <= low {
            return interval;
        }
        Duration::from_secs_f64(rand::rng().random_range(low..=high))
    }
}
