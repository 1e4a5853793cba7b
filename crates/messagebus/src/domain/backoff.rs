//! Jittered exponential backoff for the reconnect scheduler.
//!
//! ```text
//! nominal[0]   = initial
//! nominal[n+1] = min(nominal[n] * multiplier, max)
//! sleep[n]     = min(nominal[n] + uniform(0, jitter_ratio * nominal[n]), max)
//! ```
//!
//! With the defaults (2 s, x1.1, 10 % jitter, 10 s cap) the scheduler waits
//! 2.0-2.2 s, then 2.2-2.42 s, and so on until every sleep is 10 s.

use std::time::Duration;

use rand::Rng;

/// Multiplier applied to the nominal delay after each failed reconnect.
pub const DEFAULT_MULTIPLIER: f64 = 1.1;

/// Upper bound of the random jitter, as a fraction of the nominal delay.
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Hard ceiling on any reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Backoff controller. Owned by one bus instance, behind its lock.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_ratio: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier: multiplier.max(1.0),
            jitter_ratio: DEFAULT_JITTER_RATIO,
            attempt: 0,
        }
    }

    /// Set the jitter ratio, clamped to `[0, 1]`. Zero makes sleeps exact.
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Return the next sleep and advance the nominal delay.
    ///
    /// The returned sleep is never below the nominal delay it was drawn from
    /// and never above the ceiling.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt += 1;
        let nominal = self.current_delay;

        let jitter = if self.jitter_ratio > 0.0 {
            let bound = nominal.as_secs_f64() * self.jitter_ratio;
            rand::thread_rng().gen_range(0.0..=bound)
        } else {
            0.0
        };
        let sleep = Duration::from_secs_f64(nominal.as_secs_f64() + jitter).min(self.max_delay);

        let grown = Duration::from_secs_f64(nominal.as_secs_f64() * self.multiplier);
        self.current_delay = grown.min(self.max_delay);

        sleep
    }

    /// Back to the initial delay. Called after a successful connect.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Nominal delay the next `next_sleep` is drawn from.
    pub fn nominal_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Sleeps handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER)
    }
}
