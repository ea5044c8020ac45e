//! Exponential backoff implementations

use rand::{thread_rng, Rng};
use std::{iter::Iterator, time::Duration};

/// Exponential backoff iterator
///
/// This struct implements the iterator trait and returns monotonically increasing values until either the
/// `cap` is reached (after which the cap is yielded forever) or a specified limit of iterations is exceeded.
/// Each element in the Iterator is the previous element multiplied by the `multiplier` property.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: Option<u32>,
    multiplier: u32,
    initial: Duration,
    current: Duration,
    cap: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            retries: 0,
            limit: Some(13),
            multiplier: 2,
            initial: Duration::from_millis(25),
            current: Duration::from_millis(25),
            cap: Duration::from_secs(3600),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Creates an unlimited backoff which starts at `initial` and never exceeds `cap`
    pub fn capped(initial: Duration, cap: Duration) -> Self {
        Self {
            limit: None,
            initial,
            current: initial,
            cap,
            ..Default::default()
        }
    }

    /// Same as [`Backoff::capped`] but each value is randomly reduced by up to half
    pub fn jittered(initial: Duration, cap: Duration) -> Self {
        Self {
            jitter: true,
            ..Self::capped(initial, cap)
        }
    }

    /// Restarts the sequence from the initial value
    pub fn reset(&mut self) {
        self.retries = 0;
        self.current = self.initial;
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if !self.jitter || duration.is_zero() {
            return duration;
        }

        let millis = duration.as_millis() as u64;
        let reduction = thread_rng().gen_range(0..=millis / 2);
        Duration::from_millis(millis - reduction)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retries += 1;

        if let Some(limit) = self.limit {
            if self.retries > limit {
                return None;
            }
        }

        let value = self.current.min(self.cap);
        self.current = (self.current * self.multiplier).min(self.cap);

        Some(self.apply_jitter(value))
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn increase_monotonically() {
        let mut backoff = Backoff::default();
        let mut previous = Duration::default();

        while let Some(duration) = backoff.next() {
            assert!(previous < duration);
            previous = duration;
        }
    }

    #[test]
    fn stop_after_limit() {
        assert_eq!(Backoff::default().count(), 13);
    }

    #[test]
    fn never_exceed_cap() {
        let cap = Duration::from_millis(300);
        let backoff = Backoff::capped(Duration::from_millis(100), cap);

        let values: Vec<Duration> = backoff.take(6).collect();

        assert_eq!(values[0], Duration::from_millis(100));
        assert_eq!(values[1], Duration::from_millis(200));
        assert!(values[2..].iter().all(|v| *v == cap));
    }

    #[test]
    fn jitter_within_bounds() {
        let cap = Duration::from_millis(800);
        let backoff = Backoff::jittered(Duration::from_millis(100), cap);

        for (index, value) in backoff.take(32).enumerate() {
            let nominal = (Duration::from_millis(100) * 2u32.pow(index.min(3) as u32)).min(cap);
            assert!(value <= nominal);
            assert!(value >= nominal / 2);
        }
    }

    #[test]
    fn restart_after_reset() {
        let mut backoff = Backoff::capped(Duration::from_millis(10), Duration::from_secs(1));
        backoff.next();
        backoff.next();
        backoff.reset();

        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
    }
}
