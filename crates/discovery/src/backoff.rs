//! Exponential backoff between retries of transient registry failures

use std::time::Duration;

/// Exponent at which the backoff stops growing.
pub const MAX_EXPONENTIAL_RETRIES: u32 = 8;

/// Delay before the retry that follows `retries` earlier retries:
/// `2^min(retries, MAX_EXPONENTIAL_RETRIES)` seconds.
#[must_use]
pub const fn backoff_for(retries: u32) -> Duration {
    let exponent = if retries < MAX_EXPONENTIAL_RETRIES {
        retries
    } else {
        MAX_EXPONENTIAL_RETRIES
    };
    Duration::from_secs(1 << exponent)
}

/// Retry counter shared by every step of one discovery session.
///
/// The counter is reset after each successful step, so the delay sequence
/// restarts at one second once the registry recovers.
#[derive(Clone, Debug)]
pub struct Backoff {
    retries: u32,
    max_retries: u32,
}

impl Backoff {
    /// Creates a counter allowing `max_retries` retries between successes.
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self {
            retries: 0,
            max_retries,
        }
    }

    /// Records a failure and returns how long to wait before retrying, or
    /// `None` once the retry ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }

        let delay = backoff_for(self.retries);
        self.retries += 1;
        Some(delay)
    }

    /// Clears the counter after a successful step.
    pub const fn reset(&mut self) {
        self.retries = 0;
    }

    /// Retries taken since the last reset.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_caps() {
        let secs: Vec<u64> = (0..11).map(|n| backoff_for(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 256, 256]);
        assert_eq!(backoff_for(u32::MAX), Duration::from_secs(256));
    }

    #[test]
    fn test_ceiling() {
        let mut backoff = Backoff::new(2);

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.retries(), 2);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(u32::MAX);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.retries(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_ceiling_never_retries() {
        assert_eq!(Backoff::new(0).next_delay(), None);
    }
}
