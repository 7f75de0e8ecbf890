use crate::policy::Backoff;

use rand::{rng, Rng};
use tokio::time::Duration;

pub trait ExponentialBackoff: Sized {
    fn add_spread(&self, spread: Duration) -> Self;
    fn exponential_backoff(&self, max: Duration) -> Self;
}

impl ExponentialBackoff for Duration {
    fn add_spread(&self, spread: Duration) -> Self {
        if spread.is_zero() {
            return *self;
        }
        let mut rng = rng();
        let spread = rng.random_range(0..spread.as_nanos());
        self.saturating_add(Duration::from_nanos(
            u64::try_from(spread).unwrap_or(u64::MAX),
        ))
    }

    fn exponential_backoff(&self, max: Duration) -> Self {
        std::cmp::min(self.saturating_mul(2), max)
    }
}

impl Backoff {
    /// Returns the wait before the next attempt, after `failures` attempts
    /// have already failed.
    ///
    /// The result never exceeds the configured maximum plus the spread.
    pub(crate) fn delay(&self, failures: u32) -> Duration {
        match self {
            Backoff::Exponential {
                initial,
                max,
                spread,
            } => {
                let mut delay = std::cmp::min(*initial, *max);
                for _ in 1..failures {
                    delay = delay.exponential_backoff(*max);
                }
                delay.add_spread(*spread)
            }
            Backoff::Linear { step, max, spread } => {
                let delay = std::cmp::min(step.saturating_mul(failures.max(1)), *max);
                delay.add_spread(*spread)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_doubles_until_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            spread: Duration::ZERO,
        };
        let delays: Vec<_> = (1..=5).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }

    #[test]
    fn linear_grows_by_step_until_capped() {
        let backoff = Backoff::Linear {
            step: Duration::from_millis(30),
            max: Duration::from_millis(100),
            spread: Duration::ZERO,
        };
        let delays: Vec<_> = (1..=5).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![30, 60, 90, 100, 100]);
    }

    #[test]
    fn spread_stays_within_bounds() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(10),
            spread: Duration::from_millis(5),
        };
        for _ in 0..100 {
            let delay = backoff.delay(3);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay < Duration::from_millis(15));
        }
    }
}
