//! Decreasing backoff for polling a job that is expected to finish soon.
//!
//! The first wait is the longest; each following wait is halved down to a
//! floor, and the sum of all waits never exceeds the budget.

use async_trait::async_trait;
use std::time::Duration;

/// Bounds of a polling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First (and largest) wait between two polls.
    pub max_interval: Duration,
    /// Floor the interval is halved down to.
    pub min_interval: Duration,
    /// Total time allotted to sleeping before the job is declared timed out.
    pub budget: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(5),
            budget: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// A schedule that waits the same `interval` every time.
    pub fn fixed(interval: Duration, budget: Duration) -> Self {
        Self {
            max_interval: interval,
            min_interval: interval,
            budget,
        }
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            interval: self.max_interval.max(self.min_interval),
            elapsed: Duration::ZERO,
        }
    }
}

/// Stepper over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    interval: Duration,
    elapsed: Duration,
}

impl Backoff {
    /// Next wait, clamped to what is left of the budget. `None` once the budget is spent.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.elapsed >= self.policy.budget {
            return None;
        }
        let wait = self.interval.min(self.policy.budget - self.elapsed);
        self.elapsed += wait;
        self.interval = halve(self.interval).max(self.policy.min_interval);
        Some(wait)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed >= self.policy.budget
    }
}

// Whole seconds, floored.
fn halve(d: Duration) -> Duration {
    if d.subsec_nanos() == 0 {
        Duration::from_secs(d.as_secs() / 2)
    } else {
        d / 2
    }
}

/// Suspension point of the polling loops.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real-time sleeper.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn drain(policy: BackoffPolicy) -> Vec<Duration> {
        let mut backoff = policy.start();
        std::iter::from_fn(|| backoff.next_wait()).collect()
    }

    #[test]
    fn default_schedule_halves_then_floors() {
        let waits = drain(BackoffPolicy::default());
        let expected: Vec<Duration> = [60, 30, 15, 7, 5, 5, 5]
            .into_iter()
            .map(secs)
            .collect();
        assert_eq!(&waits[..7], &expected[..]);
        assert_eq!(waits.iter().sum::<Duration>(), secs(300));
    }

    #[test]
    fn last_wait_is_clamped_to_remaining_budget() {
        let policy = BackoffPolicy {
            max_interval: secs(6),
            min_interval: secs(2),
            budget: secs(10),
        };
        assert_eq!(drain(policy), vec![secs(6), secs(3), secs(1)]);
    }

    #[test]
    fn waits_never_increase_and_respect_floor_until_clamp() {
        let policy = BackoffPolicy {
            max_interval: secs(45),
            min_interval: secs(4),
            budget: secs(200),
        };
        let waits = drain(policy);
        assert!(waits.windows(2).all(|w| w[1] <= w[0]));
        let (last, rest) = waits.split_last().unwrap();
        assert!(rest.iter().all(|w| *w >= secs(4)));
        assert!(*last > Duration::ZERO);
        assert_eq!(waits.iter().sum::<Duration>(), secs(200));
    }

    #[test]
    fn fixed_schedule_repeats_interval() {
        let waits = drain(BackoffPolicy::fixed(secs(3), secs(30)));
        assert_eq!(waits.len(), 10);
        assert!(waits.iter().all(|w| *w == secs(3)));
    }

    #[test]
    fn zero_budget_never_waits() {
        let mut backoff = BackoffPolicy::fixed(secs(3), Duration::ZERO).start();
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_wait(), None);
    }

    #[test]
    fn min_above_max_uses_min() {
        let policy = BackoffPolicy {
            max_interval: secs(1),
            min_interval: secs(5),
            budget: secs(12),
        };
        assert_eq!(drain(policy), vec![secs(5), secs(5), secs(2)]);
    }
}
