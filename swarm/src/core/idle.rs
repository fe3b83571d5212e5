//! Idle-shutdown policy and backoff schedule for empty queues.

use std::time::Duration;

/// What a worker should do after inspecting the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    /// Work was found; proceed without waiting.
    Continue,
    /// Queue was empty; wait `delay` and query again.
    BackoffThenRetry { delay: Duration },
    /// Queue stayed empty for `idle_limit` consecutive checks; exit voluntarily.
    Shutdown,
}

/// Counter-based idle shutdown policy.
///
/// Pure: the decision depends only on the streak and the configured limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleShutdownPolicy {
    pub idle_limit: u32,
    pub auto_shutdown: bool,
    pub backoff: Backoff,
}

impl IdleShutdownPolicy {
    pub fn decide(&self, idle_streak: u32) -> IdleDecision {
        if idle_streak == 0 {
            return IdleDecision::Continue;
        }
        if self.auto_shutdown && idle_streak >= self.idle_limit {
            return IdleDecision::Shutdown;
        }
        IdleDecision::BackoffThenRetry {
            delay: self.backoff.delay(idle_streak),
        }
    }
}

/// Capped exponential backoff: `base * 2^(attempt-1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let factor = 1u32 << shift;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(idle_limit: u32, auto_shutdown: bool) -> IdleShutdownPolicy {
        IdleShutdownPolicy {
            idle_limit,
            auto_shutdown,
            backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(60)),
        }
    }

    #[test]
    fn shuts_down_on_the_kth_empty_check_not_before() {
        let p = policy(3, true);
        assert!(matches!(p.decide(1), IdleDecision::BackoffThenRetry { .. }));
        assert!(matches!(p.decide(2), IdleDecision::BackoffThenRetry { .. }));
        assert_eq!(p.decide(3), IdleDecision::Shutdown);
        assert_eq!(p.decide(4), IdleDecision::Shutdown);
    }

    #[test]
    fn never_shuts_down_when_disabled() {
        let p = policy(1, false);
        for streak in [1, 2, 10, 1_000, u32::MAX] {
            assert!(matches!(
                p.decide(streak),
                IdleDecision::BackoffThenRetry { .. }
            ));
        }
    }

    #[test]
    fn zero_streak_continues() {
        assert_eq!(policy(1, true).decide(0), IdleDecision::Continue);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(b.delay(1), Duration::from_secs(5));
        assert_eq!(b.delay(2), Duration::from_secs(10));
        assert_eq!(b.delay(3), Duration::from_secs(20));
        assert_eq!(b.delay(4), Duration::from_secs(40));
        assert_eq!(b.delay(5), Duration::from_secs(60));
        assert_eq!(b.delay(500), Duration::from_secs(60));
    }

    #[test]
    fn backoff_max_never_below_base() {
        let b = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(10));
    }
}
