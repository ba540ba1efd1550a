use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// A session held at least this long counts as healthy and resets the delay.
    pub stable_after: Duration,
    /// Consecutive failures tolerated before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Double before the first wait after a failure (2x base, 4x base, ...)
    /// rather than waiting the base delay once first.
    pub escalate_first: bool,
}

impl BackoffPolicy {
    /// Cloud tunnel worker: `reconnect_delay` doubling to 30s. A failed
    /// session doubles before sleeping; a stable one sleeps the base delay.
    pub fn tunnel(reconnect_delay: Duration) -> Self {
        Self {
            base: reconnect_delay,
            ceiling: Duration::from_secs(30),
            stable_after: Duration::from_secs(30),
            max_attempts: None,
            escalate_first: true,
        }
    }

    /// Outbound client defaults: `reconnect_delay` doubling to 60s.
    pub fn outbound(reconnect_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base: reconnect_delay,
            ceiling: Duration::from_secs(60),
            stable_after: Duration::from_secs(30),
            max_attempts: max_attempts.filter(|max| *max > 0),
            escalate_first: false,
        }
    }
}

/// Exponential reconnect delay with reset after a stable session.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let next = policy.base.min(policy.ceiling);
        Self {
            policy,
            next,
            failures: 0,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Consecutive short-lived sessions since the last stable one.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records the end of a session that lasted `held` and returns how long to
    /// wait before the next dial, or `None` once the attempt budget is spent.
    pub fn on_session_end(&mut self, held: Duration) -> Option<Duration> {
        let stable = held >= self.policy.stable_after;
        if stable {
            self.reset();
        }
        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                return None;
            }
        }
        if self.policy.escalate_first {
            if !stable {
                self.failures = self.failures.saturating_add(1);
                self.next = self.grow(self.next);
            }
            return Some(self.next);
        }
        self.failures = self.failures.saturating_add(1);
        let delay = self.next;
        self.next = self.grow(delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.next = self.policy.base.min(self.policy.ceiling);
        self.failures = 0;
    }

    fn grow(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.policy.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn tunnel_doubles_before_each_wait_and_caps() {
        let mut backoff = Backoff::new(BackoffPolicy::tunnel(Duration::from_secs(1)));
        let delays: Vec<u64> = (0..8)
            .map(|_| backoff.on_session_end(SHORT).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30, 30]);
        assert_eq!(backoff.failures(), 8);
    }

    #[test]
    fn tunnel_stable_session_waits_base_then_escalates_again() {
        let mut backoff = Backoff::new(BackoffPolicy::tunnel(Duration::from_secs(1)));
        for _ in 0..5 {
            backoff.on_session_end(SHORT);
        }
        let delay = backoff.on_session_end(Duration::from_secs(30)).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.on_session_end(SHORT), Some(Duration::from_secs(2)));
    }

    #[test]
    fn tunnel_base_follows_configured_reconnect_delay() {
        let mut backoff = Backoff::new(BackoffPolicy::tunnel(Duration::from_millis(500)));
        assert_eq!(backoff.on_session_end(SHORT), Some(Duration::from_secs(1)));
        assert_eq!(backoff.on_session_end(SHORT), Some(Duration::from_secs(2)));

        let mut slow = Backoff::new(BackoffPolicy::tunnel(Duration::from_secs(45)));
        assert_eq!(slow.on_session_end(SHORT), Some(Duration::from_secs(30)));
    }

    #[test]
    fn outbound_waits_base_first_then_doubles() {
        let mut backoff = Backoff::new(BackoffPolicy::outbound(Duration::from_secs(5), None));
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.on_session_end(SHORT).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn outbound_policy_caps_at_sixty_seconds() {
        let mut backoff = Backoff::new(BackoffPolicy::outbound(Duration::from_secs(5), None));
        let last = (0..10)
            .filter_map(|_| backoff.on_session_end(SHORT))
            .last()
            .unwrap();
        assert_eq!(last, Duration::from_secs(60));
    }

    #[test]
    fn attempt_budget_is_terminal_until_a_stable_session() {
        let policy = BackoffPolicy::outbound(Duration::from_millis(100), Some(2));
        let mut backoff = Backoff::new(policy);
        assert!(backoff.on_session_end(SHORT).is_some());
        assert!(backoff.on_session_end(SHORT).is_some());
        assert!(backoff.on_session_end(SHORT).is_none());
        assert!(backoff.on_session_end(Duration::from_secs(31)).is_some());
    }

    #[test]
    fn zero_max_attempts_means_unbounded() {
        let policy = BackoffPolicy::outbound(Duration::from_millis(1), Some(0));
        assert_eq!(policy.max_attempts, None);
    }
}
