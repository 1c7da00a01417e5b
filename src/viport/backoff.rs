use std::time::Duration;

use crate::config::ViportConfig;

/// Reconnect delay policy: the n-th consecutive retry waits `n * step`,
/// capped at `max_delay`, and retries stop once the waits add up past
/// `total`.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max_delay: Duration,
    total: Duration,

    attempts: u32,
    spent: Duration,
}

impl Backoff {
    pub fn new(config: &ViportConfig) -> Self {
        Self {
            step: Duration::from_millis(config.retry_step_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            total: Duration::from_millis(config.retry_total_ms),
            attempts: 0,
            spent: Duration::ZERO,
        }
    }

    /// Get the delay the next retry would wait, or `None` if retrying is
    /// over budget.
    pub fn peek(&self) -> Option<Duration> {
        let delay = (self.step * (self.attempts + 1)).min(self.max_delay);
        (self.spent + delay <= self.total).then_some(delay)
    }

    /// Consume the next retry.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.peek()?;
        self.attempts += 1;
        self.spent += delay;
        Some(delay)
    }

    /// Retries so far.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget past retries after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.spent = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_then_cap() {
        let mut b = Backoff::new(&ViportConfig::default());
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().unwrap().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 15, 20, 20, 20]);
    }

    #[test]
    fn test_budget_is_enforced() {
        let mut b = Backoff::new(&ViportConfig::default());
        let mut last = Duration::ZERO;
        let mut total = Duration::ZERO;
        while let Some(d) = b.next_delay() {
            assert!(d >= last);
            assert!(d <= Duration::from_secs(20));
            last = d;
            total += d;
        }
        // 5 + 10 + 15 + 20 * 28 = 590; one more 20 s wait would pass 600.
        assert_eq!(total, Duration::from_secs(590));
        assert_eq!(b.attempts(), 31);
        assert_eq!(b.peek(), None);

        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_secs(5)));
    }
}
