use backoff::ExponentialBackoff;
use rand::Rng;
use std::time::Duration;

/// Taxonomy an implementor's error maps to, driving whether the engine
/// retries, skips, or aborts outright (spec.md §4.3 "Failure semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, 5xx, timeouts — retried with backoff.
    Transient,
    /// Malformed input, 4xx — never retried, counts against `skip_limit`
    /// immediately.
    Validation,
    /// Config/auth class errors — terminates the step without retrying.
    Fatal,
}

/// `B₀`, multiplier 2, cap `Bmax`, jitter ±10% (spec.md §4.3 "Retry
/// backoff"). Used both for the chunk-level reader backoff and for
/// individual item retries after a chunk write fails.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(30_000),
            max_backoff: Duration::from_millis(600_000),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A chunk-level backoff instance: doubles on continuous failure up to
    /// `max_backoff`, resets to `initial_backoff` on `.reset()`. No
    /// `max_elapsed_time` cap — the engine's `skip_limit` is what bounds
    /// total retries, not wall-clock time.
    pub fn fresh_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            multiplier: self.multiplier,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            randomization_factor: 0.1,
            ..ExponentialBackoff::default()
        }
    }

    /// Item-level retry delay, computed directly rather than through a
    /// stateful `ExponentialBackoff` since each item retries independently.
    pub fn item_backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        };
        let first = policy.item_backoff(1).as_millis();
        let third = policy.item_backoff(3).as_millis();
        // ±10% jitter around 100ms and around the 300ms cap respectively.
        assert!((90..=110).contains(&first), "first={first}");
        assert!(third <= 330, "third={third}");
    }

    #[test]
    fn fresh_backoff_starts_at_initial_interval() {
        let policy = RetryPolicy::default();
        let backoff = policy.fresh_backoff();
        assert_eq!(backoff.current_interval, policy.initial_backoff);
    }
}
