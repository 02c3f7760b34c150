//! Retry and backoff policy for candidate dispatch.
//!
//! The bounds and windows here are heuristics, not SLA-derived
//! constants; they are plain configuration so deployments can tune them.

use std::time::Duration;

use rand::Rng;

use crate::config::DispatchConfig;

/// Tunable retry policy consulted by the dispatcher.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Tries per candidate before advancing.
    pub tries_per_candidate: u32,
    /// Linear backoff step for transient/transport failures.
    pub transient_step: Duration,
    /// Lower bound of the randomized quota backoff window.
    pub quota_window_min: Duration,
    /// Upper bound of the first quota backoff window.
    pub quota_window_max: Duration,
    /// User-facing text for the terminal fallback chunk.
    pub fallback_message: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration.
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            tries_per_candidate: config.tries_per_candidate.max(1),
            transient_step: Duration::from_millis(config.transient_backoff_ms),
            quota_window_min: Duration::from_millis(config.quota_backoff_min_ms),
            quota_window_max: Duration::from_millis(
                config.quota_backoff_max_ms.max(config.quota_backoff_min_ms + 1),
            ),
            fallback_message: config.fallback_message.clone(),
        }
    }

    /// Backoff before retrying the same candidate after a transient or
    /// transport failure. Grows linearly with the attempt number.
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        self.transient_step.saturating_mul(attempt.max(1))
    }

    /// Randomized backoff after a quota failure.
    ///
    /// Drawn from a window that widens with each quota occurrence seen
    /// during the current dispatch: the first occurrence waits within
    /// `[min, max]`, the second within `[min, 2*max]`, and so on.
    pub fn quota_backoff(&self, occurrence: u32) -> Duration {
        let min = self.quota_window_min.as_millis() as u64;
        let max = (self.quota_window_max.as_millis() as u64)
            .saturating_mul(u64::from(occurrence.max(1)));
        let upper = max.max(min + 1);
        Duration::from_millis(rand::thread_rng().gen_range(min..=upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.transient_backoff(1), Duration::from_secs(1));
        assert_eq!(policy.transient_backoff(2), Duration::from_secs(2));
        assert_eq!(policy.transient_backoff(3), Duration::from_secs(3));
    }

    #[test]
    fn quota_backoff_stays_in_window() {
        let policy = RetryPolicy::default();
        for _ in 0..32 {
            let wait = policy.quota_backoff(1);
            assert!(wait >= Duration::from_secs(2), "wait {wait:?} below window");
            assert!(wait <= Duration::from_secs(5), "wait {wait:?} above window");
        }
    }

    #[test]
    fn quota_window_widens_per_occurrence() {
        let policy = RetryPolicy::default();
        // The second-occurrence upper bound doubles; sample enough draws
        // that at least one should exceed the first window.
        let widened = (0..256)
            .map(|_| policy.quota_backoff(2))
            .any(|w| w > Duration::from_secs(5));
        assert!(widened);
    }

    #[test]
    fn zero_try_bound_clamps_to_one() {
        let cfg = DispatchConfig {
            tries_per_candidate: 0,
            ..DispatchConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&cfg).tries_per_candidate, 1);
    }
}
