use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use waypoint_core::config::RetryConfig;
use waypoint_core::error::WaypointError;
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::NodeId;

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&WaypointError) -> bool + Send + Sync>;

/// Recovery handler consulted when a node attempt fails.
///
/// Receives the error, the state the node ran against and the 1-based attempt.
pub type ErrorHandler = Arc<dyn Fn(&WaypointError, &WorkflowState, u32) -> ErrorAction + Send + Sync>;

/// What to do about a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorAction {
    /// Absorb the error and continue, optionally merging a fallback update.
    Skip { fallback: Option<StateUpdate> },
    /// Fail the run.
    Abort,
    /// Continue at a node tagged as a recovery target.
    Goto(NodeId),
    /// Try again, after `delay` or the computed backoff.
    Retry { delay: Option<Duration> },
}

impl ErrorAction {
    pub fn skip() -> Self {
        Self::Skip { fallback: None }
    }

    pub fn skip_with(fallback: StateUpdate) -> Self {
        Self::Skip {
            fallback: Some(fallback),
        }
    }

    pub fn retry() -> Self {
        Self::Retry { delay: None }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self::Retry { delay: Some(delay) }
    }

    pub fn goto(target: impl Into<NodeId>) -> Self {
        Self::Goto(target.into())
    }
}

/// Retry policy for a node.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: Option<u64>,
    /// Randomize each delay by 0.8x to 1.2x.
    pub jitter: bool,
    pub retry_on: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff_ms", &self.backoff_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            max_backoff_ms: config.max_backoff_ms,
            jitter: config.jitter,
            retry_on: None,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff_ms: u64, multiplier: f64) -> Self {
        self.backoff_ms = backoff_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = Some(max_backoff_ms);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Only retry errors for which `predicate` returns true.
    pub fn retry_on(
        mut self,
        predicate: impl Fn(&WaypointError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    pub fn should_retry(&self, error: &WaypointError) -> bool {
        // Cancellation is never retried
        if error.is_cancelled() {
            return false;
        }
        match &self.retry_on {
            Some(predicate) => predicate(error),
            None => !matches!(error.root(), WaypointError::SchemaValidation(_)),
        }
    }

    /// Delay after the given (1-based) failed attempt:
    /// `backoff_ms * backoff_multiplier^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let mut ms = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        if let Some(cap) = self.max_backoff_ms {
            ms = ms.min(cap as f64);
        }
        if self.jitter {
            ms *= 0.8 + rand::random::<f64>() * 0.4;
        }
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_cap() {
        let policy = RetryPolicy::default()
            .with_backoff(500, 3.0)
            .with_max_backoff(2000);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default().with_backoff(1000, 1.0).with_jitter(true);
        for _ in 0..20 {
            let ms = policy.delay_for_attempt(1).as_millis();
            assert!((800..=1200).contains(&ms), "delay {ms} out of band");
        }
    }

    #[test]
    fn test_retry_predicate() {
        let policy = RetryPolicy::default().retry_on(|e| e.is_timeout());
        let timeout = WaypointError::Timeout {
            operation: "x".into(),
            timeout_ms: 5,
        };
        assert!(policy.should_retry(&timeout));
        assert!(!policy.should_retry(&WaypointError::NodeExecution("bad".into())));
        assert!(!RetryPolicy::default().should_retry(&WaypointError::Cancelled));
    }

    #[test]
    fn test_schema_errors_not_retried_by_default() {
        let schema = WaypointError::SchemaValidation("node 'a' input: $.x: missing".into());
        assert!(!RetryPolicy::default().should_retry(&schema));
        assert!(RetryPolicy::default().retry_on(|_| true).should_retry(&schema));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }
}
