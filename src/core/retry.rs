//! Retry policy for transient pipeline outcomes
//!
//! Only admission timeouts are retried automatically. Precondition and
//! tool failures are terminal until someone asks for a retry.

use std::time::Duration;

use backoff::backoff::{Backoff, Constant};

use crate::core::pipeline::{FailureKind, PipelineOutcome};

/// Whether and when to retry a pipeline outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between attempts
    pub backoff: Duration,
    /// Automatic attempts allowed; `None` is unbounded
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(crate::config::defaults::RETRY_BACKOFF_SECS),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            backoff,
            max_attempts,
        }
    }

    /// Whether `outcome` is the kind of result worth retrying
    pub fn is_retryable(outcome: &PipelineOutcome) -> bool {
        match outcome {
            PipelineOutcome::RetryLater => true,
            PipelineOutcome::Failed { kind, .. } => match kind {
                FailureKind::Precondition | FailureKind::Tool => false,
            },
            PipelineOutcome::Completed
            | PipelineOutcome::Deferred
            | PipelineOutcome::Skipped => false,
        }
    }

    /// Delay before attempt `attempt + 1`, or `None` when the budget is spent
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        Constant::new(self.backoff).next_backoff()
    }
}
