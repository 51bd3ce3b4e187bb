//! Bounded retry for transient device conditions.
//
// Only frame stalls are treated as transient; everything else aborts the scan.
// The sequencer owns the decision, this module only provides the loop.

use crate::error::DaqError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// The delay between attempts.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff_delay: Duration,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_backoff() -> Duration {
    Duration::from_millis(100)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_delay: default_backoff(),
        }
    }
}

/// Result of a single attempt of a [`Recoverable`] operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The operation completed.
    Done(T),
    /// A transient condition occurred; the operation may be attempted again.
    Transient,
}

/// An asynchronous operation that can hit a transient condition.
///
/// Hard failures are returned as `Err` and are never retried.
#[async_trait]
pub trait Recoverable {
    /// Value produced by a successful attempt.
    type Output: Send;

    /// Run the operation once.
    async fn attempt(&mut self) -> Result<Attempt<Self::Output>, DaqError>;

    /// Short description used in retry logs.
    fn describe(&self) -> String;
}

/// Runs `op` until it completes or `policy.max_attempts` transient outcomes occurred.
///
/// Returns `Ok(None)` when the attempts were exhausted so the caller can pick the
/// error that carries its own context.
pub async fn retry_transient<R: Recoverable + Send>(
    op: &mut R,
    policy: &RetryPolicy,
) -> Result<Option<R::Output>, DaqError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match op.attempt().await? {
            Attempt::Done(value) => return Ok(Some(value)),
            Attempt::Transient if attempt < attempts => {
                warn!(
                    "{} hit a transient condition (attempt {}/{}), retrying in {:?}",
                    op.describe(),
                    attempt,
                    attempts,
                    policy.backoff_delay
                );
                sleep(policy.backoff_delay).await;
            }
            Attempt::Transient => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyOperation {
        attempts: u32,
        succeed_on_attempt: u32,
    }

    #[async_trait]
    impl Recoverable for FlakyOperation {
        type Output = u32;

        async fn attempt(&mut self) -> Result<Attempt<u32>, DaqError> {
            self.attempts += 1;
            if self.attempts >= self.succeed_on_attempt {
                Ok(Attempt::Done(self.attempts))
            } else {
                Ok(Attempt::Transient)
            }
        }

        fn describe(&self) -> String {
            "flaky operation".into()
        }
    }

    struct BrokenOperation {
        attempts: u32,
    }

    #[async_trait]
    impl Recoverable for BrokenOperation {
        type Output = ();

        async fn attempt(&mut self) -> Result<Attempt<()>, DaqError> {
            self.attempts += 1;
            Err(DaqError::Storage("disk full".into()))
        }

        fn describe(&self) -> String {
            "broken operation".into()
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let mut op = FlakyOperation {
            attempts: 0,
            succeed_on_attempt: 2,
        };
        let result = retry_transient(&mut op, &fast_policy(3)).await.unwrap();
        assert_eq!(result, Some(2));
        assert_eq!(op.attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_logic_exhausts() {
        let mut op = FlakyOperation {
            attempts: 0,
            succeed_on_attempt: 4,
        };
        let result = retry_transient(&mut op, &fast_policy(3)).await.unwrap();
        assert_eq!(result, None);
        assert_eq!(op.attempts, 3);
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_retried() {
        let mut op = BrokenOperation { attempts: 0 };
        let result = retry_transient(&mut op, &fast_policy(5)).await;
        assert!(matches!(result, Err(DaqError::Storage(_))));
        assert_eq!(op.attempts, 1);
    }

    #[test]
    fn test_default_allows_one_retry() {
        assert_eq!(RetryPolicy::default().max_attempts, 2);
    }
}
