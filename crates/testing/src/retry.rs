//! Retrying template clones while other sessions hold the template open.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::database::TestDatabase;
use crate::{TestError, TestResult};

/// SQLSTATE `object_in_use`
pub const OBJECT_IN_USE: &str = "55006";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay after the given failed attempt (1-based), doubling up to `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// How a test database was obtained from a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CloneStrategy {
    Template { attempts: u32 },
    /// Template stayed busy; a fresh database was migrated instead
    Fallback { attempts: u32 },
}

#[derive(Debug)]
pub struct CloneOutcome {
    pub database: TestDatabase,
    pub strategy: CloneStrategy,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Whether a server error means "someone else is connected to that database"
pub fn is_contention(code: Option<&str>, message: &str) -> bool {
    code == Some(OBJECT_IN_USE) || message.contains("is being accessed by other users")
}

pub(crate) fn is_contention_error(error: &sqlx::Error) -> bool {
    match error.as_database_error() {
        Some(db) => is_contention(db.code().as_deref(), db.message()),
        None => false,
    }
}

/// Run `op` until it succeeds, fails with something other than
/// [`TestError::TemplateBusy`], or the policy runs out of attempts.
pub async fn retry_on_contention<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> TestResult<RetryOutcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TestResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(RetryOutcome::Succeeded { value, attempts: attempt }),
            Err(TestError::TemplateBusy { template, message }) => {
                debug!(
                    "Template {} busy on attempt {}/{}: {}",
                    template, attempt, max_attempts, message
                );
                if attempt < max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(RetryOutcome::Exhausted {
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn busy() -> TestError {
        TestError::TemplateBusy {
            template: "pgfast_test_template".to_string(),
            message: "source database is being accessed by other users".to_string(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for(6), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(7), Duration::from_secs(2));
        assert_eq!(policy.delay_for(40), Duration::from_secs(2));
    }

    #[test]
    fn test_contention_classification() {
        assert!(is_contention(Some("55006"), "anything"));
        assert!(is_contention(
            None,
            "source database \"tpl\" is being accessed by other users"
        ));
        assert!(!is_contention(Some("42P04"), "database \"x\" already exists"));
        assert!(!is_contention(None, "connection refused"));
    }

    #[test]
    fn test_succeeds_after_contention() {
        let calls = Cell::new(0);
        let outcome = tokio_test::block_on(retry_on_contention(&fast_policy(5), |attempt| {
            calls.set(calls.get() + 1);
            async move {
                if attempt < 3 {
                    Err(busy())
                } else {
                    Ok("cloned")
                }
            }
        }))
        .unwrap();

        assert_eq!(outcome, RetryOutcome::Succeeded { value: "cloned", attempts: 3 });
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhausts_attempts() {
        let calls = Cell::new(0);
        let outcome: RetryOutcome<()> = tokio_test::block_on(retry_on_contention(&fast_policy(4), |_| {
            calls.set(calls.get() + 1);
            async { Err(busy()) }
        }))
        .unwrap();

        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 4 });
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_other_errors_propagate_immediately() {
        let calls = Cell::new(0);
        let result: TestResult<RetryOutcome<()>> = tokio_test::block_on(retry_on_contention(&fast_policy(5), |_| {
            calls.set(calls.get() + 1);
            async { Err(TestError::InvalidName("bad name".to_string())) }
        }));

        assert!(matches!(result, Err(TestError::InvalidName(_))));
        assert_eq!(calls.get(), 1);
    }
}
