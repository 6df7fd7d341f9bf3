//! Retry Wrapper for flaky, idempotent external operations.
//!
//! The delay between attempts is constant. Every non-zero outcome is retried;
//! no attempt is made to tell permanent failures from transient ones.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepwright_config::RetryConfig;
use stepwright_utils::AuditLog;

/// Attempt bound and constant sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (`>= 1`)
    pub max_attempts: u32,
    /// Sleep after each failed attempt that is not the last
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    /// Five attempts, ten seconds apart.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.backoff_ms))
    }
}

/// Run `op` until it returns `0` or `policy.max_attempts` attempts are spent.
///
/// `op` receives the 1-based attempt number and resolves to an outcome code.
/// Each failed attempt that still has a successor writes one `WARN` record
/// naming `label` and the attempt number; exhausting the budget writes
/// nothing more and returns `false`. The caller decides whether that is fatal.
///
/// Once `cancel` fires no further attempt starts and no `WARN` is written; the
/// backoff sleep is cut short.
pub async fn with_retries<F, Fut>(
    log: &AuditLog,
    label: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> bool
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = i32>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            debug!(label, attempt, "cancelled before attempt");
            break;
        }
        let code = op(attempt).await;
        if code == 0 {
            debug!(label, attempt, "operation succeeded");
            return true;
        }
        if attempt == max_attempts {
            debug!(label, attempt, code, "retry budget exhausted");
            break;
        }
        if cancel.is_cancelled() {
            debug!(label, attempt, code, "cancelled, not retrying");
            break;
        }

        let message = format!(
            "{label} failed with code {code} (attempt {attempt} of {max_attempts}), retrying in {}",
            humanize(policy.backoff)
        );
        if let Err(e) = log.warn(&message) {
            warn!(error = %e, "could not record retry warning");
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(policy.backoff) => {}
        }
    }
    false
}

fn humanize(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
