use binlog_pitr_core::PitrError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry for `TransientIo` at the point of occurrence.
///
/// Any other error kind is returned immediately. Once attempts are exhausted
/// the last transient error is escalated to `Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Default::default()
        }
    }

    /// Sleep before attempt number `attempt` (1-based retry count).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, op: &str, last: PitrError) -> PitrError {
        PitrError::Fatal(format!(
            "{}: giving up after {} attempts: {}",
            op, self.max_attempts, last
        ))
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, PitrError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PitrError>>,
    {
        let mut attempt = 1u32;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        target: "retry",
                        op = %op,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => return Err(self.exhausted(op, e)),
                Err(e) => return Err(e),
            }
        }
    }
}
