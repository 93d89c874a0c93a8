use greentic_backup_spec::{Error, Result, ServiceError, ServiceResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounds applied to every external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for a single external call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy without backoff delay, mostly useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Exponential backoff for the pause after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Bound a single external call by `timeout`. An elapsed deadline is an
/// ambiguous outcome and reported as [`ServiceError::Timeout`].
pub async fn call_with_timeout<F, T>(timeout: Duration, fut: F) -> ServiceResult<T>
where
    F: Future<Output = ServiceResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout),
    }
}

/// Retry `op` while it fails with a retryable error.
///
/// Non-retryable errors are returned unchanged. When the attempt budget runs
/// out the last error is wrapped in [`Error::ReconciliationFailed`].
pub async fn retry_async<F, Fut, T>(policy: &RetryPolicy, entity: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= max_attempts => {
                return Err(Error::ReconciliationFailed {
                    entity: entity.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    entity = %entity,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Answer to a create request sent through [`create_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Created<T> {
    New(T),
    /// The service already holds the entity. `after_retry` is set when an
    /// earlier attempt failed ambiguously, so the entity may be our own.
    Existing { after_retry: bool },
}

/// Retry a create call, reporting `AlreadyExists` as [`Created::Existing`]
/// instead of an error so callers can look the entity up and adopt it.
pub(crate) async fn create_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &'static str,
    entity: &str,
    mut call: F,
) -> Result<Created<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut attempts = 0u32;
    retry_async(policy, entity, || {
        attempts += 1;
        let after_retry = attempts > 1;
        let fut = call();
        async move {
            match call_with_timeout(policy.call_timeout, fut).await {
                Ok(value) => Ok(Created::New(value)),
                Err(ServiceError::AlreadyExists { .. }) => Ok(Created::Existing { after_retry }),
                Err(err) => Err(Error::from_service(err, operation, entity)),
            }
        }
    })
    .await
}
