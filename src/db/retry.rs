use std::future::Future;

use tracing::warn;

use super::StoreError;
use crate::config::StoreOptions;
use crate::context::RequestContext;

/// Run a store read with a per-attempt timeout and bounded exponential backoff.
///
/// Only transient failures are retried. Cancellation is checked before every
/// attempt and interrupts both the query and the backoff sleep.
pub async fn with_retry<T, F, Fut>(
    ctx: &RequestContext,
    options: &StoreOptions,
    operation: &'static str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = options.retry_attempts.max(1);
    let mut backoff = options.retry_initial_backoff;

    for attempt in 1..=attempts {
        if ctx.is_canceled() {
            return Err(StoreError::Canceled);
        }

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(StoreError::Canceled),
            outcome = tokio::time::timeout(options.query_timeout, f()) => outcome,
        };

        let err = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => StoreError::Timeout(options.query_timeout),
        };

        if !err.is_transient() {
            return Err(err);
        }

        if attempt == attempts {
            return Err(StoreError::Unavailable {
                operation,
                attempts,
                last: err.to_string(),
            });
        }

        warn!(
            operation,
            attempt,
            max_attempts = attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Retrying store read"
        );

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(StoreError::Canceled),
            _ = tokio::time::sleep(backoff) => {}
        }

        backoff = (backoff * 2).min(options.retry_max_backoff);
    }

    Err(StoreError::Unavailable {
        operation,
        attempts,
        last: "no attempt made".to_string(),
    })
}
