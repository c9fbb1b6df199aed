//! Retry policy: exponential backoff with jitter, gated on HTTP method
//! idempotency rather than error type.
//!
//! Unlike a generic RPC client, this gateway must never retry a request whose
//! body may have already been partially or fully consumed by the backend —
//! so retry eligibility is decided once, up front, from the method and body
//! mode, not by inspecting the failure afterwards.

use std::future::Future;
use std::time::Duration;

use axum::http::Method;
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::config::ProxyConfig;

/// Whether a method's semantics allow the gateway to safely re-issue the
/// request on failure: `GET`, `HEAD`, `OPTIONS` only. Methods with side
/// effects are never retried, because the body stream may be unreplayable in
/// Streamed mode.
#[must_use]
pub fn is_idempotent_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Execute `f` with retry, up to `config.max_retry_attempts` total attempts,
/// only when `retryable` is true. Returns the last error (paired with the
/// attempt count) if every attempt fails.
pub async fn with_retry<F, Fut, T, E>(
    config: &ProxyConfig,
    retryable: bool,
    name: &str,
    mut f: F,
) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if !retryable {
        return f().await.map_err(|e| (e, 1));
    }

    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(config.retry_backoff_base)
        .with_max_delay(config.retry_backoff_cap)
        .with_max_times(config.max_retry_attempts.saturating_sub(1) as usize)
        .with_jitter()
        .build();

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let Some(delay) = next_delay(&mut backoff) else {
                    debug!(operation = name, attempts, "retry attempts exhausted");
                    return Err((e, attempts));
                };
                debug!(operation = name, attempt = attempts, delay_ms = delay.as_millis(), "retrying after backoff");
                sleep(delay).await;
            }
        }
    }
}

fn next_delay(backoff: &mut impl Iterator<Item = Duration>) -> Option<Duration> {
    backoff.next()
}
