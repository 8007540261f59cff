//! Bounded retry for discrete store operations.
//!
//! Count, fetch and resolve calls go through [`with_retry`]. Retryable
//! failures (see [`StoreError::is_retryable`]) are retried with a delay of
//! `base_delay * attempt^2`; anything else propagates immediately.
//!
//! ```ignore
//! let count = retry::with_retry("count shop.orders", 5, base, &token, || {
//!     source.count("shop", "orders")
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use docsync_store::StoreError;
use tokio_util::sync::CancellationToken;

/// Runs `op` up to `attempts` times.
///
/// A cancelled `token` ends the wait between attempts early; the last
/// error is then returned and the caller is expected to check the token.
///
/// # Errors
///
/// Returns the last [`StoreError`] once attempts are exhausted, on the
/// first non-retryable failure, or when cancelled while waiting.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    attempts: u32,
    base_delay: Duration,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = base_delay.saturating_mul(attempt * attempt);
                log::warn!("{label}: {e} (attempt {attempt}/{attempts}), retrying in {delay:?}");
                if !sleep_or_cancel(delay, token).await {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sleeps for `delay` unless `token` fires first. Returns `false` if
/// cancelled.
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
