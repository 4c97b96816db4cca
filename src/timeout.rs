//! Racing an operation against a deadline
//!
//! The losing side is dropped: a timed out operation is cancelled at its
//! next await point, and a finished operation cancels the timer. Dropping
//! an operation does not stop any process it started; callers clean up.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, TunnelError};

/// Run `operation`, failing with [`TunnelError::Timeout`] after `limit`
pub async fn race<F, T>(operation: F, limit: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::Timeout(limit)),
    }
}

/// Like [`race`], but also gives up with [`TunnelError::Cancelled`] when `cancel` fires
pub async fn race_cancellable<F, T>(
    operation: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        result = race(operation, limit) => result,
    }
}

/// Sleep that wakes early (with `Cancelled`) when `cancel` fires
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
