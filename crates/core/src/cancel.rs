//! Cancellation helpers
//!
//! Every blocking step of a bucket operation races the caller's
//! [`CancellationToken`], so a canceled context is observed at the next await
//! point rather than at the next loop iteration.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Fail fast if the context is already canceled
pub fn ensure_active(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        Err(Error::Canceled)
    } else {
        Ok(())
    }
}

/// Run `fut` to completion unless `ctx` is canceled first
pub async fn cancellable<T, F>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Canceled),
        res = fut => res,
    }
}
