//! Cancellable fixed-interval polling.
//!
//! Used by provider families that expose task creation plus status polling
//! instead of a native stream.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Result of one poll attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Marker returned when the token fires while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCancelled;

/// Run `attempt` every `interval` until it yields `Ready` or an error.
///
/// Cancellation is checked before each attempt, raced against each attempt and
/// against every sleep, so a cancelled token wins within one tick. The first
/// attempt runs immediately.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, E>
where
    E: From<PollCancelled>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, E>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(PollCancelled.into());
        }

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollCancelled.into()),
            status = attempt() => status?,
        };

        if let PollStatus::Ready(value) = status {
            return Ok(value);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollCancelled.into()),
            () = tokio::time::sleep(interval) => {}
        }
    }
}
