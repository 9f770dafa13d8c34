//! Waiting for content that is still being written.

use std::time::Duration;

use courier_core::ContentReference;
use tracing::debug;

use super::{ContentTransport, WaitPolicy};
use crate::error::ContentIoError;

/// Polls `transport` every `interval` until `reference` reaches its
/// expected size.
///
/// Returns immediately when the policy does not wait or the reference has no
/// `size`. Missing content counts as not yet available. Cancelling the
/// policy's token ends the wait without an error so the caller reads what is
/// currently present.
///
/// # Errors
///
/// Returns any probe error other than not-found.
pub async fn wait_until_available<T>(
    transport: &T,
    reference: &ContentReference,
    wait: &WaitPolicy,
    interval: Duration,
) -> Result<(), ContentIoError>
where
    T: ContentTransport + ?Sized,
{
    let (Some(token), Some(expected)) = (wait.token(), reference.size) else {
        return Ok(());
    };

    loop {
        let observed = match transport.size(reference).await {
            Ok(size) => size,
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        if observed.is_some_and(|size| size >= expected) {
            return Ok(());
        }

        tokio::select! {
            () = token.cancelled() => {
                debug!(uri = %reference.uri, ?observed, expected, "availability wait cancelled");
                return Ok(());
            }
            () = tokio::time::sleep(interval) => {}
        }
    }
}
