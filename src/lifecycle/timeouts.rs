//! Per-sink timeout wrapping of completion futures.

use futures::future::FutureExt;
use std::time::Duration;
use tracing::debug;

use crate::error::SinkError;
use crate::transport::{CloseFuture, FutureEntry, FutureMap};

/// Wrap every entry with its own sink's declared timeout.
///
/// Each bounded entry gets a dedicated timer task that races the completion
/// future against the bound; the task ends as soon as either fires. On expiry
/// the sink is cancelled and the entry resolves to `CloseTimeout`. Entries
/// with a zero timeout are passed through unchanged.
pub fn with_timeouts(map: &FutureMap) -> FutureMap {
    map.iter().map(wrap_entry).collect()
}

fn wrap_entry(entry: &FutureEntry) -> FutureEntry {
    let bound = entry.transport().timeout();
    if bound.is_zero() || entry.peek().is_some() {
        return entry.clone();
    }

    let transport = entry.transport().clone();
    let inner = entry.future().clone();
    let name = entry.name().to_string();
    let timer = tokio::spawn(async move {
        match tokio::time::timeout(bound, inner).await {
            Ok(result) => result,
            Err(_) => {
                debug!(sink = %name, timeout_ms = bound.as_millis() as u64, "close timed out; cancelling sink");
                transport.cancel();
                Err(SinkError::CloseTimeout {
                    sink: name,
                    timeout: bound,
                })
            }
        }
    });
    let abort = timer.abort_handle();

    let name = entry.name().to_string();
    let future: CloseFuture = timer
        .map(move |joined| match joined {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(SinkError::Cancelled { sink: name }),
            Err(_) => Err(SinkError::Aborted { sink: name }),
        })
        .boxed()
        .shared();

    FutureEntry::with_timer(entry.transport().clone(), future, abort)
}

/// Human form of a bound for user-facing messages.
pub fn describe(bound: Duration) -> String {
    if bound.as_millis() < 1000 {
        format!("{}ms", bound.as_millis())
    } else {
        format!("{}s", bound.as_secs())
    }
}
