//! Broker connection lifecycle: one long-lived link, replaced wholesale on
//! every reconnect, with listeners re-run against each new link.

pub mod backoff;
pub mod manager;

pub use backoff::Backoff;
pub use manager::{ConnectionManager, ConnectionState, Link, LinkListener};

use tokio::sync::watch;

/// Resolves once the flag flips to `true` or its sender goes away.
pub(crate) async fn until_stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
