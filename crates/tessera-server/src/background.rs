//! Background tasks for the Tessera server.

use std::sync::Arc;

use tessera_replication::Pusher;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Starts the replication push task.
///
/// Every `interval_secs` the pusher sends each active peer its next batch
/// of local associations. Returns when `shutdown` is cancelled.
pub async fn start_push_task(pusher: Arc<Pusher>, interval_secs: u64, shutdown: CancellationToken) {
    if interval_secs == 0 {
        tracing::warn!("replication push task disabled (push_interval_secs=0)");
        return;
    }
    let interval = Duration::from_secs(interval_secs);
    tracing::info!(interval_secs, "starting replication push task");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(interval) => {}
        }

        if let Err(e) = pusher.push_all(&shutdown).await {
            tracing::error!(error = %e, "replication push round failed");
        }
    }
    tracing::info!("replication push task stopped");
}
