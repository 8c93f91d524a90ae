//! Heartbeat loop: report liveness and usage, mirror the coordinator's
//! view of our status into the local draining flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use granary_chunkstore::ChunkStore;

use crate::client::CoordinatorClient;

/// Run until shutdown, heartbeating once per period.
pub async fn run(
    client: CoordinatorClient,
    peer_id: String,
    credential: String,
    listen_addr: String,
    store: Arc<ChunkStore>,
    draining: Arc<AtomicBool>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let addresses = vec![listen_addr];
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let used_bytes = match store.total_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(error = %e, "cannot read store usage");
                        continue;
                    }
                };

                match client.heartbeat(&peer_id, &credential, used_bytes, &addresses).await {
                    Ok(ack) => {
                        draining.store(ack.status == "draining", Ordering::Relaxed);
                        tracing::debug!(
                            used_bytes,
                            earned_credits = ack.earned_credits,
                            status = %ack.status,
                            "heartbeat acknowledged"
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("heartbeat loop shutting down");
                return;
            }
        }
    }
}
