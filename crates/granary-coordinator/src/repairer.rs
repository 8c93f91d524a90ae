//! Replication repair: restore every chunk to its replica target.
//!
//! A long-running loop that scans for chunks whose `active` assignment
//! count is below target, sources their ciphertext (live replica first,
//! staging copy as the upload-window fallback), asks the planner for fresh
//! peers, and hands the transfer to the distributor. The uniqueness
//! constraint on `(chunk_id, peer_id)` makes concurrent repair of the same
//! chunk idempotent: the second writer hits the constraint and skips.
//!
//! Between scans the loop also drains nudges pushed by the distributor
//! whenever an upload lands short of target.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use granary_db::queries::{assignments, chunks};
use granary_transport::quic::QuicNode;
use granary_types::clock::now_secs;

use crate::config::StorageOptions;
use crate::distributor::Distributor;
use crate::placement::{self, PlacementRequest};
use crate::{fetch, CoordError, Db, Result};

/// Pause between chunks within one cycle, to avoid a repair storm.
const INTER_CHUNK_PAUSE: Duration = Duration::from_millis(100);

/// Per-attempt deadline when sourcing ciphertext from a replica.
const SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending assignments older than this are leftovers of a cancelled
/// transfer and get tombstoned before planning.
const STALE_PENDING_SECS: u64 = 3600;

/// Summary of one repair cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleReport {
    /// Under-replicated chunks examined.
    pub scanned: usize,
    /// Chunks brought closer to target.
    pub repaired: usize,
    /// Staging copies released after reaching target.
    pub staging_released: usize,
}

/// The replication repairer.
pub struct Repairer {
    db: Db,
    node: Arc<QuicNode>,
    distributor: Arc<Distributor>,
    options: StorageOptions,
}

impl Repairer {
    pub fn new(
        db: Db,
        node: Arc<QuicNode>,
        distributor: Arc<Distributor>,
        options: StorageOptions,
    ) -> Self {
        Self {
            db,
            node,
            distributor,
            options,
        }
    }

    /// Run until shutdown: periodic scans plus distributor nudges.
    pub async fn run(
        self,
        mut nudges: mpsc::UnboundedReceiver<Uuid>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.options.repair_period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.repair_cycle().await {
                        Ok(report) if report.scanned > 0 => {
                            tracing::info!(
                                scanned = report.scanned,
                                repaired = report.repaired,
                                staging_released = report.staging_released,
                                "repair cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "repair cycle failed"),
                    }
                }
                Some(chunk_id) = nudges.recv() => {
                    if let Err(e) = self.repair_chunk(chunk_id).await {
                        tracing::warn!(%chunk_id, error = %e, "nudged repair failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("repairer shutting down");
                    return;
                }
            }
        }
    }

    /// One scan over the under-replicated set, bounded by the batch cap.
    pub async fn repair_cycle(&self) -> Result<CycleReport> {
        let shortfall = {
            let conn = self.db.lock().await;
            chunks::under_replicated(
                &conn,
                self.options.desired_replicas,
                self.options.repair_batch_max,
            )?
        };

        let mut report = CycleReport {
            scanned: shortfall.len(),
            ..CycleReport::default()
        };

        for chunk_id in shortfall {
            match self.repair_chunk(chunk_id).await {
                Ok(()) => report.repaired += 1,
                Err(CoordError::InsufficientCapacity { needed, eligible }) => {
                    tracing::debug!(%chunk_id, needed, eligible, "no eligible repair targets");
                }
                Err(e) => tracing::warn!(%chunk_id, error = %e, "chunk repair failed"),
            }
            tokio::time::sleep(INTER_CHUNK_PAUSE).await;
        }

        report.staging_released = {
            let conn = self.db.lock().await;
            chunks::clear_staging_fully_replicated(&conn, self.options.desired_replicas)?
        };

        Ok(report)
    }

    /// Bring one chunk back toward its replica target.
    pub async fn repair_chunk(&self, chunk_id: Uuid) -> Result<()> {
        let now = now_secs();
        let (chunk, needed) = {
            let conn = self.db.lock().await;
            // Free up peers whose earlier transfer failed or whose pending
            // edge was abandoned before planning.
            assignments::tombstone_failed(&conn, chunk_id)?;
            assignments::tombstone_stale_pending(
                &conn,
                chunk_id,
                now.saturating_sub(STALE_PENDING_SECS),
            )?;

            let chunk = chunks::get(&conn, chunk_id)?;
            let live = assignments::count_active(&conn, chunk_id)?;
            let target = self.options.desired_replicas;
            if live >= target {
                return Ok(());
            }
            (chunk, (target - live) as usize)
        };

        let ciphertext = self.source_ciphertext(&chunk).await?;

        let targets = {
            let conn = self.db.lock().await;
            placement::plan(
                &conn,
                &PlacementRequest {
                    chunk_id: chunk.chunk_id,
                    ciphertext_size_bytes: chunk.ciphertext_size_bytes,
                    needed,
                    now: now_secs(),
                    liveness_window_secs: self.options.liveness_window_secs(),
                },
            )?
        };

        let outcome = self
            .distributor
            .distribute(&chunk, Arc::new(ciphertext), &targets)
            .await?;

        tracing::info!(
            %chunk_id,
            needed,
            stored = outcome.success_count,
            "chunk repaired"
        );
        Ok(())
    }

    /// Source a chunk's ciphertext: live replicas first, then the staging
    /// copy that exists only between upload and full replication.
    async fn source_ciphertext(&self, chunk: &granary_types::Chunk) -> Result<Vec<u8>> {
        match fetch::from_replica(&self.db, &self.node, chunk, None, SOURCE_TIMEOUT).await {
            Ok(fetched) => Ok(fetched.bytes),
            Err(CoordError::NoSource(_)) => {
                let conn = self.db.lock().await;
                chunks::get_staging(&conn, chunk.chunk_id)?
                    .ok_or(CoordError::NoSource(chunk.chunk_id))
            }
            Err(e) => Err(e),
        }
    }
}
