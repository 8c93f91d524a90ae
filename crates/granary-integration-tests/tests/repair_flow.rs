//! Scenarios: replica repair after peer death, and tamper detection.

use std::sync::Arc;

use tokio::sync::mpsc;

use granary_coordinator::config::StorageOptions;
use granary_coordinator::distributor::{Distributor, DistributorConfig};
use granary_coordinator::placement::{self, PlacementRequest};
use granary_coordinator::repairer::Repairer;
use granary_coordinator::{fetch, registry, CoordError};
use granary_db::queries::{assignments, chunks, peers};
use granary_integration_tests::{
    bind_node, coordinator_db, seed_chunk_row, seed_faulty_peer_row, seed_peer_row, Fault,
    FaultyPeer, TestPeer,
};
use granary_types::clock::now_secs;
use granary_types::AssignmentState;

/// R=3, four peers. A chunk lands on three of them; one dies. Within the
/// next repair cycle a new assignment on the remaining peer restores the
/// live replica count to three.
#[tokio::test]
async fn repair_replaces_dead_peer() {
    let db = coordinator_db();
    let coordinator = Arc::new(bind_node());
    let options = StorageOptions {
        desired_replicas: 3,
        ..StorageOptions::default()
    };

    let peers_under_test: Vec<TestPeer> = ["peer-a", "peer-b", "peer-c", "peer-d"]
        .iter()
        .map(|id| TestPeer::spawn(id))
        .collect();
    for peer in &peers_under_test {
        seed_peer_row(&db, peer, 1 << 30).await;
    }

    let payload = b"replicated payload".to_vec();
    let chunk = seed_chunk_row(&db, &payload).await;

    let (repair_tx, repair_rx) = mpsc::unbounded_channel();
    drop(repair_rx);
    let distributor = Arc::new(Distributor::new(
        db.clone(),
        coordinator.clone(),
        DistributorConfig {
            replicas: 3,
            ..DistributorConfig::default()
        },
        repair_tx,
    ));

    // Initial placement: three of the four peers.
    let targets = {
        let conn = db.lock().await;
        placement::plan(
            &conn,
            &PlacementRequest {
                chunk_id: chunk.chunk_id,
                ciphertext_size_bytes: chunk.ciphertext_size_bytes,
                needed: 3,
                now: now_secs(),
                liveness_window_secs: options.liveness_window_secs(),
            },
        )
        .expect("plan")
    };
    let outcome = distributor
        .distribute(&chunk, Arc::new(payload.clone()), &targets)
        .await
        .expect("distribute");
    assert_eq!(outcome.success_count, 3);

    // Repairs must source from replicas, not the upload-time staging copy.
    {
        let conn = db.lock().await;
        chunks::clear_staging(&conn, chunk.chunk_id).expect("clear staging");
    }

    // Stop one of the holders and let its heartbeat go stale.
    let victim_id = {
        let conn = db.lock().await;
        assignments::active_for_chunk(&conn, chunk.chunk_id).expect("active")[0]
            .peer_id
            .clone()
    };
    let victim = peers_under_test
        .iter()
        .find(|p| p.peer_id == victim_id)
        .expect("victim peer");
    victim.stop();
    {
        let conn = db.lock().await;
        let stale = now_secs() - 1000;
        peers::record_heartbeat(&conn, &victim_id, 0, None, stale).expect("stale heartbeat");
        let report = registry::sweep(&conn, now_secs(), options.liveness_window_secs())
            .expect("sweep");
        assert_eq!(report.died, vec![victim_id.clone()]);
        assert_eq!(report.orphaned, 1);
    }

    // One repair cycle restores the target.
    let repairer = Repairer::new(db.clone(), coordinator, distributor, options);
    let report = repairer.repair_cycle().await.expect("repair cycle");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.repaired, 1);

    let conn = db.lock().await;
    let active = assignments::active_for_chunk(&conn, chunk.chunk_id).expect("active");
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|a| a.peer_id != victim_id));

    // The replacement peer genuinely holds the bytes.
    let replacement = peers_under_test
        .iter()
        .find(|p| p.peer_id != victim_id && active.iter().any(|a| a.peer_id == p.peer_id))
        .expect("replacement");
    assert_eq!(replacement.store.get(chunk.chunk_id).expect("get"), payload);
}

/// A peer returning bytes whose hash does not match the chunk's recorded
/// hash is rejected with a hash mismatch and its assignment fails, so the
/// next repair cycle treats the replica as gone.
#[tokio::test]
async fn tampered_replica_is_rejected_and_failed() {
    let db = coordinator_db();
    let coordinator = bind_node();

    let hello_hash = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(b"hello"))
    };
    let tamperer = FaultyPeer::spawn(Fault::TamperedBytes {
        bytes: b"hellp".to_vec(),
        claimed_hash: hello_hash,
    });
    seed_faulty_peer_row(&db, "tamperer", tamperer.addr, 1 << 30).await;

    let chunk = seed_chunk_row(&db, b"hello").await;
    {
        let conn = db.lock().await;
        chunks::clear_staging(&conn, chunk.chunk_id).expect("clear staging");
        let assignment = uuid::Uuid::new_v4();
        assignments::insert_pending(&conn, assignment, chunk.chunk_id, "tamperer", now_secs())
            .expect("assign");
        assignments::set_state(&conn, assignment, AssignmentState::Active).expect("activate");
    }

    let result = fetch::from_replica(
        &db,
        &coordinator,
        &chunk,
        None,
        std::time::Duration::from_secs(5),
    )
    .await;
    assert!(matches!(result, Err(CoordError::NoSource(_))));

    // The unhealthy assignment no longer counts as a replica.
    let conn = db.lock().await;
    let rows = assignments::for_chunk(&conn, chunk.chunk_id).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, AssignmentState::Failed);

    tamperer.stop();
}
