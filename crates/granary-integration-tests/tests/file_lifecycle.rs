//! End-to-end file lifecycle: upload, download, delete across real peers.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use granary_coordinator::config::StorageOptions;
use granary_coordinator::distributor::{Distributor, DistributorConfig};
use granary_coordinator::files::FileService;
use granary_db::queries::{assignments, chunks, files, peers};
use granary_integration_tests::{bind_node, coordinator_db, seed_peer_row, TestPeer};
use granary_types::FileStatus;

#[tokio::test]
async fn upload_download_delete_round_trip() {
    let db = coordinator_db();
    let coordinator = Arc::new(bind_node());

    // A small chunk bound forces the upload to split.
    let options = StorageOptions {
        chunk_max_bytes: 16,
        desired_replicas: 2,
        ..StorageOptions::default()
    };

    let peer_a = TestPeer::spawn("peer-a");
    let peer_b = TestPeer::spawn("peer-b");
    seed_peer_row(&db, &peer_a, 1 << 30).await;
    seed_peer_row(&db, &peer_b, 1 << 30).await;

    let (repair_tx, _repair_rx) = mpsc::unbounded_channel();
    let distributor = Arc::new(Distributor::new(
        db.clone(),
        coordinator.clone(),
        DistributorConfig {
            replicas: 2,
            ..DistributorConfig::default()
        },
        repair_tx,
    ));
    let service = FileService::new(db.clone(), coordinator, distributor, options);

    let owner = Uuid::new_v4();
    let data: Vec<u8> = (0..40u8).collect();

    // Upload: 40 bytes over a 16-byte bound makes three chunks.
    let file = service
        .upload_bytes(owner, "numbers.bin", &data)
        .await
        .expect("upload");
    assert_eq!(file.status, FileStatus::Ready);
    assert_eq!(file.chunk_count, 3);

    {
        let conn = db.lock().await;
        let rows = chunks::of_file(&conn, file.file_id).expect("chunks");
        assert_eq!(rows.len(), 3);
        for chunk in &rows {
            assert_eq!(
                assignments::count_active(&conn, chunk.chunk_id).expect("count"),
                2
            );
        }
        // Both peers carry the accounted bytes.
        for id in ["peer-a", "peer-b"] {
            assert!(peers::get(&conn, id).expect("peer").used_bytes > 0);
        }
    }
    assert_eq!(peer_a.store.count().expect("count"), 3);
    assert_eq!(peer_b.store.count().expect("count"), 3);

    // Download reassembles the original plaintext from the peers.
    let (_, downloaded) = service.download(file.file_id).await.expect("download");
    assert_eq!(downloaded, data);

    // Delete: every replica drops, metadata goes with it.
    let report = service.delete(file.file_id).await.expect("delete");
    assert!(report.removed);
    assert_eq!(report.remaining, 0);

    assert_eq!(peer_a.store.count().expect("count"), 0);
    assert_eq!(peer_b.store.count().expect("count"), 0);

    let conn = db.lock().await;
    assert!(files::get(&conn, file.file_id).is_err());
    for id in ["peer-a", "peer-b"] {
        assert_eq!(peers::get(&conn, id).expect("peer").used_bytes, 0);
    }
}
