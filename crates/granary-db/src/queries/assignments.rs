//! Chunk assignment query functions.
//!
//! The partial unique index on `(chunk_id, peer_id) WHERE state != 'deleted'`
//! is the ordering spine for concurrent placement: whichever of two racing
//! writers loses the insert sees [`DbError::Constraint`] and skips the peer.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use granary_types::{AssignmentState, ChunkAssignment};

use crate::queries::files::parse_uuid;
use crate::{map_insert_err, DbError, Result};

fn assignment_from_row(row: &rusqlite::Row) -> rusqlite::Result<ChunkAssignment> {
    let assignment_id: String = row.get(0)?;
    let chunk_id: String = row.get(1)?;
    let state: String = row.get(3)?;
    Ok(ChunkAssignment {
        assignment_id: parse_uuid(assignment_id, 0)?,
        chunk_id: parse_uuid(chunk_id, 1)?,
        peer_id: row.get(2)?,
        state: state.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

const ASSIGNMENT_COLUMNS: &str = "assignment_id, chunk_id, peer_id, state, created_at";

/// Create a `pending` assignment binding a chunk to a peer.
///
/// Returns [`DbError::Constraint`] if a non-deleted assignment already binds
/// this pair; callers treat that as a benign skip.
pub fn insert_pending(
    conn: &Connection,
    assignment_id: Uuid,
    chunk_id: Uuid,
    peer_id: &str,
    now: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO chunk_assignments (assignment_id, chunk_id, peer_id, state, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        rusqlite::params![
            assignment_id.to_string(),
            chunk_id.to_string(),
            peer_id,
            now as i64,
        ],
    )
    .map_err(|e| map_insert_err(e, "peer already assigned this chunk"))?;
    Ok(())
}

/// Move an assignment to a new state.
pub fn set_state(conn: &Connection, assignment_id: Uuid, state: AssignmentState) -> Result<()> {
    let updated = conn.execute(
        "UPDATE chunk_assignments SET state = ?1 WHERE assignment_id = ?2",
        rusqlite::params![state.as_str(), assignment_id.to_string()],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("assignment {assignment_id}")));
    }
    Ok(())
}

/// Fetch an assignment that must exist.
pub fn get(conn: &Connection, assignment_id: Uuid) -> Result<ChunkAssignment> {
    conn.query_row(
        &format!("SELECT {ASSIGNMENT_COLUMNS} FROM chunk_assignments WHERE assignment_id = ?1"),
        [assignment_id.to_string()],
        assignment_from_row,
    )
    .optional()?
    .ok_or_else(|| DbError::NotFound(format!("assignment {assignment_id}")))
}

/// The non-deleted assignment binding `(chunk, peer)`, if any.
pub fn find_live(conn: &Connection, chunk_id: Uuid, peer_id: &str) -> Result<Option<ChunkAssignment>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM chunk_assignments
                 WHERE chunk_id = ?1 AND peer_id = ?2 AND state != 'deleted'"
            ),
            rusqlite::params![chunk_id.to_string(), peer_id],
            assignment_from_row,
        )
        .optional()?;
    Ok(row)
}

/// Every assignment of a chunk, any state.
pub fn for_chunk(conn: &Connection, chunk_id: Uuid) -> Result<Vec<ChunkAssignment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM chunk_assignments
         WHERE chunk_id = ?1 ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([chunk_id.to_string()], assignment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A chunk's `active` assignments.
pub fn active_for_chunk(conn: &Connection, chunk_id: Uuid) -> Result<Vec<ChunkAssignment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM chunk_assignments
         WHERE chunk_id = ?1 AND state = 'active' ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([chunk_id.to_string()], assignment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Live replica count of a chunk.
pub fn count_active(conn: &Connection, chunk_id: Uuid) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chunk_assignments WHERE chunk_id = ?1 AND state = 'active'",
        [chunk_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// Peer ids holding this chunk in any non-deleted state; placement excludes
/// them when picking repair targets.
pub fn holders(conn: &Connection, chunk_id: Uuid) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT peer_id FROM chunk_assignments
         WHERE chunk_id = ?1 AND state != 'deleted'",
    )?;
    let rows = stmt
        .query_map([chunk_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Per-peer count of non-deleted assignments, the placement workload signal.
pub fn live_workload_by_peer(conn: &Connection) -> Result<HashMap<String, u64>> {
    let mut stmt = conn.prepare(
        "SELECT peer_id, COUNT(*) FROM chunk_assignments
         WHERE state != 'deleted' GROUP BY peer_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Move a dead peer's `active` assignments to `orphaned`; the repairer then
/// sees those replicas as missing. Returns how many rows moved.
pub fn orphan_for_peer(conn: &Connection, peer_id: &str) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE chunk_assignments SET state = 'orphaned'
         WHERE peer_id = ?1 AND state = 'active'",
        [peer_id],
    )?;
    Ok(moved)
}

/// Tombstone a chunk's `failed` assignments so their peers become
/// placeable again. Failed edges never counted toward `used_bytes`, so no
/// bookkeeping is released. Returns how many rows moved.
pub fn tombstone_failed(conn: &Connection, chunk_id: Uuid) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE chunk_assignments SET state = 'deleted'
         WHERE chunk_id = ?1 AND state = 'failed'",
        [chunk_id.to_string()],
    )?;
    Ok(moved)
}

/// Tombstone `pending` assignments created before `cutoff`. A distribute
/// call that was cancelled mid-flight leaves its pending row behind; left
/// alone it would exclude the peer from placement forever.
pub fn tombstone_stale_pending(conn: &Connection, chunk_id: Uuid, cutoff: u64) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE chunk_assignments SET state = 'deleted'
         WHERE chunk_id = ?1 AND state = 'pending' AND created_at < ?2",
        rusqlite::params![chunk_id.to_string(), cutoff as i64],
    )?;
    Ok(moved)
}

/// Active-assignment ciphertext bytes per peer, the economics storage
/// snapshot.
pub fn active_storage_by_peer(conn: &Connection) -> Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT a.peer_id, COALESCE(SUM(c.ciphertext_size_bytes), 0)
         FROM chunk_assignments a
         JOIN chunks c ON c.chunk_id = a.chunk_id
         WHERE a.state = 'active'
         GROUP BY a.peer_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_chunk, seed_file, seed_peer, test_db};

    #[test]
    fn test_pending_to_active_lifecycle() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 100);
        seed_peer(&conn, "p1");

        let id = Uuid::new_v4();
        insert_pending(&conn, id, chunk.chunk_id, "p1", 500).expect("insert");
        assert_eq!(get(&conn, id).expect("get").state, AssignmentState::Pending);
        assert_eq!(count_active(&conn, chunk.chunk_id).expect("count"), 0);

        set_state(&conn, id, AssignmentState::Active).expect("activate");
        assert_eq!(count_active(&conn, chunk.chunk_id).expect("count"), 1);
    }

    #[test]
    fn test_duplicate_live_assignment_conflicts() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 100);
        seed_peer(&conn, "p1");

        insert_pending(&conn, Uuid::new_v4(), chunk.chunk_id, "p1", 500).expect("first");
        let err = insert_pending(&conn, Uuid::new_v4(), chunk.chunk_id, "p1", 501).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_deleted_assignment_allows_reassignment() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 100);
        seed_peer(&conn, "p1");

        let first = Uuid::new_v4();
        insert_pending(&conn, first, chunk.chunk_id, "p1", 500).expect("first");
        set_state(&conn, first, AssignmentState::Deleted).expect("delete");

        // The pair is free again once the old edge is deleted.
        insert_pending(&conn, Uuid::new_v4(), chunk.chunk_id, "p1", 600).expect("second");
    }

    #[test]
    fn test_holders_ignores_deleted() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk = seed_chunk(&conn, file.file_id, 0, 100);
        seed_peer(&conn, "p1");
        seed_peer(&conn, "p2");

        let a1 = Uuid::new_v4();
        insert_pending(&conn, a1, chunk.chunk_id, "p1", 500).expect("a1");
        let a2 = Uuid::new_v4();
        insert_pending(&conn, a2, chunk.chunk_id, "p2", 500).expect("a2");
        set_state(&conn, a2, AssignmentState::Deleted).expect("delete");

        let held = holders(&conn, chunk.chunk_id).expect("holders");
        assert_eq!(held, vec!["p1".to_string()]);
    }

    #[test]
    fn test_orphan_for_peer() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk_a = seed_chunk(&conn, file.file_id, 0, 100);
        let chunk_b = seed_chunk(&conn, file.file_id, 1, 100);
        seed_peer(&conn, "p1");

        for chunk_id in [chunk_a.chunk_id, chunk_b.chunk_id] {
            let id = Uuid::new_v4();
            insert_pending(&conn, id, chunk_id, "p1", 500).expect("insert");
            set_state(&conn, id, AssignmentState::Active).expect("activate");
        }

        assert_eq!(orphan_for_peer(&conn, "p1").expect("orphan"), 2);
        assert_eq!(count_active(&conn, chunk_a.chunk_id).expect("count"), 0);
        let state = find_live(&conn, chunk_a.chunk_id, "p1")
            .expect("find")
            .expect("live row")
            .state;
        assert_eq!(state, AssignmentState::Orphaned);
    }

    #[test]
    fn test_workload_and_storage_aggregates() {
        let conn = test_db();
        let file = seed_file(&conn);
        let chunk_a = seed_chunk(&conn, file.file_id, 0, 300);
        let chunk_b = seed_chunk(&conn, file.file_id, 1, 200);
        seed_peer(&conn, "p1");

        let a1 = Uuid::new_v4();
        insert_pending(&conn, a1, chunk_a.chunk_id, "p1", 500).expect("a1");
        set_state(&conn, a1, AssignmentState::Active).expect("activate");
        insert_pending(&conn, Uuid::new_v4(), chunk_b.chunk_id, "p1", 500).expect("a2");

        let workload = live_workload_by_peer(&conn).expect("workload");
        assert_eq!(workload.get("p1"), Some(&2));

        // Only the active assignment counts toward stored bytes.
        let storage = active_storage_by_peer(&conn).expect("storage");
        assert_eq!(storage, vec![("p1".to_string(), 300)]);
    }
}
