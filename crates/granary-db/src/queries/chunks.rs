//! Chunk metadata and staging query functions.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use granary_types::Chunk;

use crate::queries::files::parse_uuid;
use crate::{map_insert_err, DbError, Result};

fn chunk_from_row(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    let chunk_id: String = row.get(0)?;
    let file_id: String = row.get(1)?;
    Ok(Chunk {
        chunk_id: parse_uuid(chunk_id, 0)?,
        file_id: parse_uuid(file_id, 1)?,
        chunk_index: row.get::<_, i64>(2)? as u32,
        ciphertext_hash: row.get(3)?,
        ciphertext_size_bytes: row.get::<_, i64>(4)? as u64,
        last_verified_at: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
    })
}

const CHUNK_COLUMNS: &str =
    "chunk_id, file_id, chunk_index, ciphertext_hash, ciphertext_size_bytes, last_verified_at";

/// Insert a chunk row.
///
/// Returns [`DbError::Constraint`] when `(file_id, chunk_index)` already
/// exists.
pub fn insert(conn: &Connection, chunk: &Chunk) -> Result<()> {
    conn.execute(
        "INSERT INTO chunks (chunk_id, file_id, chunk_index, ciphertext_hash,
             ciphertext_size_bytes, last_verified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            chunk.chunk_id.to_string(),
            chunk.file_id.to_string(),
            chunk.chunk_index as i64,
            chunk.ciphertext_hash,
            chunk.ciphertext_size_bytes as i64,
            chunk.last_verified_at.map(|v| v as i64),
        ],
    )
    .map_err(|e| map_insert_err(e, "chunk index already present for file"))?;
    Ok(())
}

/// Fetch a chunk that must exist.
pub fn get(conn: &Connection, chunk_id: Uuid) -> Result<Chunk> {
    conn.query_row(
        &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?1"),
        [chunk_id.to_string()],
        chunk_from_row,
    )
    .optional()?
    .ok_or_else(|| DbError::NotFound(format!("chunk {chunk_id}")))
}

/// All chunks of a file in `chunk_index` order.
pub fn of_file(conn: &Connection, file_id: Uuid) -> Result<Vec<Chunk>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_id = ?1 ORDER BY chunk_index"
    ))?;
    let rows = stmt
        .query_map([file_id.to_string()], chunk_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Stamp a chunk as verified at `at`.
pub fn set_last_verified(conn: &Connection, chunk_id: Uuid, at: u64) -> Result<()> {
    conn.execute(
        "UPDATE chunks SET last_verified_at = ?1 WHERE chunk_id = ?2",
        rusqlite::params![at as i64, chunk_id.to_string()],
    )?;
    Ok(())
}

/// Chunks of non-deleting files whose `active` assignment count is below
/// the replica target, capped at `limit` rows per repair cycle.
pub fn under_replicated(conn: &Connection, replicas: u32, limit: u32) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT c.chunk_id
         FROM chunks c
         JOIN files f ON f.file_id = c.file_id
         WHERE f.status != 'deleting'
           AND (SELECT COUNT(*) FROM chunk_assignments a
                WHERE a.chunk_id = c.chunk_id AND a.state = 'active') < ?1
         ORDER BY c.chunk_id
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![replicas as i64, limit as i64], |row| {
            let id: String = row.get(0)?;
            parse_uuid(id, 0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Staging ciphertext
// ---------------------------------------------------------------------------

/// Store the transient coordinator-side ciphertext copy for a chunk.
pub fn put_staging(conn: &Connection, chunk_id: Uuid, ciphertext: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO chunk_staging (chunk_id, ciphertext) VALUES (?1, ?2)
         ON CONFLICT(chunk_id) DO UPDATE SET ciphertext = excluded.ciphertext",
        rusqlite::params![chunk_id.to_string(), ciphertext],
    )?;
    Ok(())
}

/// Fetch the staging ciphertext, if the transient copy still exists.
pub fn get_staging(conn: &Connection, chunk_id: Uuid) -> Result<Option<Vec<u8>>> {
    let data = conn
        .query_row(
            "SELECT ciphertext FROM chunk_staging WHERE chunk_id = ?1",
            [chunk_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(data)
}

/// Drop the staging copy for one chunk.
pub fn clear_staging(conn: &Connection, chunk_id: Uuid) -> Result<()> {
    conn.execute(
        "DELETE FROM chunk_staging WHERE chunk_id = ?1",
        [chunk_id.to_string()],
    )?;
    Ok(())
}

/// Drop staging copies of every chunk that has reached its replica target.
/// Returns how many rows were released.
pub fn clear_staging_fully_replicated(conn: &Connection, replicas: u32) -> Result<usize> {
    let released = conn.execute(
        "DELETE FROM chunk_staging
         WHERE chunk_id IN (
             SELECT s.chunk_id FROM chunk_staging s
             WHERE (SELECT COUNT(*) FROM chunk_assignments a
                    WHERE a.chunk_id = s.chunk_id AND a.state = 'active') >= ?1
         )",
        [replicas as i64],
    )?;
    Ok(released)
}
