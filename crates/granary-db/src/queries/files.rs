//! File metadata query functions.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use granary_types::{File, FileStatus};

use crate::{DbError, Result};

fn file_from_row(row: &rusqlite::Row) -> rusqlite::Result<File> {
    let file_id: String = row.get(0)?;
    let owner_id: String = row.get(1)?;
    let status: String = row.get(6)?;
    Ok(File {
        file_id: parse_uuid(file_id, 0)?,
        owner_id: parse_uuid(owner_id, 1)?,
        logical_name: row.get(2)?,
        plaintext_size_bytes: row.get::<_, i64>(3)? as u64,
        chunk_count: row.get::<_, i64>(4)? as u32,
        encryption_key: row.get(5)?,
        status: status.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: row.get::<_, i64>(7)? as u64,
    })
}

pub(crate) fn parse_uuid(value: String, column: usize) -> rusqlite::Result<Uuid> {
    value.parse().map_err(|e: uuid::Error| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

const FILE_COLUMNS: &str = "file_id, owner_id, logical_name, plaintext_size_bytes, \
     chunk_count, encryption_key, status, created_at";

/// Insert a new file in `uploading` state.
pub fn insert(conn: &Connection, file: &File) -> Result<()> {
    conn.execute(
        "INSERT INTO files (file_id, owner_id, logical_name, plaintext_size_bytes,
             chunk_count, encryption_key, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            file.file_id.to_string(),
            file.owner_id.to_string(),
            file.logical_name,
            file.plaintext_size_bytes as i64,
            file.chunk_count as i64,
            file.encryption_key,
            file.status.as_str(),
            file.created_at as i64,
        ],
    )?;
    Ok(())
}

/// Fetch a file that must exist.
pub fn get(conn: &Connection, file_id: Uuid) -> Result<File> {
    conn.query_row(
        &format!("SELECT {FILE_COLUMNS} FROM files WHERE file_id = ?1"),
        [file_id.to_string()],
        file_from_row,
    )
    .optional()?
    .ok_or_else(|| DbError::NotFound(format!("file {file_id}")))
}

/// All files owned by a user, newest first.
pub fn list_by_owner(conn: &Connection, owner_id: Uuid) -> Result<Vec<File>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE owner_id = ?1 ORDER BY created_at DESC"
    ))?;
    let rows = stmt
        .query_map([owner_id.to_string()], file_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Move a file through its lifecycle.
pub fn set_status(conn: &Connection, file_id: Uuid, status: FileStatus) -> Result<()> {
    let updated = conn.execute(
        "UPDATE files SET status = ?1 WHERE file_id = ?2",
        rusqlite::params![status.as_str(), file_id.to_string()],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("file {file_id}")));
    }
    Ok(())
}

/// Record the final chunk count once an upload session completes.
pub fn set_chunk_count(conn: &Connection, file_id: Uuid, chunk_count: u32) -> Result<()> {
    conn.execute(
        "UPDATE files SET chunk_count = ?1 WHERE file_id = ?2",
        rusqlite::params![chunk_count as i64, file_id.to_string()],
    )?;
    Ok(())
}

/// Remove a file and (by cascade) its chunks, staging rows, assignments and
/// challenges. Call only after every assignment was told to delete.
pub fn remove(conn: &Connection, file_id: Uuid) -> Result<()> {
    conn.execute(
        "DELETE FROM files WHERE file_id = ?1",
        [file_id.to_string()],
    )?;
    Ok(())
}
