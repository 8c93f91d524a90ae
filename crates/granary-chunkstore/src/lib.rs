//! # granary-chunkstore
//!
//! The storage peer's chunk store: ciphertext blobs on the local filesystem
//! plus a SQLite mirror index.
//!
//! ## Layout
//!
//! Chunks land at `<root>/<id[0..2]>/<id[2..4]>/<id>` (hex of the chunk id),
//! keeping any single directory to a 256-way fan-out. The index database at
//! `<root>/index.db` holds one `stored_chunks` row per chunk with the hash,
//! size, and on-disk path.
//!
//! `put` verifies the SHA-256 of the bytes against the declared hash before
//! anything touches disk, removes the partial file if the write fails, and
//! upserts the index row last. Writes are serialized by the index lock;
//! reads go straight to the filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current index schema version.
pub const INDEX_VERSION: u32 = 1;

/// Error types for chunk store operations.
#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("index migration failed: {0}")]
    Migration(String),

    /// Computed hash of the offered bytes differed from the declared hash.
    /// Fatal for the transfer; never retried.
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },

    #[error("chunk not found: {0}")]
    NotFound(Uuid),

    /// Zero-byte chunks are rejected by policy.
    #[error("empty chunk rejected")]
    EmptyChunk,
}

pub type Result<T> = std::result::Result<T, ChunkStoreError>;

/// Index row mirroring one stored chunk.
#[derive(Clone, Debug)]
pub struct StoredChunk {
    pub chunk_id: Uuid,
    pub file_id: Uuid,
    pub chunk_index: u32,
    pub ciphertext_hash: String,
    pub ciphertext_size_bytes: u64,
    pub path: PathBuf,
    pub stored_at: u64,
}

/// On-disk chunk store with a SQLite index.
pub struct ChunkStore {
    root: PathBuf,
    index: Mutex<Connection>,
}

impl ChunkStore {
    /// Open (or create) a chunk store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let conn = Connection::open(root.join("index.db"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        migrate(&conn)?;
        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(conn),
        })
    }

    /// Store a chunk: verify the declared hash, write the bytes to the
    /// sharded path, then upsert the index row.
    pub fn put(
        &self,
        chunk_id: Uuid,
        file_id: Uuid,
        chunk_index: u32,
        ciphertext_hash: &str,
        bytes: &[u8],
        now: u64,
    ) -> Result<()> {
        if bytes.is_empty() {
            return Err(ChunkStoreError::EmptyChunk);
        }

        let computed = hex::encode(Sha256::digest(bytes));
        if computed != ciphertext_hash {
            return Err(ChunkStoreError::HashMismatch {
                declared: ciphertext_hash.to_string(),
                computed,
            });
        }

        let path = self.chunk_path(chunk_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        if let Err(e) = fs::write(&path, bytes) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        let index = self.index.lock();
        let upserted = index.execute(
            "INSERT INTO stored_chunks
                 (chunk_id, file_id, chunk_index, ciphertext_hash,
                  ciphertext_size_bytes, path, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(chunk_id) DO UPDATE SET
                 file_id = excluded.file_id,
                 chunk_index = excluded.chunk_index,
                 ciphertext_hash = excluded.ciphertext_hash,
                 ciphertext_size_bytes = excluded.ciphertext_size_bytes,
                 path = excluded.path,
                 stored_at = excluded.stored_at",
            rusqlite::params![
                chunk_id.to_string(),
                file_id.to_string(),
                chunk_index as i64,
                ciphertext_hash,
                bytes.len() as i64,
                path.to_string_lossy(),
                now as i64,
            ],
        );
        if let Err(e) = upserted {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        tracing::debug!(%chunk_id, size = bytes.len(), "stored chunk");
        Ok(())
    }

    /// Read a chunk's ciphertext back from disk.
    pub fn get(&self, chunk_id: Uuid) -> Result<Vec<u8>> {
        let row = self.meta(chunk_id)?;
        match fs::read(&row.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(%chunk_id, path = %row.path.display(), "index row without file");
                Err(ChunkStoreError::NotFound(chunk_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Index metadata for a stored chunk.
    pub fn meta(&self, chunk_id: Uuid) -> Result<StoredChunk> {
        let index = self.index.lock();
        index
            .query_row(
                "SELECT chunk_id, file_id, chunk_index, ciphertext_hash,
                        ciphertext_size_bytes, path, stored_at
                 FROM stored_chunks WHERE chunk_id = ?1",
                [chunk_id.to_string()],
                stored_chunk_from_row,
            )
            .optional()?
            .ok_or(ChunkStoreError::NotFound(chunk_id))
    }

    /// Remove a chunk's index row and unlink its file.
    pub fn delete(&self, chunk_id: Uuid) -> Result<()> {
        let row = match self.meta(chunk_id) {
            Ok(row) => row,
            Err(ChunkStoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let index = self.index.lock();
        index.execute(
            "DELETE FROM stored_chunks WHERE chunk_id = ?1",
            [chunk_id.to_string()],
        )?;
        drop(index);

        match fs::remove_file(&row.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the store holds this chunk.
    pub fn contains(&self, chunk_id: Uuid) -> bool {
        matches!(self.meta(chunk_id), Ok(_))
    }

    /// Total bytes currently stored.
    pub fn total_bytes(&self) -> Result<u64> {
        let index = self.index.lock();
        let total: i64 = index.query_row(
            "SELECT COALESCE(SUM(ciphertext_size_bytes), 0) FROM stored_chunks",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Number of chunks currently stored.
    pub fn count(&self) -> Result<u64> {
        let index = self.index.lock();
        let count: i64 =
            index.query_row("SELECT COUNT(*) FROM stored_chunks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Every index row, for the inventory report.
    pub fn list(&self) -> Result<Vec<StoredChunk>> {
        let index = self.index.lock();
        let mut stmt = index.prepare(
            "SELECT chunk_id, file_id, chunk_index, ciphertext_hash,
                    ciphertext_size_bytes, path, stored_at
             FROM stored_chunks ORDER BY stored_at",
        )?;
        let rows = stmt
            .query_map([], stored_chunk_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Sharded on-disk path for a chunk id.
    fn chunk_path(&self, chunk_id: Uuid) -> PathBuf {
        let id = chunk_id.simple().to_string();
        self.root.join(&id[0..2]).join(&id[2..4]).join(&id)
    }
}

fn stored_chunk_from_row(row: &rusqlite::Row) -> rusqlite::Result<StoredChunk> {
    let chunk_id: String = row.get(0)?;
    let file_id: String = row.get(1)?;
    let path: String = row.get(5)?;
    Ok(StoredChunk {
        chunk_id: parse_uuid(chunk_id, 0)?,
        file_id: parse_uuid(file_id, 1)?,
        chunk_index: row.get::<_, i64>(2)? as u32,
        ciphertext_hash: row.get(3)?,
        ciphertext_size_bytes: row.get::<_, i64>(4)? as u64,
        path: PathBuf::from(path),
        stored_at: row.get::<_, i64>(6)? as u64,
    })
}

fn parse_uuid(value: String, column: usize) -> rusqlite::Result<Uuid> {
    value.parse().map_err(|e: uuid::Error| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Forward-only index migration keyed on `PRAGMA user_version`.
fn migrate(conn: &Connection) -> Result<()> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version == 0 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stored_chunks (
                 chunk_id TEXT PRIMARY KEY,
                 file_id TEXT NOT NULL,
                 chunk_index INTEGER NOT NULL,
                 ciphertext_hash TEXT NOT NULL,
                 ciphertext_size_bytes INTEGER NOT NULL,
                 path TEXT NOT NULL,
                 stored_at INTEGER NOT NULL
             );",
        )?;
        conn.pragma_update(None, "user_version", INDEX_VERSION)?;
    } else if version > INDEX_VERSION {
        return Err(ChunkStoreError::Migration(format!(
            "index version {version} is newer than supported {INDEX_VERSION}"
        )));
    }
    Ok(())
}
