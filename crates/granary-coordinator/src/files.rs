//! File service: the upload pipeline core, download path, and deletion
//! fan-out.
//!
//! A file gets a fresh 256-bit key at creation. Plaintext is split into
//! slices of at most `chunk_max_bytes`, each slice is sealed with
//! AES-256-GCM (12-byte nonce + 16-byte tag envelope), hashed, recorded,
//! staged, and handed to the distributor. The file flips to `ready` when
//! the upload completes and to `deleting` on user request; the row is
//! removed only after every assignment has been told to delete.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use granary_db::queries::{chunks, files};
use granary_transport::quic::QuicNode;
use granary_types::clock::now_secs;
use granary_types::{Chunk, File, FileStatus, BYTES_PER_GIB};

use crate::config::StorageOptions;
use crate::distributor::Distributor;
use crate::placement::{self, PlacementRequest};
use crate::{fetch, CoordError, Db, Result};

/// Nonce prepended to each ciphertext.
const NONCE_LEN: usize = 12;

/// Deadline when fetching a chunk for download.
const DOWNLOAD_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Outcome of storing one chunk.
#[derive(Clone, Debug)]
pub struct ChunkUploadReport {
    pub chunk: Chunk,
    /// Replicas acknowledged immediately; shortfalls repair in background.
    pub replicas_stored: usize,
}

/// Outcome of a delete request.
#[derive(Clone, Copy, Debug)]
pub struct DeleteReport {
    /// Assignments still waiting for an unreachable peer.
    pub remaining: usize,
    /// Whether the file row (and its metadata) is gone.
    pub removed: bool,
}

/// The file service.
pub struct FileService {
    db: Db,
    node: Arc<QuicNode>,
    distributor: Arc<Distributor>,
    options: StorageOptions,
}

impl FileService {
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

    /// Begin an upload: create the file in `uploading` state with a fresh
    /// per-file key.
    pub async fn create_file(
        &self,
        owner_id: Uuid,
        logical_name: &str,
        plaintext_size_bytes: u64,
    ) -> Result<File> {
        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);

        let file = File {
            file_id: Uuid::new_v4(),
            owner_id,
            logical_name: logical_name.to_string(),
            plaintext_size_bytes,
            chunk_count: 0,
            encryption_key: key,
            status: FileStatus::Uploading,
            created_at: now_secs(),
        };
        let conn = self.db.lock().await;
        files::insert(&conn, &file)?;
        Ok(file)
    }

    /// Encrypt, record, stage, and distribute one plaintext slice.
    pub async fn store_chunk(
        &self,
        file_id: Uuid,
        chunk_index: u32,
        plaintext: &[u8],
    ) -> Result<ChunkUploadReport> {
        if plaintext.is_empty() {
            return Err(CoordError::InvalidRequest("empty chunk".to_string()));
        }
        if plaintext.len() as u64 > self.options.chunk_max_bytes {
            return Err(CoordError::ChunkTooLarge {
                size: plaintext.len() as u64,
                max: self.options.chunk_max_bytes,
            });
        }

        let file = {
            let conn = self.db.lock().await;
            files::get(&conn, file_id)?
        };
        if file.status != FileStatus::Uploading {
            return Err(CoordError::InvalidRequest(format!(
                "file is {}, not uploading",
                file.status.as_str()
            )));
        }

        let ciphertext = encrypt_chunk(&file.encryption_key, plaintext)?;
        let chunk = Chunk {
            chunk_id: Uuid::new_v4(),
            file_id,
            chunk_index,
            ciphertext_hash: hex::encode(Sha256::digest(&ciphertext)),
            ciphertext_size_bytes: ciphertext.len() as u64,
            last_verified_at: None,
        };

        let targets = {
            let conn = self.db.lock().await;
            chunks::insert(&conn, &chunk)?;
            chunks::put_staging(&conn, chunk.chunk_id, &ciphertext)?;
            placement::plan(
                &conn,
                &PlacementRequest {
                    chunk_id: chunk.chunk_id,
                    ciphertext_size_bytes: chunk.ciphertext_size_bytes,
                    needed: self.options.desired_replicas as usize,
                    now: now_secs(),
                    liveness_window_secs: self.options.liveness_window_secs(),
                },
            )?
        };

        let outcome = self
            .distributor
            .distribute(&chunk, Arc::new(ciphertext), &targets)
            .await?;

        Ok(ChunkUploadReport {
            chunk,
            replicas_stored: outcome.success_count,
        })
    }

    /// Finish an upload: stamp the chunk count and flip to `ready`.
    pub async fn complete_upload(&self, file_id: Uuid) -> Result<File> {
        let conn = self.db.lock().await;
        let file = files::get(&conn, file_id)?;
        if file.status != FileStatus::Uploading {
            return Err(CoordError::InvalidRequest(format!(
                "file is {}, not uploading",
                file.status.as_str()
            )));
        }

        let stored = chunks::of_file(&conn, file_id)?;
        files::set_chunk_count(&conn, file_id, stored.len() as u32)?;
        files::set_status(&conn, file_id, FileStatus::Ready)?;
        Ok(files::get(&conn, file_id)?)
    }

    /// Upload a whole byte buffer: split, store every slice, complete.
    pub async fn upload_bytes(
        &self,
        owner_id: Uuid,
        logical_name: &str,
        data: &[u8],
    ) -> Result<File> {
        if data.is_empty() {
            return Err(CoordError::InvalidRequest("empty file".to_string()));
        }

        let file = self
            .create_file(owner_id, logical_name, data.len() as u64)
            .await?;
        for (index, slice) in data.chunks(self.options.chunk_max_bytes as usize).enumerate() {
            self.store_chunk(file.file_id, index as u32, slice).await?;
        }
        self.complete_upload(file.file_id).await
    }

    /// Reassemble a file: fetch each chunk from a replica (staging as the
    /// upload-window fallback), verify, decrypt, concatenate.
    pub async fn download(&self, file_id: Uuid) -> Result<(File, Vec<u8>)> {
        let (file, chunk_rows) = {
            let conn = self.db.lock().await;
            let file = files::get(&conn, file_id)?;
            if file.status != FileStatus::Ready {
                return Err(CoordError::InvalidRequest(format!(
                    "file is {}, not ready",
                    file.status.as_str()
                )));
            }
            let rows = chunks::of_file(&conn, file_id)?;
            (file, rows)
        };

        let mut plaintext = Vec::with_capacity(file.plaintext_size_bytes as usize);
        for chunk in &chunk_rows {
            let ciphertext = self.fetch_ciphertext(chunk).await?;
            let slice = decrypt_chunk(&file.encryption_key, &ciphertext)?;
            plaintext.extend_from_slice(&slice);
        }
        Ok((file, plaintext))
    }

    /// Request deletion: fan `delete-chunk` out to every holder, release
    /// staging, and remove the metadata once nothing remains.
    pub async fn delete(&self, file_id: Uuid) -> Result<DeleteReport> {
        let chunk_rows = {
            let conn = self.db.lock().await;
            files::get(&conn, file_id)?;
            files::set_status(&conn, file_id, FileStatus::Deleting)?;
            chunks::of_file(&conn, file_id)?
        };

        let mut remaining = 0usize;
        for chunk in &chunk_rows {
            remaining += self.distributor.delete_replicas(chunk).await?;
            let conn = self.db.lock().await;
            chunks::clear_staging(&conn, chunk.chunk_id)?;
        }

        let removed = remaining == 0;
        if removed {
            let conn = self.db.lock().await;
            files::remove(&conn, file_id)?;
            tracing::info!(%file_id, "file removed");
        } else {
            tracing::info!(%file_id, remaining, "file deletion pending unreachable peers");
        }
        Ok(DeleteReport { remaining, removed })
    }

    /// Monthly storage cost of a file at the given replica count.
    pub fn monthly_cost_estimate(&self, plaintext_size_bytes: u64, replicas: u32) -> i64 {
        monthly_cost(
            plaintext_size_bytes,
            replicas,
            self.options.storage_credit_per_gib_month,
        )
    }

    async fn fetch_ciphertext(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        match fetch::from_replica(&self.db, &self.node, chunk, None, DOWNLOAD_FETCH_TIMEOUT).await
        {
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

/// Credits per month for storing `size` bytes at `replicas` copies.
pub fn monthly_cost(size: u64, replicas: u32, credit_per_gib_month: u64) -> i64 {
    (u128::from(size) * u128::from(replicas) * u128::from(credit_per_gib_month)
        / u128::from(BYTES_PER_GIB)) as i64
}

/// Seal a plaintext slice: fresh random nonce, AES-256-GCM, output is
/// `nonce ∥ ciphertext ∥ tag`.
pub fn encrypt_chunk(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CoordError::Crypto("chunk encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a sealed chunk produced by [`encrypt_chunk`].
pub fn decrypt_chunk(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(CoordError::Crypto("ciphertext too short".to_string()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CoordError::Crypto("chunk decryption failed".to_string()))
}
