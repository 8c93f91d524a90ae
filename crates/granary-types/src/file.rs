//! User files as the coordinator tracks them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseStatusError;

/// Lifecycle status of a file.
///
/// `Uploading → Ready` when the owning upload completes; `Ready → Deleting`
/// on user request. The row is removed only once every chunk assignment has
/// been told to delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploading,
    Ready,
    Deleting,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Ready => "ready",
            FileStatus::Deleting => "deleting",
        }
    }
}

impl FromStr for FileStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(FileStatus::Uploading),
            "ready" => Ok(FileStatus::Ready),
            "deleting" => Ok(FileStatus::Deleting),
            other => Err(ParseStatusError {
                kind: "file status",
                value: other.to_string(),
            }),
        }
    }
}

/// A stored file. Chunk ciphertext lives on peers; the coordinator keeps the
/// metadata and the per-file symmetric key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct File {
    pub file_id: Uuid,
    pub owner_id: Uuid,
    pub logical_name: String,
    pub plaintext_size_bytes: u64,
    pub chunk_count: u32,
    /// 256-bit AES-GCM key, generated at upload initiation.
    #[serde(skip_serializing)]
    pub encryption_key: Vec<u8>,
    pub status: FileStatus,
    pub created_at: u64,
}
