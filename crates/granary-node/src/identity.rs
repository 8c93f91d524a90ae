//! Node identity: an Ed25519 keypair persisted across restarts.
//!
//! The peer id is content-addressed — the hex SHA-256 of the public key —
//! so it is stable for the life of the key file and verifiable by the
//! coordinator at registration.

use std::fs;
use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{NodeError, Result};

/// The node's long-lived identity keypair.
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// The content-addressed peer id: hex SHA-256 of the public key.
    pub fn peer_id(&self) -> String {
        hex::encode(Sha256::digest(self.signing_key.verifying_key().as_bytes()))
    }

    /// The raw public key bytes.
    pub fn pubkey(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Persist the secret key as hex, readable only by the owner.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut encoded = hex::encode(self.signing_key.to_bytes());
        fs::write(path, &encoded)?;
        encoded.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load an identity from its key file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut encoded = fs::read_to_string(path)?;
        let decoded = hex::decode(encoded.trim())
            .map_err(|_| NodeError::Identity("key file is not hex".to_string()));
        encoded.zeroize();

        let mut bytes: [u8; 32] = decoded?
            .try_into()
            .map_err(|_| NodeError::Identity("key file is not 32 bytes".to_string()))?;
        let identity = Self {
            signing_key: SigningKey::from_bytes(&bytes),
        };
        bytes.zeroize();
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let identity = NodeIdentity::generate();
        let peer_id = identity.peer_id();
        assert_eq!(peer_id.len(), 64);
        assert_eq!(peer_id, identity.peer_id());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.key");

        let identity = NodeIdentity::generate();
        identity.save(&path).expect("save");

        let restored = NodeIdentity::load(&path).expect("load");
        assert_eq!(restored.peer_id(), identity.peer_id());
        assert_eq!(restored.pubkey(), identity.pubkey());
    }

    #[test]
    fn test_distinct_identities() {
        assert_ne!(
            NodeIdentity::generate().peer_id(),
            NodeIdentity::generate().peer_id()
        );
    }

    #[test]
    fn test_corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.key");
        std::fs::write(&path, "not hex at all").expect("write");
        assert!(NodeIdentity::load(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.key");
        NodeIdentity::generate().save(&path).expect("save");

        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
