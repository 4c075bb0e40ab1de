//! Durable backing store for worker identities.
//!
//! A thin layer over an embedded [sled] tree: one record per worker id,
//! bincode encoded. Every mutation is flushed before the call returns, so a
//! crash never loses an acknowledged admin operation and a restart
//! reconstructs the exact identity set of the previous session.
//!
//! [sled]: https://docs.rs/sled/

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use fedlink_core::WorkerId;

#[derive(Debug, Error)]
/// An error related to reading or writing the identity store.
pub enum StoreError {
    #[error("failed to open identity store: {0}")]
    Open(sled::Error),
    #[error("failed to read from identity store: {0}")]
    Read(sled::Error),
    #[error("failed to write to identity store: {0}")]
    Write(sled::Error),
    #[error("failed to encode identity record: {0}")]
    Encode(bincode::Error),
    #[error("identity store holds a corrupt record: {0}")]
    Decode(bincode::Error),
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// The persisted shape of a worker identity.
pub struct StoredIdentity {
    /// Hex public key for authenticated identities, `None` for identities
    /// allocated while authentication was disabled.
    pub public_key: Option<String>,
    pub registered: bool,
}

/// The on-disk identity registry.
pub struct IdentityStore {
    db: sled::Db,
}

impl IdentityStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref()).map_err(StoreError::Open)?;
        if db.was_recovered() {
            info!("identity store recovered from a previous session");
        }
        Ok(Self { db })
    }

    /// Reads every persisted identity.
    pub fn load_all(&self) -> Result<Vec<(WorkerId, StoredIdentity)>, StoreError> {
        let mut identities = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry.map_err(StoreError::Read)?;
            let worker_id = WorkerId::from(String::from_utf8_lossy(&key).into_owned());
            let identity = bincode::deserialize(&value).map_err(StoreError::Decode)?;
            identities.push((worker_id, identity));
        }
        Ok(identities)
    }

    /// Writes (or overwrites) one identity, durably.
    pub fn upsert(&self, worker_id: &WorkerId, identity: &StoredIdentity) -> Result<(), StoreError> {
        let encoded = bincode::serialize(identity).map_err(StoreError::Encode)?;
        self.db
            .insert(worker_id.as_str().as_bytes(), encoded)
            .map_err(StoreError::Write)?;
        self.db.flush().map_err(StoreError::Write)?;
        Ok(())
    }

    /// Deletes one identity, durably. Deleting an absent id is a no-op.
    pub fn remove(&self, worker_id: &WorkerId) -> Result<(), StoreError> {
        self.db
            .remove(worker_id.as_str().as_bytes())
            .map_err(StoreError::Write)?;
        self.db.flush().map_err(StoreError::Write)?;
        Ok(())
    }
}
