//! The worker registry: the single source of truth for which identities
//! exist, are admitted and are currently registered.
//!
//! All mutation of worker state goes through [`WorkerRegistry`]; the REST
//! layer and the admin control plane never touch identity records directly.
//! An in-memory map guarded by a read-write lock serves the hot
//! `is_allowed`/`is_registered` queries, with write-through persistence to
//! the [`IdentityStore`] so that a restart reconstructs the identical
//! admission and registration set.

pub mod store;

use std::{collections::HashMap, fs, io, path::Path, sync::Arc};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use fedlink_core::{
    crypto::{ByteObject, PublicSigningKey},
    wire::WorkerRecord,
    WorkerId,
};

use self::store::{IdentityStore, StoreError, StoredIdentity};
use crate::{auth::Authenticator, federation::Federation};

#[derive(Debug, Error)]
/// An error related to a registry operation.
///
/// Every variant maps to a tagged response at the protocol boundary; none of
/// them ever crosses it as a panic.
pub enum RegistryError {
    #[error("unknown worker")]
    UnknownWorker,
    #[error("worker {0} already exists")]
    AlreadyExists(WorkerId),
    #[error("public key could not be decoded")]
    InvalidKey,
    #[error("signature verification failed")]
    AuthenticationFailed,
    #[error("failed to read key list file: {0}")]
    KeyList(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct WorkerEntry {
    public_key: Option<String>,
    registered: bool,
}

impl WorkerEntry {
    fn stored(&self) -> StoredIdentity {
        StoredIdentity {
            public_key: self.public_key.clone(),
            registered: self.registered,
        }
    }
}

/// The registry of worker identities.
///
/// Mutations against the same identity are serialized by the write lock;
/// `is_allowed`/`is_registered` are lock-shared reads safe to call from any
/// number of concurrent request handlers. The register/unregister callbacks
/// of the aggregation collaborator fire exactly once per registration edge,
/// never on no-op transitions, and always after the new state has been
/// durably committed.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
    store: Option<IdentityStore>,
    authenticator: Arc<Authenticator>,
    federation: Arc<dyn Federation>,
}

impl WorkerRegistry {
    /// Builds a registry from the identities of the previous session (when
    /// `load_last_session` is set and a store is configured) merged with the
    /// pre-authorized `key_list`.
    ///
    /// Key list entries absent from the store are persisted as allowed but
    /// unregistered identities. An undecodable key in the list fails
    /// startup.
    pub fn new(
        federation: Arc<dyn Federation>,
        authenticator: Arc<Authenticator>,
        store: Option<IdentityStore>,
        load_last_session: bool,
        key_list: &[String],
    ) -> Result<Self, RegistryError> {
        let mut workers = HashMap::new();

        if load_last_session {
            if let Some(store) = &store {
                for (worker_id, identity) in store.load_all()? {
                    workers.insert(
                        worker_id,
                        WorkerEntry {
                            public_key: identity.public_key,
                            registered: identity.registered,
                        },
                    );
                }
                info!(
                    identities = workers.len(),
                    "reloaded identities from the previous session"
                );
            }
        }

        for key in key_list {
            if PublicSigningKey::from_hex(key).is_none() {
                return Err(RegistryError::InvalidKey);
            }
            let worker_id = WorkerId::from(key.as_str());
            if workers.contains_key(&worker_id) {
                continue;
            }
            let entry = WorkerEntry {
                public_key: Some(key.clone()),
                registered: false,
            };
            if let Some(store) = &store {
                store.upsert(&worker_id, &entry.stored())?;
            }
            workers.insert(worker_id, entry);
        }

        Ok(Self {
            workers: RwLock::new(workers),
            store,
            authenticator,
            federation,
        })
    }

    /// Reads a key list file: one hex public key per line, blank lines
    /// ignored.
    pub fn read_key_list(path: impl AsRef<Path>) -> Result<Vec<String>, RegistryError> {
        let contents = fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Authenticates a self-registering worker and resolves its identity.
    ///
    /// With authentication enabled this fails closed: the signature must
    /// verify against the single-use challenge issued for the key, and the
    /// key must already be admitted (via the key list or the admin API).
    /// With authentication disabled any caller is accepted and allocated a
    /// fresh unauthenticated identity.
    ///
    /// Registration status is not touched here; the caller decides whether
    /// to flip it (firing the registration callback).
    pub async fn authenticate_and_add(
        &self,
        public_key_str: &str,
        signed_phrase: &str,
    ) -> Result<WorkerId, RegistryError> {
        if !self.authenticator.is_enabled() {
            let worker_id = WorkerId::new_unauthenticated();
            let entry = WorkerEntry {
                public_key: None,
                registered: false,
            };
            self.persist(&worker_id, &entry)?;
            self.workers
                .write()
                .await
                .insert(worker_id.clone(), entry);
            info!(worker_id = %worker_id, "allocated unauthenticated worker id");
            return Ok(worker_id);
        }

        if !self
            .authenticator
            .verify_challenge(public_key_str, public_key_str, signed_phrase)
        {
            warn!("self-registration rejected: authentication failed");
            return Err(RegistryError::AuthenticationFailed);
        }

        let worker_id = WorkerId::from(public_key_str);
        if !self.workers.read().await.contains_key(&worker_id) {
            warn!(worker_id = %worker_id, "self-registration rejected: identity not admitted");
            return Err(RegistryError::UnknownWorker);
        }
        Ok(worker_id)
    }

    /// Whether the identity exists in the registry at all.
    pub async fn is_allowed(&self, worker_id: &WorkerId) -> bool {
        self.workers.read().await.contains_key(worker_id)
    }

    /// Whether the identity is currently registered.
    pub async fn is_registered(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|entry| entry.registered)
            .unwrap_or(false)
    }

    /// Transitions the registration status of an identity.
    ///
    /// The register/unregister callback fires only on a genuine edge; a
    /// no-op call leaves the collaborator untouched. The transition is
    /// persisted before it becomes visible.
    pub async fn set_registration_status(
        &self,
        worker_id: &WorkerId,
        registered: bool,
    ) -> Result<WorkerId, RegistryError> {
        let edge = {
            let mut workers = self.workers.write().await;
            let entry = workers
                .get_mut(worker_id)
                .ok_or(RegistryError::UnknownWorker)?;
            if entry.registered == registered {
                None
            } else {
                let mut updated = entry.clone();
                updated.registered = registered;
                if let Some(store) = &self.store {
                    store.upsert(worker_id, &updated.stored())?;
                }
                entry.registered = registered;
                Some(registered)
            }
        };

        match edge {
            Some(true) => {
                info!(worker_id = %worker_id, "worker registered");
                self.federation.on_worker_registered(worker_id);
            }
            Some(false) => {
                info!(worker_id = %worker_id, "worker unregistered");
                self.federation.on_worker_unregistered(worker_id);
            }
            None => {}
        }
        Ok(worker_id.clone())
    }

    /// Admits a new identity via the admin path, initially unregistered.
    ///
    /// Fails with [`RegistryError::AlreadyExists`] when the identity is
    /// already admitted, and with [`RegistryError::InvalidKey`] when
    /// authentication is enabled and the key does not decode.
    pub async fn add_worker(&self, public_key_str: &str) -> Result<WorkerId, RegistryError> {
        if !self.authenticator.is_enabled() {
            let worker_id = WorkerId::new_unauthenticated();
            let entry = WorkerEntry {
                public_key: None,
                registered: false,
            };
            self.persist(&worker_id, &entry)?;
            self.workers
                .write()
                .await
                .insert(worker_id.clone(), entry);
            return Ok(worker_id);
        }

        if PublicSigningKey::from_hex(public_key_str).is_none() {
            return Err(RegistryError::InvalidKey);
        }
        let worker_id = WorkerId::from(public_key_str);
        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker_id) {
            return Err(RegistryError::AlreadyExists(worker_id));
        }
        let entry = WorkerEntry {
            public_key: Some(public_key_str.to_string()),
            registered: false,
        };
        if let Some(store) = &self.store {
            store.upsert(&worker_id, &entry.stored())?;
        }
        workers.insert(worker_id.clone(), entry);
        Ok(worker_id)
    }

    /// Fully deletes an identity: forces it out of the registered state
    /// (firing the unregister callback if it was registered), then removes
    /// it from the store and the in-memory registry.
    pub async fn remove_worker(&self, worker_id: &WorkerId) -> Result<WorkerId, RegistryError> {
        let was_registered = {
            let mut workers = self.workers.write().await;
            let entry = workers.get(worker_id).ok_or(RegistryError::UnknownWorker)?;
            let was_registered = entry.registered;
            if let Some(store) = &self.store {
                store.remove(worker_id)?;
            }
            workers.remove(worker_id);
            was_registered
        };

        if was_registered {
            info!(worker_id = %worker_id, "worker unregistered (removal)");
            self.federation.on_worker_unregistered(worker_id);
        }
        Ok(worker_id.clone())
    }

    /// A full snapshot of the registry for the admin listing, sorted by
    /// worker id.
    pub async fn list_workers(&self) -> Vec<WorkerRecord> {
        let workers = self.workers.read().await;
        let mut records: Vec<_> = workers
            .iter()
            .map(|(worker_id, entry)| WorkerRecord {
                worker_id: worker_id.clone(),
                registered: entry.registered,
            })
            .collect();
        records.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        records
    }

    fn persist(&self, worker_id: &WorkerId, entry: &WorkerEntry) -> Result<(), RegistryError> {
        if let Some(store) = &self.store {
            store.upsert(worker_id, &entry.stored())?;
        }
        Ok(())
    }
}
