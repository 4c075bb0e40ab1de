//! The protocol-facing service layer.
//!
//! [`ProtocolHandler`] bundles the registry, the authenticator, the long-poll
//! coordinator and the aggregation collaborator behind one interface and
//! implements the per-route contracts: input validation before any state
//! mutation, identical admission checks on every worker route, and tagged
//! failures instead of exceptions. The REST layer only extracts requests and
//! maps [`ProtocolError`] values onto response bodies.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use fedlink_core::{
    crypto::{ByteObject, Sha256},
    wire::{self, AdminRemoved, GlobalModel, WorkerRecord},
    VersionToken,
    WorkerId,
    INVALID_WORKER,
    UNREGISTERED_WORKER,
};

use crate::{
    auth::Authenticator,
    federation::Federation,
    poll::LongPollCoordinator,
    registry::{store::IdentityStore, RegistryError, WorkerRegistry},
    settings::{ProtocolSettings, RegistrySettings},
};

#[derive(Debug, Error)]
/// A failure of a worker-facing protocol operation.
pub enum ProtocolError {
    /// The request body is missing required fields or carries wrong types.
    #[error("{0}")]
    Validation(String),
    /// The identity is unknown or could not be authenticated.
    #[error("invalid worker")]
    InvalidWorker,
    /// The identity is known but not currently registered.
    #[error("unregistered worker")]
    UnregisteredWorker,
    /// The request failed while being processed; the message is surfaced to
    /// the caller.
    #[error("{0}")]
    Processing(String),
}

impl ProtocolError {
    /// The plain-text response body this failure maps to.
    pub fn response_body(&self) -> String {
        match self {
            ProtocolError::Validation(message) | ProtocolError::Processing(message) => {
                message.clone()
            }
            ProtocolError::InvalidWorker => INVALID_WORKER.to_string(),
            ProtocolError::UnregisteredWorker => UNREGISTERED_WORKER.to_string(),
        }
    }
}

impl From<RegistryError> for ProtocolError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::UnknownWorker
            | RegistryError::InvalidKey
            | RegistryError::AuthenticationFailed
            | RegistryError::AlreadyExists(_) => ProtocolError::InvalidWorker,
            RegistryError::KeyList(e) => ProtocolError::Processing(e.to_string()),
            RegistryError::Store(e) => ProtocolError::Processing(e.to_string()),
        }
    }
}

enum FieldType {
    Str,
    Bool,
}

/// Checks that `body` carries every listed field with the expected type,
/// naming the offending fields on failure. Runs before any state mutation.
fn validate_fields(body: &Value, fields: &[(&str, FieldType)]) -> Result<(), String> {
    let mut failed = Vec::new();
    for (name, field_type) in fields {
        let valid = match body.get(*name) {
            Some(value) => match field_type {
                FieldType::Str => value.is_string(),
                FieldType::Bool => value.is_boolean(),
            },
            None => false,
        };
        if !valid {
            failed.push(*name);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "Invalid input: failed to get the following keys from JSON input: {:?}",
            failed
        ))
    }
}

#[derive(Clone)]
/// The request/response surface of the coordination protocol.
pub struct ProtocolHandler {
    registry: Arc<WorkerRegistry>,
    authenticator: Arc<Authenticator>,
    coordinator: LongPollCoordinator,
    federation: Arc<dyn Federation>,
}

impl ProtocolHandler {
    /// Builds the full protocol stack from settings: opens the identity
    /// store, loads the key list and wires registry, authenticator and
    /// long-poll coordinator around the aggregation collaborator.
    pub fn new(
        protocol: &ProtocolSettings,
        registry_settings: &RegistrySettings,
        federation: Arc<dyn Federation>,
    ) -> Result<Self, RegistryError> {
        // make sure the crypto layer is initialized before any signature
        // verification happens on request handlers
        let _ = sodiumoxide::init();

        let authenticator = Arc::new(Authenticator::new(protocol.safe_mode));
        let key_list = match &protocol.key_list_file {
            Some(path) => WorkerRegistry::read_key_list(path)?,
            None => Vec::new(),
        };
        let store = IdentityStore::open(&registry_settings.db_path)?;
        let registry = Arc::new(WorkerRegistry::new(
            federation.clone(),
            authenticator.clone(),
            Some(store),
            registry_settings.load_last_session_workers,
            &key_list,
        )?);
        let coordinator = LongPollCoordinator::new(
            federation.clone(),
            Duration::from_secs(protocol.model_check_interval),
        );
        Ok(Self {
            registry,
            authenticator,
            coordinator,
            federation,
        })
    }

    /// Assembles a handler from already-built components.
    pub fn from_parts(
        registry: Arc<WorkerRegistry>,
        authenticator: Arc<Authenticator>,
        coordinator: LongPollCoordinator,
        federation: Arc<dyn Federation>,
    ) -> Self {
        Self {
            registry,
            authenticator,
            coordinator,
            federation,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Registers the worker, admitting it first when the server runs
    /// without authentication. The register callback fires only on a
    /// genuine new-registration transition, so re-registering an
    /// already-registered identity is a no-op returning the same id.
    pub async fn register(&self, body: Value) -> Result<WorkerId, ProtocolError> {
        validate_fields(&body, &[("public_key_str", FieldType::Str)]).map_err(|message| {
            warn!("{}", message);
            ProtocolError::Validation(message)
        })?;
        let public_key_str = body["public_key_str"].as_str().unwrap();
        let signed_phrase = body
            .get("signed_phrase")
            .and_then(Value::as_str)
            .unwrap_or("");

        let worker_id = self
            .registry
            .authenticate_and_add(public_key_str, signed_phrase)
            .await?;
        if !self.registry.is_registered(&worker_id).await {
            self.registry
                .set_registration_status(&worker_id, true)
                .await?;
        }
        Ok(worker_id)
    }

    /// Issues a fresh single-use challenge phrase for the given context
    /// (worker id, or public key string at registration time).
    pub fn challenge_phrase(&self, context: &str) -> Vec<u8> {
        self.authenticator.issue_challenge(context)
    }

    /// Validates a long-poll request and parks it with the coordinator.
    /// The returned receiver resolves once a newer artifact version exists.
    pub async fn poll_model(
        &self,
        body: Value,
    ) -> Result<oneshot::Receiver<GlobalModel>, ProtocolError> {
        validate_fields(
            &body,
            &[
                ("worker_id", FieldType::Str),
                ("last_worker_model_version", FieldType::Str),
            ],
        )
        .map_err(|message| {
            warn!("{}", message);
            ProtocolError::Validation(message)
        })?;
        let worker_id = WorkerId::from(body["worker_id"].as_str().unwrap());
        let last_version = VersionToken::from(body["last_worker_model_version"].as_str().unwrap());
        let signed_phrase = body
            .get("signed_phrase")
            .and_then(Value::as_str)
            .unwrap_or("");

        if !self.registry.is_allowed(&worker_id).await {
            warn!(worker_id = %worker_id, "unknown worker tried to retrieve the global model");
            return Err(ProtocolError::InvalidWorker);
        }
        if !self.registry.is_registered(&worker_id).await {
            warn!(worker_id = %worker_id, "unregistered worker tried to retrieve the global model");
            return Err(ProtocolError::UnregisteredWorker);
        }
        if !self
            .authenticator
            .verify_challenge(worker_id.as_str(), worker_id.as_str(), signed_phrase)
        {
            warn!(worker_id = %worker_id, "model retrieval rejected: authentication failed");
            return Err(ProtocolError::InvalidWorker);
        }

        Ok(self.coordinator.wait_for_newer(worker_id, last_version))
    }

    /// Verifies and delegates a submitted update. The collaborator's return
    /// string is handed back verbatim; every failure on this path yields a
    /// response body instead of tearing down the connection.
    pub async fn submit_update(
        &self,
        worker_id: &str,
        compressed_payload: &[u8],
        signed_phrase: &str,
    ) -> Result<String, ProtocolError> {
        let worker_id = WorkerId::from(worker_id);
        let payload = wire::decompress(compressed_payload)
            .map_err(|e| ProtocolError::Processing(e.to_string()))?;

        if !self.registry.is_allowed(&worker_id).await {
            warn!(worker_id = %worker_id, "unknown worker tried to send an update");
            return Err(ProtocolError::InvalidWorker);
        }
        if !self.registry.is_registered(&worker_id).await {
            warn!(worker_id = %worker_id, "unregistered worker tried to send an update");
            return Err(ProtocolError::UnregisteredWorker);
        }

        // the signature binds to the payload digest, not to a challenge:
        // a captured signature cannot be reused for different bytes
        let digest = Sha256::hash(&payload);
        if !self
            .authenticator
            .verify(worker_id.as_str(), signed_phrase, digest.as_slice())
        {
            warn!(worker_id = %worker_id, "update rejected: payload signature failed");
            return Err(ProtocolError::InvalidWorker);
        }

        Ok(self.federation.receive_worker_update(&worker_id, payload))
    }

    /// Admin: full registry snapshot.
    pub async fn admin_list(&self) -> Vec<WorkerRecord> {
        self.registry.list_workers().await
    }

    /// Admin: admit a new identity with an initial registration status.
    pub async fn admin_add(&self, body: Value) -> Result<WorkerRecord, String> {
        validate_fields(
            &body,
            &[
                ("public_key_str", FieldType::Str),
                ("registered", FieldType::Bool),
            ],
        )?;
        let public_key_str = body["public_key_str"].as_str().unwrap();
        let registered = body["registered"].as_bool().unwrap();

        let worker_id = match self.registry.add_worker(public_key_str).await {
            Ok(worker_id) => worker_id,
            Err(RegistryError::InvalidKey) => {
                return Err(format!(
                    "Unable to validate public key for {} - worker not added.",
                    public_key_str
                ));
            }
            Err(RegistryError::AlreadyExists(worker_id)) => {
                return Err(format!("Worker {} already exists.", worker_id));
            }
            Err(e) => return Err(e.to_string()),
        };
        if registered {
            self.registry
                .set_registration_status(&worker_id, true)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(WorkerRecord {
            worker_id,
            registered,
        })
    }

    /// Admin: transition a worker's registration status.
    pub async fn admin_set_status(
        &self,
        worker_id: &str,
        body: Value,
    ) -> Result<WorkerRecord, String> {
        validate_fields(&body, &[("registered", FieldType::Bool)])?;
        let registered = body["registered"].as_bool().unwrap();

        match self
            .registry
            .set_registration_status(&WorkerId::from(worker_id), registered)
            .await
        {
            Ok(worker_id) => Ok(WorkerRecord {
                worker_id,
                registered,
            }),
            Err(RegistryError::UnknownWorker) => Err(format!(
                "Attempt at changing worker status failed - please ensure this worker was added: {}.",
                worker_id
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Admin: fully delete an identity.
    pub async fn admin_remove(&self, worker_id: &str) -> Result<AdminRemoved, String> {
        match self
            .registry
            .remove_worker(&WorkerId::from(worker_id))
            .await
        {
            Ok(worker_id) => Ok(AdminRemoved {
                worker_id,
                success: true,
            }),
            Err(RegistryError::UnknownWorker) => {
                Err(format!("Attempt to remove unknown worker {}.", worker_id))
            }
            Err(e) => Err(e.to_string()),
        }
    }
}
