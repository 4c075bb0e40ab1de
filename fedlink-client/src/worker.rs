//! The worker driver: registration, the poll loop and update submission.

use thiserror::Error;
use tracing::{info, warn};

use fedlink_core::{
    crypto::{ByteObject, Sha256, SigningKeyPair},
    wire::{self, FrameError, GlobalModel, PollRequest},
    WorkerId,
    INVALID_WORKER,
    UNREGISTERED_WORKER,
};

use crate::traits::{CoordinatorClient, WorkerHooks};

#[derive(Debug, Error)]
/// A failure of the worker driver.
pub enum WorkerError<E>
where
    E: ::std::error::Error + 'static,
{
    /// The coordinator does not accept this identity. Check that the
    /// private key the worker was started with corresponds to a public key
    /// shared with the server.
    #[error("the coordinator rejected this worker as invalid")]
    Rejected,
    /// The identity is known but currently unregistered; an admin has to
    /// re-enable it (or the worker can re-register).
    #[error("this worker is currently unregistered")]
    Unregistered,
    /// A method requiring a worker id was called before [`Worker::register`].
    #[error("the worker has not registered yet")]
    NotRegistered,
    /// The coordinator answered with an error message instead of data.
    #[error("the coordinator reported: {0}")]
    Server(String),
    /// Local payload framing failed.
    #[error(transparent)]
    Frame(FrameError),
    /// The underlying transport failed.
    #[error("transport failed: {0}")]
    Transport(#[from] E),
}

/// The worker side of the coordination protocol, generic over its
/// transport.
///
/// The driver registers once and caches the assigned id for its lifetime.
/// [`run`](Self::run) then loops: request a challenge, sign it, long-poll
/// for a newer artifact bound to the version the hooks report, and deliver
/// the artifact synchronously before polling again. Updates are submitted
/// independently via [`send_update`](Self::send_update), signed over the
/// payload digest. Without a key pair the driver interoperates with a
/// server running in unsafe mode.
pub struct Worker<C, H> {
    client: C,
    hooks: H,
    keys: Option<SigningKeyPair>,
    worker_id: Option<WorkerId>,
}

impl<C, H> Worker<C, H>
where
    C: CoordinatorClient,
    H: WorkerHooks,
{
    pub fn new(client: C, hooks: H, keys: Option<SigningKeyPair>) -> Self {
        Self {
            client,
            hooks,
            keys,
            worker_id: None,
        }
    }

    /// The id assigned at registration, if any.
    pub fn worker_id(&self) -> Option<&WorkerId> {
        self.worker_id.as_ref()
    }

    /// Registers this worker, caching the assigned id. Subsequent calls are
    /// no-ops returning the cached id.
    pub async fn register(&mut self) -> Result<WorkerId, WorkerError<C::Error>> {
        if let Some(worker_id) = &self.worker_id {
            return Ok(worker_id.clone());
        }

        let (public_key_hex, signed_phrase) = match &self.keys {
            Some(keys) => {
                let public_key_hex = keys.public.to_hex();
                let challenge = self.client.challenge_phrase(&public_key_hex).await?;
                let signed_phrase = keys.secret.sign_detached(&challenge).to_hex();
                (public_key_hex, signed_phrase)
            }
            None => {
                warn!("no key pair configured: registering unauthenticated");
                ("unauthenticated".to_string(), String::new())
            }
        };

        let body = self.client.register(&public_key_hex, &signed_phrase).await?;
        if body == INVALID_WORKER {
            return Err(WorkerError::Rejected);
        }
        let worker_id = WorkerId::from(body.as_str());
        info!(worker_id = %worker_id, "registered with the coordinator");
        self.worker_id = Some(worker_id.clone());
        Ok(worker_id)
    }

    /// One long-poll round: waits until the coordinator holds an artifact
    /// version different from the one the hooks report, and returns it.
    pub async fn poll_round(&mut self) -> Result<GlobalModel, WorkerError<C::Error>> {
        let worker_id = self.worker_id.clone().ok_or(WorkerError::NotRegistered)?;

        let signed_phrase = match &self.keys {
            Some(keys) => {
                let challenge = self.client.challenge_phrase(worker_id.as_str()).await?;
                keys.secret.sign_detached(&challenge).to_hex()
            }
            None => String::new(),
        };
        let request = PollRequest {
            worker_id,
            last_worker_model_version: self.hooks.current_version(),
            signed_phrase,
        };

        let frame = self.client.poll_global_model(&request).await?;
        match wire::open_frame(&frame) {
            Ok(bundle) => Ok(bundle),
            // not a frame: the server answered with a sentinel or an error
            Err(_) => {
                let text = String::from_utf8_lossy(&frame).into_owned();
                Err(match text.as_str() {
                    INVALID_WORKER => WorkerError::Rejected,
                    UNREGISTERED_WORKER => WorkerError::Unregistered,
                    _ => WorkerError::Server(text),
                })
            }
        }
    }

    /// Runs the main worker loop: register, then deliver every new artifact
    /// version to the hooks until an error stops the loop.
    pub async fn run(&mut self) -> Result<(), WorkerError<C::Error>> {
        self.register().await?;
        loop {
            let bundle = self.poll_round().await?;
            info!(version = %bundle.version, "received a new global model");
            self.hooks.on_global_model(bundle);
        }
    }

    /// Submits one update payload, compressed and signed over its digest.
    /// The coordinator's response body is returned verbatim.
    pub async fn send_update(&mut self, payload: &[u8]) -> Result<String, WorkerError<C::Error>> {
        let worker_id = self.worker_id.clone().ok_or(WorkerError::NotRegistered)?;

        let compressed = wire::compress(payload).map_err(WorkerError::Frame)?;
        let signed_phrase = match &self.keys {
            Some(keys) => keys
                .secret
                .sign_detached(Sha256::hash(payload).as_slice())
                .to_hex(),
            None => String::new(),
        };
        Ok(self
            .client
            .send_update(worker_id.as_str(), compressed, &signed_phrase)
            .await?)
    }
}
