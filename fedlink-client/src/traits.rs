use async_trait::async_trait;

use fedlink_core::{wire::GlobalModel, wire::PollRequest, VersionToken};

/// A transport capable of reaching the coordinator's protocol routes.
///
/// [`Worker`] drives any implementation of this trait; the crate ships the
/// HTTP(S) one as [`Client`].
///
/// [`Worker`]: crate::Worker
/// [`Client`]: crate::Client
#[async_trait]
pub trait CoordinatorClient {
    type Error: ::std::error::Error + 'static;

    /// `POST /register_worker`. Returns the response body verbatim: the
    /// assigned worker id, or a rejection sentinel.
    async fn register(
        &mut self,
        public_key_hex: &str,
        signed_phrase: &str,
    ) -> Result<String, Self::Error>;

    /// `GET /challenge_phrase/{context}`. Returns the opaque single-use
    /// phrase to sign.
    async fn challenge_phrase(&mut self, context: &str) -> Result<Vec<u8>, Self::Error>;

    /// `POST /return_global_model`. Held open by the server until a version
    /// newer than the one in `request` exists; returns the raw response
    /// bytes (an artifact frame, or a sentinel).
    async fn poll_global_model(&mut self, request: &PollRequest) -> Result<Vec<u8>, Self::Error>;

    /// `POST /receive_worker_update/{worker_id}`. Returns the response body
    /// verbatim.
    async fn send_update(
        &mut self,
        worker_id: &str,
        compressed_payload: Vec<u8>,
        signed_phrase: &str,
    ) -> Result<String, Self::Error>;
}

/// The embedding application's side of the worker loop.
pub trait WorkerHooks {
    /// A newer global artifact arrived. Called synchronously before the
    /// worker polls again, so the application observes every delivered
    /// version in order.
    fn on_global_model(&mut self, model: GlobalModel);

    /// The version of the last global artifact this worker received, bound
    /// into the next long poll.
    fn current_version(&self) -> VersionToken;
}
