//! Request/response shapes of the coordination protocol and the compressed
//! frame codec for artifact transport.
//!
//! The JSON bodies below are a wire contract shared with non-Rust clients;
//! field names must not change. The artifact itself travels as a zlib
//! compressed bincode frame of [`GlobalModel`] so that large blobs do not
//! pay JSON encoding overhead.

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use thiserror::Error;

use crate::{VersionToken, WorkerId};

/// Multipart part name carrying the compressed update payload.
pub const WORKER_MODEL_UPDATE_PART: &str = "worker_model_update";
/// Multipart part name carrying the hex signature over the payload digest.
pub const SIGNED_PHRASE_PART: &str = "signed_phrase";

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Body of `POST /register_worker`.
pub struct RegistrationRequest {
    /// Hex encoding of the worker's `Ed25519` public key.
    pub public_key_str: String,
    /// Hex detached signature over the challenge phrase issued for
    /// `public_key_str`. Ignored when the server runs without
    /// authentication.
    #[serde(default)]
    pub signed_phrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Body of `POST /return_global_model`.
pub struct PollRequest {
    pub worker_id: WorkerId,
    /// The version the worker already holds; the request resolves once the
    /// current version differs from it.
    pub last_worker_model_version: VersionToken,
    /// Hex detached signature over the challenge phrase issued for
    /// `worker_id`.
    #[serde(default)]
    pub signed_phrase: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// One row of the admin worker listing, also the reply to add/set-status.
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub registered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Reply to `DELETE /workers/{worker_id}` (admin).
pub struct AdminRemoved {
    pub worker_id: WorkerId,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Structured admin error reply.
pub struct AdminError {
    pub error: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// The current global artifact together with its version token.
///
/// The `model` bytes are owned by the aggregation collaborator and are never
/// inspected by the coordination layer.
pub struct GlobalModel {
    pub model: Vec<u8>,
    pub version: VersionToken,
}

#[derive(Debug, Error)]
/// An error related to sealing or opening wire frames.
pub enum FrameError {
    #[error("failed to serialize frame: {0}")]
    Serialize(bincode::Error),
    #[error("failed to deserialize frame: {0}")]
    Deserialize(bincode::Error),
    #[error("failed to compress frame: {0}")]
    Compress(std::io::Error),
    #[error("failed to decompress frame: {0}")]
    Decompress(std::io::Error),
}

/// Compresses raw bytes with zlib.
pub fn compress(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).map_err(FrameError::Compress)?;
    encoder.finish().map_err(FrameError::Compress)
}

/// Decompresses zlib compressed bytes.
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .map_err(FrameError::Decompress)?;
    Ok(payload)
}

/// Seals a model bundle into the compressed frame sent on the long-poll
/// response path.
pub fn seal_frame(bundle: &GlobalModel) -> Result<Vec<u8>, FrameError> {
    let encoded = bincode::serialize(bundle).map_err(FrameError::Serialize)?;
    compress(&encoded)
}

/// Opens a frame produced by [`seal_frame`].
pub fn open_frame(frame: &[u8]) -> Result<GlobalModel, FrameError> {
    let encoded = decompress(frame)?;
    bincode::deserialize(&encoded).map_err(FrameError::Deserialize)
}
