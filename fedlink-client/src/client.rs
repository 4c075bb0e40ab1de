//! An HTTP(S) transport for the coordination protocol.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use reqwest::{self, Certificate, ClientBuilder};
use thiserror::Error;

use fedlink_core::wire::{
    PollRequest,
    RegistrationRequest,
    SIGNED_PHRASE_PART,
    WORKER_MODEL_UPDATE_PART,
};

use crate::CoordinatorClient;

#[derive(Debug, Clone)]
/// A client that communicates with the coordinator's API via HTTP(S).
pub struct Client {
    /// HTTP client
    client: reqwest::Client,
    /// Coordinator URL
    address: Arc<String>,
}

impl Client {
    /// Creates a new HTTP(S) client.
    ///
    /// Pass trusted server `certificates` to pin the coordinator's TLS
    /// identity; `None` uses the platform trust store.
    pub fn new<S>(address: S, certificates: Option<Vec<Certificate>>) -> Result<Self, ClientError>
    where
        S: Into<String>,
    {
        let address = Arc::new(address.into());
        let certificates = match certificates {
            None => {
                return Ok(Self {
                    client: ClientBuilder::new().build().map_err(ClientError::Http)?,
                    address,
                });
            }
            Some(certificates) => certificates,
        };

        if certificates.is_empty() {
            return Err(ClientError::NoCertificate);
        }
        let mut builder = ClientBuilder::new().use_rustls_tls();
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }
        Ok(Self {
            client: builder.build().map_err(ClientError::Http)?,
            address,
        })
    }

    /// Reads DER and PEM certificates from given paths.
    pub fn certificates_from(paths: &[PathBuf]) -> Result<Vec<Certificate>, ClientError> {
        fn load_certificate(path: &Path) -> Result<Certificate, ClientError> {
            let encoding = fs::read(path).map_err(ClientError::Io)?;
            match path.extension().and_then(|extension| extension.to_str()) {
                Some("der") => Certificate::from_der(&encoding).map_err(ClientError::Http),
                Some("pem") => Certificate::from_pem(&encoding).map_err(ClientError::Http),
                _ => Err(ClientError::UnexpectedCertificate),
            }
        }

        if paths.is_empty() {
            Err(ClientError::NoCertificate)
        } else {
            paths.iter().map(|path| load_certificate(path)).collect()
        }
    }
}

/// Error returned by a [`Client`]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to serialize request: {0}")]
    Serialize(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Reading from file failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected certificate extension")]
    UnexpectedCertificate,

    #[error("No certificate found")]
    NoCertificate,
}

#[async_trait]
impl CoordinatorClient for Client {
    type Error = ClientError;

    async fn register(
        &mut self,
        public_key_hex: &str,
        signed_phrase: &str,
    ) -> Result<String, Self::Error> {
        let url = format!("{}/register_worker", self.address);
        let body = serde_json::to_vec(&RegistrationRequest {
            public_key_str: public_key_hex.to_string(),
            signed_phrase: signed_phrase.to_string(),
        })
        .map_err(|e| ClientError::Serialize(e.to_string()))?;
        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn challenge_phrase(&mut self, context: &str) -> Result<Vec<u8>, Self::Error> {
        let url = format!("{}/challenge_phrase/{}", self.address, context);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn poll_global_model(&mut self, request: &PollRequest) -> Result<Vec<u8>, Self::Error> {
        // deliberately no client-side timeout: the server holds this open
        // until a newer artifact version exists
        let url = format!("{}/return_global_model", self.address);
        let body =
            serde_json::to_vec(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn send_update(
        &mut self,
        worker_id: &str,
        compressed_payload: Vec<u8>,
        signed_phrase: &str,
    ) -> Result<String, Self::Error> {
        let url = format!("{}/receive_worker_update/{}", self.address, worker_id);
        let form = reqwest::multipart::Form::new()
            .part(
                WORKER_MODEL_UPDATE_PART,
                reqwest::multipart::Part::bytes(compressed_payload),
            )
            .part(
                SIGNED_PHRASE_PART,
                reqwest::multipart::Part::text(signed_phrase.to_string()),
            );
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }
}
