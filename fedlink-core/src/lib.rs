#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedlink: worker coordination for federated aggregation
//!
//! Fedlink coordinates a central aggregator with many independent workers
//! that each hold a private update and periodically receive a shared,
//! versioned artifact reflecting aggregated contributions. The artifact is
//! an opaque blob exchanged between mutually distrusting parties over an
//! untrusted network; fedlink transports it but never inspects it.
//!
//! This crate holds the vocabulary shared between the aggregator-side
//! server (`fedlink-server`) and the worker-side client (`fedlink-client`):
//!
//! - the `Ed25519`/`SHA256` wrappers of the [`crypto`] module, which carry
//!   the challenge/response authentication scheme,
//! - [`WorkerId`] and [`VersionToken`], the opaque identifiers of the
//!   protocol,
//! - the request/response shapes and the compressed artifact frame codec of
//!   the [`wire`] module.

#[macro_use]
extern crate serde;

pub mod crypto;
pub mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

use derive_more::{Display, From, Into};
use sodiumoxide::randombytes::randombytes;

use self::crypto::{ByteObject, PublicSigningKey, Sha256};

/// Sentinel response body for requests from an identity the server does not
/// know or could not authenticate.
pub const INVALID_WORKER: &str = "Invalid Worker";

/// Sentinel response body for requests from a known identity that is not
/// currently registered.
pub const UNREGISTERED_WORKER: &str = "Unregistered Worker";

/// Suffix tagging worker identifiers that were allocated without
/// authentication.
pub const UNAUTHENTICATED_SUFFIX: &str = "_unauthenticated";

#[derive(
    Debug, Display, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, From, Into, Serialize, Deserialize,
)]
#[serde(transparent)]
/// The opaque identifier of a worker.
///
/// A worker id is chosen once, at registration time, and never re-derived
/// implicitly afterwards. For an authenticated worker it is the hex encoding
/// of the worker's `Ed25519` public key; when authentication is disabled it
/// is a fresh random token tagged with [`UNAUTHENTICATED_SUFFIX`].
pub struct WorkerId(String);

impl WorkerId {
    /// Derives the identifier of an authenticated worker from its public key.
    pub fn from_public_key(pk: &PublicSigningKey) -> Self {
        Self(pk.to_hex())
    }

    /// Allocates a probabilistically-unique identifier for a worker the
    /// server could not (and was not configured to) authenticate.
    ///
    /// The id is derived from a hash over the current time and fresh random
    /// bytes rather than from any client-submitted string, so that clients
    /// cannot collide with or spoof each other's identities.
    pub fn new_unauthenticated() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let mut seed = nanos.to_le_bytes().to_vec();
        seed.extend_from_slice(&randombytes(16));
        Self(format!(
            "{}{}",
            Sha256::hash(&seed).to_hex(),
            UNAUTHENTICATED_SUFFIX
        ))
    }

    /// Whether this id was allocated without authentication.
    pub fn is_unauthenticated(&self) -> bool {
        self.0.ends_with(UNAUTHENTICATED_SUFFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(
    Debug, Display, Clone, Eq, PartialEq, Hash, From, Into, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
/// The opaque version identifier of a global artifact.
///
/// Version tokens are compared **for equality only**: a newer artifact is
/// one whose token differs from the token the worker already reports
/// holding. Tokens carry no ordering; they need not be sequential integers.
pub struct VersionToken(String);

impl VersionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VersionToken {
    fn from(version: &str) -> Self {
        Self(version.to_string())
    }
}
