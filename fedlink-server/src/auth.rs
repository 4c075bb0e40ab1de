//! Challenge/response authentication of workers.
//!
//! A worker proves possession of its `Ed25519` private key by signing a
//! challenge phrase the server issued for it. Phrases are unpredictable and
//! single use: a phrase is discarded the moment it is checked, so a captured
//! `(public key, signed phrase)` pair cannot be replayed. Update submissions
//! are authenticated differently, by a signature over the payload digest,
//! which binds the signature to the submitted bytes instead.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use tracing::warn;

use fedlink_core::crypto::{ByteObject, PublicSigningKey, Signature};

/// Length in bytes of an issued challenge phrase.
pub const CHALLENGE_LENGTH: usize = 32;

/// Verifies signed challenge phrases and payload digests against claimed
/// public-key identities.
///
/// When authentication is disabled (the server runs outside safe mode),
/// every verification trivially succeeds and callers are expected to
/// allocate unauthenticated worker ids instead of trusting client-submitted
/// identity strings.
pub struct Authenticator {
    enabled: bool,
    /// Most recently issued, not yet consumed phrase per context (worker id
    /// or public key string).
    challenges: Mutex<HashMap<String, Vec<u8>>>,
}

impl Authenticator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Whether signature verification is performed at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Issues a fresh, unpredictable challenge phrase for `context`,
    /// replacing any phrase issued earlier for the same context.
    pub fn issue_challenge(&self, context: &str) -> Vec<u8> {
        let phrase = sodiumoxide::randombytes::randombytes(CHALLENGE_LENGTH);
        self.challenges
            .lock()
            .unwrap()
            .insert(context.to_string(), phrase.clone());
        phrase
    }

    /// Consumes the phrase issued for `context`, if any. A phrase can be
    /// taken only once.
    fn take_challenge(&self, context: &str) -> Option<Vec<u8>> {
        self.challenges.lock().unwrap().remove(context)
    }

    /// Verifies the detached signature `signed_phrase_hex` over `expected`
    /// against the hex encoded public key.
    ///
    /// Returns `false` on any verification failure, malformed signature or
    /// undecodable key; the reason is logged but never reported to the
    /// caller.
    pub fn verify(&self, public_key_hex: &str, signed_phrase_hex: &str, expected: &[u8]) -> bool {
        if !self.enabled {
            return true;
        }
        let public_key = match PublicSigningKey::from_hex(public_key_hex) {
            Some(pk) => pk,
            None => {
                warn!("signature check failed: undecodable public key");
                return false;
            }
        };
        let signature = match Signature::from_hex(signed_phrase_hex) {
            Some(signature) => signature,
            None => {
                warn!("signature check failed: undecodable signature");
                return false;
            }
        };
        public_key.verify_detached(&signature, expected)
    }

    /// Verifies `signed_phrase_hex` against the single-use challenge issued
    /// for `context`, consuming it. Fails when no challenge is pending for
    /// the context.
    pub fn verify_challenge(
        &self,
        context: &str,
        public_key_hex: &str,
        signed_phrase_hex: &str,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        let phrase = match self.take_challenge(context) {
            Some(phrase) => phrase,
            None => {
                warn!("signature check failed: no challenge pending for context");
                return false;
            }
        };
        self.verify(public_key_hex, signed_phrase_hex, &phrase)
    }
}
