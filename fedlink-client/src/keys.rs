//! Loading of the worker's signing identity from key files.
//!
//! The deployment format matches the server's key list: the private key is
//! stored hex encoded in one file, the public key hex encoded in a sibling
//! file named `<private_key_file>.pub`.

use std::{fs, path::Path};

use thiserror::Error;

use fedlink_core::crypto::{ByteObject, PublicSigningKey, SecretSigningKey, SigningKeyPair};

#[derive(Debug, Error)]
/// An error related to reading a worker key pair from disk.
pub enum KeyFileError {
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("the private key file does not hold a valid hex Ed25519 secret key")]
    InvalidSecretKey,
    #[error("the public key file does not hold a valid hex Ed25519 public key")]
    InvalidPublicKey,
    #[error("the public key does not belong to the private key")]
    MismatchedPair,
}

/// Loads the signing key pair stored at `private_key_file` (and its `.pub`
/// sibling), verifying that the two halves belong together.
pub fn load_key_pair(private_key_file: impl AsRef<Path>) -> Result<SigningKeyPair, KeyFileError> {
    let private_key_file = private_key_file.as_ref();
    let secret_hex = fs::read_to_string(private_key_file)?;
    let secret =
        SecretSigningKey::from_hex(secret_hex.trim()).ok_or(KeyFileError::InvalidSecretKey)?;

    let mut public_key_file = private_key_file.as_os_str().to_os_string();
    public_key_file.push(".pub");
    let public_hex = fs::read_to_string(&public_key_file)?;
    let public =
        PublicSigningKey::from_hex(public_hex.trim()).ok_or(KeyFileError::InvalidPublicKey)?;

    if secret.public_key() != public {
        return Err(KeyFileError::MismatchedPair);
    }
    Ok(SigningKeyPair { public, secret })
}
