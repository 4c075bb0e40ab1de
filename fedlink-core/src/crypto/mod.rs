//! Wrappers around some of the [sodiumoxide] crypto primitives.
//!
//! The wrappers provide methods defined on structs instead of the sodiumoxide
//! functions. This is done for the `Ed25519` signature key pairs as well as
//! the `SHA256` hash function, which together carry the whole authentication
//! scheme of the protocol: workers prove possession of a signing key by
//! signing server-issued challenge phrases and update payload digests.
//!
//! # Examples
//! ## Signing of messages
//! ```
//! # use fedlink_core::crypto::SigningKeyPair;
//! let keys = SigningKeyPair::generate();
//! let message = b"Hello world!".to_vec();
//! let signature = keys.secret.sign_detached(&message);
//! assert!(keys.public.verify_detached(&signature, &message));
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

pub(crate) mod hash;
pub(crate) mod sign;

use sodiumoxide::randombytes::randombytes;

pub use self::{
    hash::Sha256,
    sign::{PublicSigningKey, SecretSigningKey, Signature, SigningKeyPair},
};

/// An interface for slicing into cryptographic byte objects.
pub trait ByteObject: Sized {
    /// Length in bytes of this object
    const LENGTH: usize;

    /// Creates a new object with all the bytes initialized to `0`.
    fn zeroed() -> Self;

    /// Gets the object byte representation.
    fn as_slice(&self) -> &[u8];

    /// Creates an object from the given buffer.
    ///
    /// # Errors
    /// Returns `None` if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    /// Creates an object from the given buffer.
    ///
    /// # Panics
    /// Panics if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice_unchecked(bytes: &[u8]) -> Self {
        Self::from_slice(bytes).unwrap()
    }

    /// Generates an object with random bytes
    fn generate() -> Self {
        // safe unwrap: length of slice is guaranteed by constants
        Self::from_slice_unchecked(randombytes(Self::LENGTH).as_slice())
    }

    /// A helper for instantiating an object filled with the given value
    fn fill_with(value: u8) -> Self {
        Self::from_slice_unchecked(&vec![value; Self::LENGTH])
    }

    /// Gets the object representation as a lowercase hex string.
    fn to_hex(&self) -> String {
        hex::encode(self.as_slice())
    }

    /// Creates an object from its hex string representation.
    ///
    /// # Errors
    /// Returns `None` if the string is not valid hex or decodes to the wrong
    /// length.
    fn from_hex(encoded: &str) -> Option<Self> {
        hex::decode(encoded).ok().and_then(|b| Self::from_slice(&b))
    }
}
