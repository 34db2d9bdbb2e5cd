//! Crypto error types.

use thiserror::Error;

/// Errors from Olm operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A public key or signature has the wrong size or encoding.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signature did not verify against the identity key.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Pickled state could not be decrypted or parsed.
    #[error("Pickle error: {0}")]
    Pickle(String),

    /// Message bytes are not a valid Olm message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Inbound session creation failed.
    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    /// Decryption failed.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// No session with the peer.
    #[error("No session with {0}")]
    NoSession(String),
}

/// Crypto result type.
pub type Result<T> = std::result::Result<T, CryptoError>;
