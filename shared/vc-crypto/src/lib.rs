//! `Kaiku` E2EE Cryptography
//!
//! Olm (Double Ratchet over a 3DH handshake) for 1:1 sessions, using vodozemac.
//! Callers own persistence: accounts and sessions go in and out as pickles.

pub mod error;
pub mod olm;

pub use error::{CryptoError, Result};

/// Re-export vodozemac types that are commonly needed.
pub mod types {
    pub use vodozemac::Curve25519PublicKey;
    pub use vodozemac::Ed25519PublicKey;
    pub use vodozemac::Ed25519Signature;
}
