//! Key Material Types
//!
//! The single stored representation of every piece of local key material.
//! The same shapes make up the plaintext [`KeySet`] that goes into backups.

use std::fmt;

use serde::{Deserialize, Serialize};
use vc_common::encoding::base64_bytes;
use vc_common::PublicPreKeyBundle;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identity of this device.
///
/// The secret halves of the identity, the one-time prekeys and the signed
/// prekey all live in the pickled Olm account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEntry {
    /// `curve25519_public || ed25519_public`.
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// Pickled Olm account.
    pub account: String,
}

impl fmt::Debug for IdentityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityEntry")
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

/// Published one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyEntry {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

/// Signed prekey: the account's fallback key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyEntry {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `public_key` by the identity key.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// Plaintext export of the complete local key set.
///
/// Only ever leaves the device inside an encrypted backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySet {
    pub identity_key_pair: IdentityEntry,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyEntry,
    pub pre_keys: Vec<PreKeyEntry>,
    /// When this key set was generated, in milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// Metadata about the local key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStoreMetadata {
    /// User ID that owns this key store.
    pub user_id: String,
    /// Device ID for this client instance.
    pub device_id: String,
    /// When the local key set was generated or imported (Unix millis).
    pub created_at: i64,
    /// Local keys exist that were never uploaded as a backup.
    pub pending_backup: bool,
    /// The public bundle has not reached the backend since it last changed.
    #[serde(default)]
    pub pending_publish: bool,
}

/// Result of generating a fresh identity.
#[derive(Debug, Clone)]
pub struct GeneratedIdentity {
    /// Serialized identity public key.
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    /// Public-only bundle ready for publication.
    pub bundle: PublicPreKeyBundle,
}
