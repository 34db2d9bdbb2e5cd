//! Key Exchange Types
//!
//! JSON shapes exchanged with the key backend. Binary fields are base64.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a single device belonging to a peer.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddress {
    /// The peer's user ID.
    pub user_id: String,
    /// The peer's device number.
    pub device_id: u32,
}

impl PeerAddress {
    /// Create an address for `user_id`'s device `device_id`.
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicPreKey {
    /// Key ID.
    pub id: u32,
    /// X25519 public key (base64).
    pub public_key: String,
}

/// Public half of the signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSignedPreKey {
    /// Key ID.
    pub id: u32,
    /// X25519 public key (base64).
    pub public_key: String,
    /// Ed25519 signature over the public key by the identity key (base64).
    pub signature: String,
}

/// Bundle published to the backend so peers can start sessions with us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicPreKeyBundle {
    /// Identity public key (base64).
    pub identity_key: String,
    /// Registration ID of the publishing device.
    pub registration_id: u32,
    /// Current signed prekey.
    pub signed_pre_key: PublicSignedPreKey,
    /// One-time prekeys available for claiming.
    pub pre_keys: Vec<PublicPreKey>,
}

impl PublicPreKeyBundle {
    /// Build the bundle a peer receives after claiming one of our prekeys.
    ///
    /// Takes the first one-time prekey if any are left.
    #[must_use]
    pub fn claim(&self) -> ClaimedPreKeyBundle {
        ClaimedPreKeyBundle {
            identity_key: Some(self.identity_key.clone()),
            registration_id: Some(self.registration_id),
            signed_pre_key: Some(self.signed_pre_key.clone()),
            pre_key: self.pre_keys.first().cloned(),
        }
    }
}

/// Bundle received from the backend for a peer device.
///
/// Every field is optional because the value is untrusted input; the session
/// layer validates it before any cryptographic use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedPreKeyBundle {
    /// Identity public key (base64).
    #[serde(default)]
    pub identity_key: Option<String>,
    /// Registration ID of the peer device.
    #[serde(default)]
    pub registration_id: Option<u32>,
    /// Signed prekey.
    #[serde(default)]
    pub signed_pre_key: Option<PublicSignedPreKey>,
    /// One claimed one-time prekey, if the peer had any left.
    #[serde(default)]
    pub pre_key: Option<PublicPreKey>,
}

/// Password-encrypted backup of a full key set, as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyBundle {
    /// AEAD ciphertext including the tag (base64).
    pub encrypted: String,
    /// AEAD nonce (base64).
    pub iv: String,
    /// KDF salt (base64).
    pub salt: String,
    /// Backup format version.
    pub version: u32,
    /// Device the backup belongs to.
    pub device_id: String,
}
