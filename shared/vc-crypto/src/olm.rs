//! Olm Session Management
//!
//! Double Ratchet protocol for 1:1 encrypted communication.
//!
//! A device's [`IdentityKey`] pairs its Curve25519 key (used by the 3DH
//! handshake) with its Ed25519 key (used to sign the published fallback key).

use vodozemac::olm::{
    Account, AccountPickle, OlmMessage as RawMessage, Session, SessionConfig, SessionPickle,
};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::{CryptoError, Result};

/// Serialized identity key size: `curve25519 || ed25519`.
pub const IDENTITY_KEY_LEN: usize = 64;

/// Curve25519 public key size.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_LEN: usize = 64;

/// Parse a Curve25519 public key.
pub fn curve25519_key(bytes: &[u8]) -> Result<Curve25519PublicKey> {
    Curve25519PublicKey::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Public identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityKey {
    curve25519: Curve25519PublicKey,
    ed25519: Ed25519PublicKey,
}

impl IdentityKey {
    /// Parse `curve25519 || ed25519`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IDENTITY_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "identity key must be {IDENTITY_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let (curve, ed) = bytes.split_at(PUBLIC_KEY_LEN);
        let mut ed_bytes = [0u8; PUBLIC_KEY_LEN];
        ed_bytes.copy_from_slice(ed);

        Ok(Self {
            curve25519: curve25519_key(curve)?,
            ed25519: Ed25519PublicKey::from_slice(&ed_bytes)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_LEN] {
        let mut out = [0u8; IDENTITY_KEY_LEN];
        out[..PUBLIC_KEY_LEN].copy_from_slice(self.curve25519.as_bytes());
        out[PUBLIC_KEY_LEN..].copy_from_slice(self.ed25519.as_bytes());
        out
    }

    /// The key-agreement half, which is what sessions authenticate.
    #[must_use]
    pub const fn curve25519(&self) -> Curve25519PublicKey {
        self.curve25519
    }

    /// Check an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature =
            Ed25519Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        self.ed25519
            .verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// One-time keys added and evicted by a generation call.
#[derive(Debug, Clone, Default)]
pub struct GeneratedKeys {
    pub created: Vec<Curve25519PublicKey>,
    pub removed: Vec<Curve25519PublicKey>,
}

/// User's Olm account containing identity keys.
pub struct OlmAccount {
    inner: Account,
}

impl OlmAccount {
    /// Create a new Olm account.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Account::new(),
        }
    }

    #[must_use]
    pub fn identity_key(&self) -> IdentityKey {
        let keys = self.inner.identity_keys();
        IdentityKey {
            curve25519: keys.curve25519,
            ed25519: keys.ed25519,
        }
    }

    /// Sign `message` with the Ed25519 identity key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.inner.sign(message).to_bytes()
    }

    /// Generate `count` one-time keys.
    ///
    /// The account keeps a bounded number; the oldest are evicted and
    /// reported in [`GeneratedKeys::removed`].
    pub fn generate_one_time_keys(&mut self, count: usize) -> GeneratedKeys {
        let result = self.inner.generate_one_time_keys(count);
        GeneratedKeys {
            created: result.created,
            removed: result.removed,
        }
    }

    /// Rotate the fallback key and return the new public key.
    ///
    /// The fallback key is never consumed, so sessions can start even when
    /// every one-time key has been claimed.
    pub fn generate_fallback_key(&mut self) -> Result<Curve25519PublicKey> {
        self.inner.generate_fallback_key();
        self.inner
            .fallback_key()
            .values()
            .next()
            .copied()
            .ok_or_else(|| CryptoError::InvalidKey("fallback key was not generated".into()))
    }

    /// Start a session with a peer from their identity and a claimed key.
    #[must_use]
    pub fn create_outbound_session(
        &self,
        their_identity: &IdentityKey,
        their_one_time_key: Curve25519PublicKey,
    ) -> OlmSession {
        OlmSession {
            inner: self.inner.create_outbound_session(
                SessionConfig::version_2(),
                their_identity.curve25519,
                their_one_time_key,
            ),
        }
    }

    /// Accept a session from a prekey message.
    ///
    /// Consumes the referenced one-time key; the caller must persist the
    /// account afterwards. Returns the session and the first plaintext.
    pub fn create_inbound_session(
        &mut self,
        message: &OlmMessage,
    ) -> Result<(OlmSession, Vec<u8>)> {
        let RawMessage::PreKey(pre_key) = &message.inner else {
            return Err(CryptoError::InvalidMessage(
                "expected a prekey message".into(),
            ));
        };
        let result = self
            .inner
            .create_inbound_session(pre_key.identity_key(), pre_key)
            .map_err(|e| CryptoError::SessionCreation(e.to_string()))?;
        Ok((
            OlmSession {
                inner: result.session,
            },
            result.plaintext,
        ))
    }

    /// Pickle the account, encrypted under `pickle_key`.
    #[must_use]
    pub fn serialize(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    pub fn deserialize(pickled: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickle = AccountPickle::from_encrypted(pickled, pickle_key)
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(Self {
            inner: Account::from_pickle(pickle),
        })
    }
}

impl Default for OlmAccount {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of an Olm message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Carries the handshake; sent until the peer replies.
    PreKey,
    Normal,
}

impl MessageType {
    const fn code(self) -> usize {
        match self {
            Self::PreKey => 0,
            Self::Normal => 1,
        }
    }
}

/// An encrypted Olm message.
#[derive(Debug, Clone)]
pub struct OlmMessage {
    inner: RawMessage,
}

impl OlmMessage {
    /// Parse message bytes of a known type.
    pub fn from_parts(message_type: MessageType, body: &[u8]) -> Result<Self> {
        RawMessage::from_parts(message_type.code(), body)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::InvalidMessage(e.to_string()))
    }

    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self.inner {
            RawMessage::PreKey(_) => MessageType::PreKey,
            RawMessage::Normal(_) => MessageType::Normal,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_parts().1
    }

    /// Sender's Curve25519 identity key, for prekey messages.
    #[must_use]
    pub fn sender_key(&self) -> Option<Curve25519PublicKey> {
        match &self.inner {
            RawMessage::PreKey(m) => Some(m.identity_key()),
            RawMessage::Normal(_) => None,
        }
    }

    /// Our one-time (or fallback) key the sender used, for prekey messages.
    #[must_use]
    pub fn one_time_key(&self) -> Option<Curve25519PublicKey> {
        match &self.inner {
            RawMessage::PreKey(m) => Some(m.one_time_key()),
            RawMessage::Normal(_) => None,
        }
    }
}

/// An Olm session for encrypted 1:1 communication.
pub struct OlmSession {
    inner: Session,
}

impl OlmSession {
    /// Encrypt a message. Advances the ratchet; persist the session after.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> OlmMessage {
        OlmMessage {
            inner: self.inner.encrypt(plaintext),
        }
    }

    /// Decrypt a message. Advances the ratchet; persist the session after.
    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<Vec<u8>> {
        self.inner
            .decrypt(&message.inner)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    /// Whether a prekey message belongs to this session.
    #[must_use]
    pub fn matches(&self, message: &OlmMessage) -> bool {
        match &message.inner {
            RawMessage::PreKey(m) => self.inner.session_keys() == m.session_keys(),
            RawMessage::Normal(_) => false,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Pickle the session, encrypted under `pickle_key`.
    #[must_use]
    pub fn serialize(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    pub fn deserialize(pickled: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickle = SessionPickle::from_encrypted(pickled, pickle_key)
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(Self {
            inner: Session::from_pickle(pickle),
        })
    }
}
