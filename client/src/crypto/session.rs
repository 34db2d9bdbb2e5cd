//! Session Coordinator
//!
//! Starts sessions from claimed prekey bundles and encrypts or decrypts
//! messages. All cryptography is done by `vc-crypto`; every read and write of
//! key material goes through the key store's [`OlmStoreAdapter`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use vc_common::{encoding, ClaimedPreKeyBundle, PeerAddress};
use vc_crypto::olm::{curve25519_key, IdentityKey, MessageType, OlmMessage, OlmSession};
use vc_crypto::types::Curve25519PublicKey;
use vc_crypto::CryptoError;

use super::adapter::{AdapterError, OlmStoreAdapter};
use super::manager::fingerprint;
use super::store::{KeyStore, KeyStoreError};

/// Maximum plaintext size (100 KiB).
pub const MAX_PLAINTEXT_LEN: usize = 102_400;

/// Maximum encoded ciphertext size (200 KiB).
pub const MAX_CIPHERTEXT_LEN: usize = 204_800;

const BOOTSTRAP_CODE: u8 = 3;
const CONTINUATION_CODE: u8 = 1;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Key store error.
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Claimed bundle is missing fields or has malformed keys.
    #[error("Invalid prekey bundle: {0}")]
    InvalidBundle(String),

    /// The cipher produced no output.
    #[error("Encryption produced an empty ciphertext")]
    EmptyCiphertext,

    /// Input exceeds the size limit.
    #[error("Message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Message body is not valid transport encoding.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A new session was offered under a different identity than the one
    /// recorded for the peer.
    #[error("Untrusted identity for {0}")]
    UntrustedIdentity(PeerAddress),

    /// Error from the Olm layer.
    #[error("Protocol error (session existed: {session_existed}): {source}")]
    Protocol {
        #[source]
        source: CryptoError,
        session_existed: bool,
    },
}

/// Session result type.
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    fn from_adapter(error: AdapterError, session_existed: bool) -> Self {
        match error {
            AdapterError::KeyStore(e) => Self::KeyStore(e),
            AdapterError::Crypto(source) => Self::Protocol {
                source,
                session_existed,
            },
        }
    }
}

/// Kind of an encrypted message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum WireMessageType {
    /// Establishes the session from the embedded prekey reference (type 3).
    Bootstrap,
    /// Requires an existing session (type 1).
    Continuation,
}

impl From<WireMessageType> for u8 {
    fn from(value: WireMessageType) -> Self {
        match value {
            WireMessageType::Bootstrap => BOOTSTRAP_CODE,
            WireMessageType::Continuation => CONTINUATION_CODE,
        }
    }
}

impl TryFrom<u8> for WireMessageType {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            BOOTSTRAP_CODE => Ok(Self::Bootstrap),
            CONTINUATION_CODE => Ok(Self::Continuation),
            _ => Err(format!("unknown message type {code}")),
        }
    }
}

impl From<MessageType> for WireMessageType {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::PreKey => Self::Bootstrap,
            MessageType::Normal => Self::Continuation,
        }
    }
}

impl From<WireMessageType> for MessageType {
    fn from(value: WireMessageType) -> Self {
        match value {
            WireMessageType::Bootstrap => Self::PreKey,
            WireMessageType::Continuation => Self::Normal,
        }
    }
}

/// Encrypted message as sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    #[serde(rename = "type")]
    pub message_type: WireMessageType,
    /// Ciphertext (base64).
    pub body: String,
    /// Sender's registration ID.
    pub registration_id: u32,
}

/// Claimed bundle after structural validation.
struct ParsedBundle {
    identity: IdentityKey,
    signed_pre_key: Curve25519PublicKey,
    signature: [u8; 64],
    pre_key: Option<(u32, Curve25519PublicKey)>,
}

impl ParsedBundle {
    /// Key the outbound session is built on: the one-time prekey if the
    /// backend handed one out, otherwise the signed prekey.
    fn session_key(&self) -> Curve25519PublicKey {
        self.pre_key.map_or(self.signed_pre_key, |(_, key)| key)
    }
}

fn parse_bundle(peer: &PeerAddress, bundle: &ClaimedPreKeyBundle) -> Result<ParsedBundle> {
    let invalid = |what: &str| SessionError::InvalidBundle(format!("{what} for {peer}"));
    let bad = |e: &dyn std::fmt::Display| SessionError::InvalidBundle(e.to_string());

    let identity_key = bundle
        .identity_key
        .as_deref()
        .ok_or_else(|| invalid("missing identity key"))?;
    bundle
        .registration_id
        .filter(|id| *id != 0)
        .ok_or_else(|| invalid("missing registration id"))?;
    let signed = bundle
        .signed_pre_key
        .as_ref()
        .ok_or_else(|| invalid("missing signed prekey"))?;

    let identity_key =
        encoding::decode_fixed::<64>("identityKey", identity_key).map_err(|e| bad(&e))?;
    let identity = IdentityKey::from_bytes(&identity_key).map_err(|e| bad(&e))?;
    let signed_public = encoding::decode_fixed::<32>("signedPreKey.publicKey", &signed.public_key)
        .map_err(|e| bad(&e))?;
    let signature = encoding::decode_fixed::<64>("signedPreKey.signature", &signed.signature)
        .map_err(|e| bad(&e))?;
    let pre_key = bundle
        .pre_key
        .as_ref()
        .map(|pk| {
            let bytes = encoding::decode_fixed::<32>("preKey.publicKey", &pk.public_key)
                .map_err(|e| bad(&e))?;
            let key = curve25519_key(&bytes).map_err(|e| bad(&e))?;
            Ok::<_, SessionError>((pk.id, key))
        })
        .transpose()?;

    Ok(ParsedBundle {
        identity,
        signed_pre_key: curve25519_key(&signed_public).map_err(|e| bad(&e))?,
        signature,
        pre_key,
    })
}

/// Use the body as-is if it is already canonical base64, otherwise encode it.
fn normalize_body(body: &[u8]) -> Result<String> {
    if body.is_empty() {
        return Err(SessionError::EmptyCiphertext);
    }
    if encoding::is_canonical(body) {
        return String::from_utf8(body.to_vec())
            .map_err(|e| SessionError::InvalidMessage(e.to_string()));
    }
    Ok(encoding::encode(body))
}

/// Session operations over a key store.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCoordinator;

impl SessionCoordinator {
    pub const fn new() -> Self {
        Self
    }

    /// Start a session with `peer` from a claimed bundle.
    ///
    /// The bundle is fully validated before any cryptographic call; on
    /// failure no session is stored. A bundle fetched from the backend is
    /// authoritative for the peer's identity, so a changed identity is
    /// recorded and logged.
    #[tracing::instrument(skip(self, store, bundle), fields(peer = %peer))]
    pub async fn bootstrap_session(
        &self,
        store: &KeyStore,
        peer: &PeerAddress,
        bundle: &ClaimedPreKeyBundle,
    ) -> Result<()> {
        let bundle = parse_bundle(peer, bundle)?;
        let session_existed = store.has_session(peer);
        let to_error = |e: AdapterError| SessionError::from_adapter(e, session_existed);

        bundle
            .identity
            .verify(bundle.signed_pre_key.as_bytes(), &bundle.signature)
            .map_err(|source| {
                warn!("Signed prekey signature rejected");
                SessionError::Protocol {
                    source,
                    session_existed,
                }
            })?;

        let adapter = OlmStoreAdapter::new(store);
        let account = adapter.load_account().map_err(to_error)?;
        let session = account.create_outbound_session(&bundle.identity, bundle.session_key());
        adapter
            .store_session(peer, &session)
            .await
            .map_err(to_error)?;

        let identity = bundle.identity.curve25519();
        if adapter
            .save_identity(peer, &identity)
            .await
            .map_err(to_error)?
        {
            warn!(
                fingerprint = %fingerprint(identity.as_bytes()),
                "Peer identity changed"
            );
        }

        info!(
            one_time_prekey = bundle.pre_key.map(|(id, _)| id),
            "Session established"
        );
        Ok(())
    }

    /// Encrypt `plaintext` for `peer`.
    pub async fn encrypt(
        &self,
        store: &KeyStore,
        peer: &PeerAddress,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(SessionError::MessageTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        let registration_id = store
            .registration_id()
            .ok_or(KeyStoreError::Missing("registration id"))?;

        let adapter = OlmStoreAdapter::new(store);
        let mut session = adapter
            .load_session(peer)
            .map_err(|e| SessionError::from_adapter(e, true))?
            .ok_or_else(|| SessionError::Protocol {
                source: CryptoError::NoSession(peer.to_string()),
                session_existed: false,
            })?;

        let ciphertext = session.encrypt(plaintext);
        adapter
            .store_session(peer, &session)
            .await
            .map_err(|e| SessionError::from_adapter(e, true))?;

        let message_type = WireMessageType::from(ciphertext.message_type());
        let body = normalize_body(&ciphertext.to_bytes())?;

        debug!(peer = %peer, ?message_type, "Encrypted message");
        Ok(EncryptedMessage {
            message_type,
            body,
            registration_id,
        })
    }

    /// Decrypt a message from `peer`.
    ///
    /// A bootstrap message that does not belong to the current session starts
    /// a new inbound session and consumes the one-time prekey it references.
    pub async fn decrypt(
        &self,
        store: &KeyStore,
        peer: &PeerAddress,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>> {
        if message.body.len() > MAX_CIPHERTEXT_LEN {
            return Err(SessionError::MessageTooLarge {
                size: message.body.len(),
                max: MAX_CIPHERTEXT_LEN,
            });
        }
        let body = encoding::decode("body", &message.body)
            .map_err(|e| SessionError::InvalidMessage(e.to_string()))?;
        if body.is_empty() {
            return Err(SessionError::EmptyCiphertext);
        }

        let session_existed = store.has_session(peer);
        let to_error = |e: AdapterError| SessionError::from_adapter(e, session_existed);
        let protocol_error = |source: CryptoError| SessionError::Protocol {
            source,
            session_existed,
        };

        let parsed = OlmMessage::from_parts(message.message_type.into(), &body)
            .map_err(protocol_error)?;
        let adapter = OlmStoreAdapter::new(store);
        let current = adapter.load_session(peer).map_err(to_error)?;

        let plaintext = match (message.message_type, current) {
            (WireMessageType::Bootstrap, Some(session)) if session.matches(&parsed) => {
                Self::decrypt_with(&adapter, peer, session, &parsed).await
            }
            (WireMessageType::Bootstrap, _) => {
                Self::accept_inbound(&adapter, peer, &parsed, session_existed).await
            }
            (WireMessageType::Continuation, Some(session)) => {
                Self::decrypt_with(&adapter, peer, session, &parsed).await
            }
            (WireMessageType::Continuation, None) => Err(protocol_error(
                CryptoError::NoSession(peer.to_string()),
            )),
        }
        .inspect_err(|e| warn!(peer = %peer, session_existed, "Decryption failed: {e}"))?;

        debug!(peer = %peer, "Decrypted message");
        Ok(plaintext)
    }

    async fn decrypt_with(
        adapter: &OlmStoreAdapter<'_>,
        peer: &PeerAddress,
        mut session: OlmSession,
        message: &OlmMessage,
    ) -> Result<Vec<u8>> {
        let plaintext = session
            .decrypt(message)
            .map_err(|e| SessionError::from_adapter(e.into(), true))?;
        adapter
            .store_session(peer, &session)
            .await
            .map_err(|e| SessionError::from_adapter(e, true))?;
        Ok(plaintext)
    }

    async fn accept_inbound(
        adapter: &OlmStoreAdapter<'_>,
        peer: &PeerAddress,
        message: &OlmMessage,
        session_existed: bool,
    ) -> Result<Vec<u8>> {
        let to_error = |e: AdapterError| SessionError::from_adapter(e, session_existed);
        let sender = message
            .sender_key()
            .ok_or_else(|| SessionError::InvalidMessage("bootstrap without sender key".into()))?;
        if !adapter.is_trusted_identity(peer, &sender) {
            return Err(SessionError::UntrustedIdentity(peer.clone()));
        }

        let mut account = adapter.load_account().map_err(to_error)?;
        let (session, plaintext) = account
            .create_inbound_session(message)
            .map_err(|e| to_error(e.into()))?;

        adapter.save_account(&account).await.map_err(to_error)?;
        if let Some(key) = message.one_time_key() {
            if let Some(id) = adapter.consume_pre_key(&key).await.map_err(to_error)? {
                debug!(pre_key_id = id, "Consumed one-time prekey");
            }
        }
        adapter
            .store_session(peer, &session)
            .await
            .map_err(to_error)?;
        adapter
            .save_identity(peer, &sender)
            .await
            .map_err(to_error)?;

        info!(peer = %peer, "Inbound session established");
        Ok(plaintext)
    }

    pub fn has_session(&self, store: &KeyStore, peer: &PeerAddress) -> bool {
        store.has_session(peer)
    }

    /// Drop the sessions with every device of `user_id`.
    pub async fn remove_sessions_with(&self, store: &KeyStore, user_id: &str) -> Result<usize> {
        let removed = store.remove_all_sessions(user_id).await?;
        if removed > 0 {
            info!(user_id, removed, "Removed sessions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::manager::KeyManager;
    use crate::crypto::storage::MemoryStorageProvider;

    async fn device(user: &str) -> (KeyStore, ClaimedPreKeyBundle) {
        let store = KeyStore::new(user, Arc::new(MemoryStorageProvider::new()));
        store.init().await.unwrap();
        let generated = KeyManager::new(5, 100)
            .generate_identity(&store, "dev")
            .await
            .unwrap();
        (store, generated.bundle.claim())
    }

    #[tokio::test]
    async fn test_bootstrap_and_exchange() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (bob, bob_bundle) = device("bob").await;
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        coordinator
            .bootstrap_session(&alice, &bob_addr, &bob_bundle)
            .await
            .unwrap();
        assert!(coordinator.has_session(&alice, &bob_addr));

        let first = coordinator
            .encrypt(&alice, &bob_addr, b"hello")
            .await
            .unwrap();
        assert_eq!(first.message_type, WireMessageType::Bootstrap);
        assert_eq!(first.registration_id, alice.registration_id().unwrap());

        let plaintext = coordinator
            .decrypt(&bob, &alice_addr, &first)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello");
        assert!(coordinator.has_session(&bob, &alice_addr));
        assert!(bob.pre_key(1).is_none());

        let reply = coordinator.encrypt(&bob, &alice_addr, b"hi").await.unwrap();
        assert_eq!(reply.message_type, WireMessageType::Continuation);
        assert_eq!(
            coordinator.decrypt(&alice, &bob_addr, &reply).await.unwrap(),
            b"hi"
        );
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (bob, bob_bundle) = device("bob").await;
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);
        coordinator
            .bootstrap_session(&alice, &bob_addr, &bob_bundle)
            .await
            .unwrap();

        let first = coordinator.encrypt(&alice, &bob_addr, b"one").await.unwrap();
        coordinator.decrypt(&bob, &alice_addr, &first).await.unwrap();
        let reply = coordinator.encrypt(&bob, &alice_addr, b"ack").await.unwrap();
        coordinator.decrypt(&alice, &bob_addr, &reply).await.unwrap();

        let second = coordinator.encrypt(&alice, &bob_addr, b"two").await.unwrap();
        let third = coordinator.encrypt(&alice, &bob_addr, b"three").await.unwrap();
        assert_eq!(third.message_type, WireMessageType::Continuation);

        assert_eq!(
            coordinator.decrypt(&bob, &alice_addr, &third).await.unwrap(),
            b"three"
        );
        assert_eq!(
            coordinator.decrypt(&bob, &alice_addr, &second).await.unwrap(),
            b"two"
        );
        assert!(matches!(
            coordinator.decrypt(&bob, &alice_addr, &second).await,
            Err(SessionError::Protocol {
                session_existed: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_signed_prekey_is_invalid_bundle() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (_, mut bundle) = device("bob").await;
        bundle.signed_pre_key = None;
        let bob_addr = PeerAddress::new("bob", 1);

        let result = coordinator.bootstrap_session(&alice, &bob_addr, &bundle).await;
        assert!(matches!(result, Err(SessionError::InvalidBundle(_))));
        assert!(!coordinator.has_session(&alice, &bob_addr));
    }

    #[tokio::test]
    async fn test_malformed_bundle_fields() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (_, good) = device("bob").await;
        let bob_addr = PeerAddress::new("bob", 1);

        let mut no_identity = good.clone();
        no_identity.identity_key = None;
        let mut bad_key = good.clone();
        bad_key.identity_key = Some(encoding::encode([1u8; 10]));
        let mut zero_registration = good.clone();
        zero_registration.registration_id = Some(0);
        let mut bad_pre_key = good;
        if let Some(pre_key) = bad_pre_key.pre_key.as_mut() {
            pre_key.public_key = "%%%".to_string();
        }

        for bundle in [no_identity, bad_key, zero_registration, bad_pre_key] {
            assert!(matches!(
                coordinator.bootstrap_session(&alice, &bob_addr, &bundle).await,
                Err(SessionError::InvalidBundle(_))
            ));
        }
        assert!(!coordinator.has_session(&alice, &bob_addr));
    }

    #[tokio::test]
    async fn test_continuation_without_session_reports_context() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (bob, bob_bundle) = device("bob").await;
        let bob_addr = PeerAddress::new("bob", 1);
        coordinator
            .bootstrap_session(&alice, &bob_addr, &bob_bundle)
            .await
            .unwrap();
        let first = coordinator.encrypt(&alice, &bob_addr, b"x").await.unwrap();

        // Relabel the bootstrap body as a continuation; bob has no session yet.
        let relabelled = EncryptedMessage {
            message_type: WireMessageType::Continuation,
            ..first
        };
        let result = coordinator
            .decrypt(&bob, &PeerAddress::new("alice", 1), &relabelled)
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Protocol {
                session_existed: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_encrypt_without_session() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let result = coordinator
            .encrypt(&alice, &PeerAddress::new("bob", 1), b"x")
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Protocol {
                source: CryptoError::NoSession(_),
                session_existed: false
            })
        ));
    }

    #[tokio::test]
    async fn test_forged_signed_prekey_is_rejected() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (_, mut bundle) = device("bob").await;
        let (_, mallory) = device("mallory").await;
        bundle.signed_pre_key = mallory.signed_pre_key;
        let bob_addr = PeerAddress::new("bob", 1);

        assert!(matches!(
            coordinator.bootstrap_session(&alice, &bob_addr, &bundle).await,
            Err(SessionError::Protocol {
                source: CryptoError::InvalidSignature,
                session_existed: false
            })
        ));
        assert!(!coordinator.has_session(&alice, &bob_addr));
    }

    #[tokio::test]
    async fn test_bootstrap_without_one_time_prekey() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (bob, mut bob_bundle) = device("bob").await;
        bob_bundle.pre_key = None;
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        coordinator
            .bootstrap_session(&alice, &bob_addr, &bob_bundle)
            .await
            .unwrap();
        let first = coordinator.encrypt(&alice, &bob_addr, b"one").await.unwrap();
        let second = coordinator.encrypt(&alice, &bob_addr, b"two").await.unwrap();
        assert_eq!(second.message_type, WireMessageType::Bootstrap);

        assert_eq!(
            coordinator.decrypt(&bob, &alice_addr, &first).await.unwrap(),
            b"one"
        );
        // The second bootstrap message lands in the same session.
        assert_eq!(
            coordinator.decrypt(&bob, &alice_addr, &second).await.unwrap(),
            b"two"
        );
        assert_eq!(bob.pre_key_ids(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_inbound_from_changed_identity_is_refused() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (bob, bob_bundle) = device("bob").await;
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);
        bob.save_identity(&alice_addr, &[7u8; 32]).await.unwrap();

        coordinator
            .bootstrap_session(&alice, &bob_addr, &bob_bundle)
            .await
            .unwrap();
        let first = coordinator.encrypt(&alice, &bob_addr, b"x").await.unwrap();

        assert!(matches!(
            coordinator.decrypt(&bob, &alice_addr, &first).await,
            Err(SessionError::UntrustedIdentity(_))
        ));
        assert!(!coordinator.has_session(&bob, &alice_addr));
        assert!(bob.pre_key(1).is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_records_peer_identity() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let (bob, bob_bundle) = device("bob").await;
        let bob_addr = PeerAddress::new("bob", 1);

        coordinator
            .bootstrap_session(&alice, &bob_addr, &bob_bundle)
            .await
            .unwrap();

        let bob_identity = bob.identity_key_pair().unwrap().public_key.clone();
        assert_eq!(
            alice.trusted_identity(&bob_addr).unwrap(),
            bob_identity[..32].to_vec()
        );
    }

    #[tokio::test]
    async fn test_size_limits() {
        let coordinator = SessionCoordinator::new();
        let (alice, _) = device("alice").await;
        let peer = PeerAddress::new("bob", 1);

        let big = vec![0u8; MAX_PLAINTEXT_LEN + 1];
        assert!(matches!(
            coordinator.encrypt(&alice, &peer, &big).await,
            Err(SessionError::MessageTooLarge { .. })
        ));

        let message = EncryptedMessage {
            message_type: WireMessageType::Continuation,
            body: "A".repeat(MAX_CIPHERTEXT_LEN + 4),
            registration_id: 1,
        };
        assert!(matches!(
            coordinator.decrypt(&alice, &peer, &message).await,
            Err(SessionError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_normalize_body() {
        assert!(matches!(normalize_body(b""), Err(SessionError::EmptyCiphertext)));
        assert_eq!(normalize_body(b"aGVsbG8=").unwrap(), "aGVsbG8=");
        assert_eq!(normalize_body(&[0xC3, 0x00]).unwrap(), encoding::encode([0xC3, 0x00]));
    }

    #[test]
    fn test_wire_message_shape() {
        let message = EncryptedMessage {
            message_type: WireMessageType::Bootstrap,
            body: "AAAA".to_string(),
            registration_id: 9,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], 3);
        assert_eq!(json["registrationId"], 9);

        let parsed: EncryptedMessage =
            serde_json::from_str(r#"{"type":1,"body":"AAAA","registrationId":9}"#).unwrap();
        assert_eq!(parsed.message_type, WireMessageType::Continuation);
        assert!(serde_json::from_str::<EncryptedMessage>(
            r#"{"type":2,"body":"AAAA","registrationId":9}"#
        )
        .is_err());
    }
}
