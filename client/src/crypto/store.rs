//! Local Key Store for E2EE
//!
//! Per-user key material with a write-through in-memory cache.
//!
//! Reads are synchronous and served from the cache once [`KeyStore::init`]
//! has run. Writes update the cache first and then persist; the returned
//! future completes when the durable write is done. Every row is sealed with
//! [`StoreCipher`] before it reaches the storage backend.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use vc_common::encoding::base64_bytes;
use vc_common::PeerAddress;
use vc_crypto::olm::{IDENTITY_KEY_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use zeroize::Zeroizing;

use super::sealing::StoreCipher;
use super::storage::{KeyValueStorage, StorageError, StorageProvider};
use super::types::{IdentityEntry, KeyStoreMetadata, PreKeyEntry, SignedPreKeyEntry};

/// Key store errors.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store was closed or never initialized.
    #[error("Key store is closed")]
    Closed,

    /// Required local key material is absent.
    #[error("Missing key material: {0}")]
    Missing(&'static str),
}

/// Key store result type.
pub type Result<T> = std::result::Result<T, KeyStoreError>;

const IDENTITY_KEY: &str = "identity_key";
const REGISTRATION_ID_KEY: &str = "registration_id";
const METADATA_KEY: &str = "metadata";
const PRE_KEY_PREFIX: &str = "prekey:";
const SIGNED_PRE_KEY_PREFIX: &str = "signed_prekey:";
const SESSION_PREFIX: &str = "session:";
const TRUSTED_IDENTITY_PREFIX: &str = "trusted_identity:";

fn pre_key_key(id: u32) -> String {
    format!("{PRE_KEY_PREFIX}{id}")
}

fn signed_pre_key_key(id: u32) -> String {
    format!("{SIGNED_PRE_KEY_PREFIX}{id}")
}

fn session_key(peer: &PeerAddress) -> String {
    format!("{SESSION_PREFIX}{peer}")
}

fn trusted_identity_key(peer: &PeerAddress) -> String {
    format!("{TRUSTED_IDENTITY_PREFIX}{peer}")
}

/// A single stored value, tagged with its kind.
///
/// Anything that does not decode into one of these variants, or decodes with
/// the wrong key lengths, is treated as absent.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
enum StoredRecord {
    Identity(IdentityEntry),
    RegistrationId(u32),
    PreKey(PreKeyEntry),
    SignedPreKey(SignedPreKeyEntry),
    /// Pickled Olm session.
    Session(String),
    /// Curve25519 identity key of a peer.
    TrustedIdentity(#[serde(with = "base64_bytes")] Vec<u8>),
    Metadata(KeyStoreMetadata),
}

impl StoredRecord {
    fn is_well_formed(&self) -> bool {
        match self {
            Self::Identity(e) => e.public_key.len() == IDENTITY_KEY_LEN && !e.account.is_empty(),
            Self::RegistrationId(id) => *id != 0,
            Self::PreKey(e) => e.key_id != 0 && e.public_key.len() == PUBLIC_KEY_LEN,
            Self::SignedPreKey(e) => {
                e.public_key.len() == PUBLIC_KEY_LEN && e.signature.len() == SIGNATURE_LEN
            }
            Self::Session(pickle) => !pickle.is_empty(),
            Self::TrustedIdentity(key) => key.len() == PUBLIC_KEY_LEN,
            Self::Metadata(_) => true,
        }
    }
}

/// Plaintext of one sealed row. The logical key travels inside the seal.
#[derive(Serialize)]
struct RowOut<'a> {
    key: &'a str,
    record: &'a StoredRecord,
}

#[derive(Deserialize)]
struct RowIn {
    key: String,
    record: StoredRecord,
}

struct OpenState {
    storage: Arc<dyn KeyValueStorage>,
    cipher: StoreCipher,
    cache: HashMap<String, StoredRecord>,
}

/// Durable per-user key store.
pub struct KeyStore {
    user_id: String,
    provider: Arc<dyn StorageProvider>,
    state: RwLock<Option<OpenState>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl KeyStore {
    /// Create a closed store for `user_id`. Call [`Self::init`] before use.
    pub fn new(user_id: impl Into<String>, provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
            state: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// User this store belongs to.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether the store is open.
    pub fn is_open(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Open durable storage and load every record into the cache.
    ///
    /// Does nothing if the store is already open. Rows that do not decrypt
    /// under the provider's key are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot open storage for this user.
    #[tracing::instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn init(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let cipher = StoreCipher::new(&*self.provider.encryption_key(&self.user_id)?);
        let storage: Arc<dyn KeyValueStorage> = Arc::from(self.provider.open(&self.user_id).await?);
        let rows = storage.load_all().await?;

        let mut cache = HashMap::with_capacity(rows.len());
        for (row_key, value) in rows {
            let Some(plaintext) = cipher.open(&value) else {
                warn!("Ignoring key store row that does not decrypt");
                continue;
            };
            match serde_json::from_str::<RowIn>(&plaintext) {
                // A row copied under another row key is not trusted.
                Ok(row) if cipher.row_key(&row.key) == row_key => {
                    cache.insert(row.key, row.record);
                }
                Ok(row) => warn!(key = %row.key, "Ignoring key store row under a foreign key"),
                Err(e) => warn!("Ignoring unreadable key store record: {e}"),
            }
        }

        info!(records = cache.len(), "Key store opened");
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(OpenState {
            storage,
            cipher,
            cache,
        });
        Ok(())
    }

    /// Release the storage handle and drop the cache.
    ///
    /// Reads return `None` and writes fail with [`KeyStoreError::Closed`]
    /// until the next [`Self::init`].
    pub fn close(&self) {
        let previous = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!(user_id = %self.user_id, "Key store closed");
        }
    }

    // -----------------------------------------------------------------------
    // Cache access
    // -----------------------------------------------------------------------

    fn read<T>(&self, key: &str, pick: impl FnOnce(&StoredRecord) -> Option<T>) -> Option<T> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let record = state.as_ref()?.cache.get(key)?;
        if !record.is_well_formed() {
            warn!(key, "Ignoring malformed key store record");
            return None;
        }
        pick(record)
    }

    async fn put(&self, key: String, record: StoredRecord) -> Result<()> {
        let plaintext = Zeroizing::new(serde_json::to_string(&RowOut {
            key: &key,
            record: &record,
        })?);
        let (storage, row_key, sealed) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let open = state.as_mut().ok_or(KeyStoreError::Closed)?;
            let sealed = open.cipher.seal(&plaintext)?;
            let row_key = open.cipher.row_key(&key);
            open.cache.insert(key, record);
            (Arc::clone(&open.storage), row_key, sealed)
        };
        storage.put(&row_key, &sealed).await?;
        Ok(())
    }

    async fn remove(&self, key: String) -> Result<()> {
        let (storage, row_key) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let open = state.as_mut().ok_or(KeyStoreError::Closed)?;
            open.cache.remove(&key);
            (Arc::clone(&open.storage), open.cipher.row_key(&key))
        };
        storage.delete(&row_key).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// The local identity key pair.
    pub fn identity_key_pair(&self) -> Option<IdentityEntry> {
        self.read(IDENTITY_KEY, |r| match r {
            StoredRecord::Identity(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Save the local identity key pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed, or if sealing or the durable
    /// write fails.
    pub async fn store_identity_key_pair(&self, entry: IdentityEntry) -> Result<()> {
        self.put(IDENTITY_KEY.to_string(), StoredRecord::Identity(entry))
            .await
    }

    /// The local registration ID.
    pub fn registration_id(&self) -> Option<u32> {
        self.read(REGISTRATION_ID_KEY, |r| match r {
            StoredRecord::RegistrationId(id) => Some(*id),
            _ => None,
        })
    }

    /// Save the local registration ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable write fails.
    pub async fn store_registration_id(&self, id: u32) -> Result<()> {
        self.put(
            REGISTRATION_ID_KEY.to_string(),
            StoredRecord::RegistrationId(id),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Prekeys
    // -----------------------------------------------------------------------

    /// A one-time prekey by ID.
    pub fn pre_key(&self, id: u32) -> Option<PreKeyEntry> {
        self.read(&pre_key_key(id), |r| match r {
            StoredRecord::PreKey(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Save a one-time prekey under its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable write fails.
    pub async fn store_pre_key(&self, entry: PreKeyEntry) -> Result<()> {
        self.put(pre_key_key(entry.key_id), StoredRecord::PreKey(entry))
            .await
    }

    /// Remove a one-time prekey. Missing IDs are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable delete fails.
    pub async fn remove_pre_key(&self, id: u32) -> Result<()> {
        self.remove(pre_key_key(id)).await
    }

    /// IDs of all stored one-time prekeys, ascending.
    pub fn pre_key_ids(&self) -> Vec<u32> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<u32> = state
            .as_ref()
            .map(|s| {
                s.cache
                    .keys()
                    .filter_map(|k| k.strip_prefix(PRE_KEY_PREFIX)?.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// A signed prekey. Malformed stored values read as `None`.
    pub fn signed_pre_key(&self, id: u32) -> Option<SignedPreKeyEntry> {
        self.read(&signed_pre_key_key(id), |r| match r {
            StoredRecord::SignedPreKey(e) if e.key_id == id => Some(e.clone()),
            _ => None,
        })
    }

    /// Save a signed prekey under its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable write fails.
    pub async fn store_signed_pre_key(&self, entry: SignedPreKeyEntry) -> Result<()> {
        self.put(
            signed_pre_key_key(entry.key_id),
            StoredRecord::SignedPreKey(entry),
        )
        .await
    }

    /// Remove a signed prekey.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable delete fails.
    pub async fn remove_signed_pre_key(&self, id: u32) -> Result<()> {
        self.remove(signed_pre_key_key(id)).await
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Pickled session state with `peer`.
    pub fn session(&self, peer: &PeerAddress) -> Option<String> {
        self.read(&session_key(peer), |r| match r {
            StoredRecord::Session(pickle) => Some(pickle.clone()),
            _ => None,
        })
    }

    pub fn has_session(&self, peer: &PeerAddress) -> bool {
        self.session(peer).is_some()
    }

    /// Save the pickled session with `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable write fails.
    pub async fn store_session(&self, peer: &PeerAddress, pickle: String) -> Result<()> {
        self.put(session_key(peer), StoredRecord::Session(pickle))
            .await
    }

    /// Remove the session with `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable delete fails.
    pub async fn remove_session(&self, peer: &PeerAddress) -> Result<()> {
        self.remove(session_key(peer)).await
    }

    /// Remove the sessions with every device of `user_id`.
    ///
    /// Returns how many sessions were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable delete fails.
    pub async fn remove_all_sessions(&self, user_id: &str) -> Result<usize> {
        let prefix = format!("{SESSION_PREFIX}{user_id}.");
        let (storage, removed) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let open = state.as_mut().ok_or(KeyStoreError::Closed)?;
            // Only `<user>.<device>`; a user named `alice.x` must not match `alice`.
            let removed: Vec<String> = open
                .cache
                .keys()
                .filter(|k| {
                    k.strip_prefix(&prefix)
                        .is_some_and(|device| device.parse::<u32>().is_ok())
                })
                .cloned()
                .collect();
            for key in &removed {
                open.cache.remove(key);
            }
            let row_keys: Vec<String> = removed.iter().map(|k| open.cipher.row_key(k)).collect();
            (Arc::clone(&open.storage), row_keys)
        };
        if !removed.is_empty() {
            storage.delete_many(&removed).await?;
        }
        Ok(removed.len())
    }

    // -----------------------------------------------------------------------
    // Trust
    // -----------------------------------------------------------------------

    /// Trusted identity key recorded for `peer`.
    pub fn trusted_identity(&self, peer: &PeerAddress) -> Option<Vec<u8>> {
        self.read(&trusted_identity_key(peer), |r| match r {
            StoredRecord::TrustedIdentity(key) => Some(key.clone()),
            _ => None,
        })
    }

    /// Record `identity_key` as trusted for `peer`.
    ///
    /// Returns `true` if it replaced a different key, `false` on first save
    /// or when the key is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable write fails.
    pub async fn save_identity(&self, peer: &PeerAddress, identity_key: &[u8]) -> Result<bool> {
        let existing = self.trusted_identity(peer);
        if existing.as_deref() == Some(identity_key) {
            return Ok(false);
        }
        let changed = existing.is_some();
        if changed {
            warn!(peer = %peer, "Peer identity key changed");
        }
        self.put(
            trusted_identity_key(peer),
            StoredRecord::TrustedIdentity(identity_key.to_vec()),
        )
        .await?;
        Ok(changed)
    }

    /// `true` if nothing is recorded for `peer` or the recorded key matches.
    pub fn is_trusted_identity(&self, peer: &PeerAddress, identity_key: &[u8]) -> bool {
        self.trusted_identity(peer)
            .is_none_or(|known| known == identity_key)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Metadata about the local key set.
    pub fn metadata(&self) -> Option<KeyStoreMetadata> {
        self.read(METADATA_KEY, |r| match r {
            StoredRecord::Metadata(m) => Some(m.clone()),
            _ => None,
        })
    }

    /// Replace the key set metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable write fails.
    pub async fn store_metadata(&self, metadata: KeyStoreMetadata) -> Result<()> {
        self.put(METADATA_KEY.to_string(), StoredRecord::Metadata(metadata))
            .await
    }

    /// Delete every record, in memory and on disk. The store stays open.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the durable delete fails.
    pub async fn wipe(&self) -> Result<()> {
        let storage = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let open = state.as_mut().ok_or(KeyStoreError::Closed)?;
            open.cache.clear();
            Arc::clone(&open.storage)
        };
        storage.clear().await?;
        info!(user_id = %self.user_id, "Key store wiped");
        Ok(())
    }
}
