//! Key Manager
//!
//! Generates, exports and imports the local key set.
//!
//! The Olm account owns every secret: identity keys, one-time prekeys and the
//! fallback key that serves as the signed prekey. The store keeps the pickled
//! account next to public-only prekey entries with their IDs.

use std::collections::HashSet;

use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use vc_common::{encoding, PublicPreKey, PublicPreKeyBundle, PublicSignedPreKey};
use vc_crypto::olm::{curve25519_key, OlmAccount};
use vc_crypto::CryptoError;

use super::adapter::{
    account_from_entry, identity_to_entry, pre_key_to_entry, signed_pre_key_to_entry,
    verify_signed_pre_key,
};
use super::store::{KeyStore, KeyStoreError};
use super::types::{
    GeneratedIdentity, IdentityEntry, KeySet, KeyStoreMetadata, PreKeyEntry, SignedPreKeyEntry,
};
use crate::config::KeysConfig;

/// ID of the one active signed prekey.
pub const SIGNED_PRE_KEY_ID: u32 = 1;

/// Maximum prekeys generated by one replenish call.
pub const MAX_PREKEY_COUNT: u32 = 100;

/// Registration IDs are drawn from `1..=MAX_REGISTRATION_ID`.
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// Key manager errors.
#[derive(Debug, Error)]
pub enum KeyManagerError {
    /// Key store error.
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Olm account error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Required local key material is absent.
    #[error("Missing key material: {0}")]
    MissingKeyMaterial(&'static str),

    /// Imported key set failed validation.
    #[error("Malformed key set: {0}")]
    MalformedKeySet(String),

    /// Requested prekey count out of range.
    #[error("Prekey count must be between 1 and {MAX_PREKEY_COUNT}, got {0}")]
    InvalidPreKeyCount(u32),

    /// New prekeys would have IDs beyond the export scan range.
    #[error("Prekey IDs would exceed the limit of {limit}")]
    PreKeyLimit { limit: u32 },
}

/// Key manager result type.
pub type Result<T> = std::result::Result<T, KeyManagerError>;

/// Short SHA-256 fingerprint of a public key, safe to log.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(&Sha256::digest(public_key)[..8])
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build the publishable bundle from stored entries.
fn public_bundle_from(
    identity: &IdentityEntry,
    registration_id: u32,
    signed: &SignedPreKeyEntry,
    pre_keys: &[PreKeyEntry],
) -> PublicPreKeyBundle {
    PublicPreKeyBundle {
        identity_key: encoding::encode(&identity.public_key),
        registration_id,
        signed_pre_key: PublicSignedPreKey {
            id: signed.key_id,
            public_key: encoding::encode(&signed.public_key),
            signature: encoding::encode(&signed.signature),
        },
        pre_keys: pre_keys.iter().map(public_pre_key).collect(),
    }
}

fn public_pre_key(entry: &PreKeyEntry) -> PublicPreKey {
    PublicPreKey {
        id: entry.key_id,
        public_key: encoding::encode(&entry.public_key),
    }
}

fn malformed(what: impl std::fmt::Display) -> KeyManagerError {
    KeyManagerError::MalformedKeySet(what.to_string())
}

/// Generates and moves the local key set.
#[derive(Debug, Clone)]
pub struct KeyManager {
    prekey_count: u32,
    scan_limit: u32,
}

impl KeyManager {
    /// `prekey_count` prekeys are generated with a new identity; export scans
    /// prekey IDs `1..=scan_limit`.
    pub fn new(prekey_count: u32, scan_limit: u32) -> Self {
        let scan_limit = scan_limit.max(1);
        Self {
            prekey_count: prekey_count.clamp(1, scan_limit),
            scan_limit,
        }
    }

    pub fn from_config(config: &KeysConfig) -> Self {
        Self::new(config.prekey_count, config.prekey_scan_limit)
    }

    /// Whether the store holds a usable key set.
    pub fn has_local_keys(&self, store: &KeyStore) -> bool {
        store.identity_key_pair().is_some()
            && store.registration_id().is_some()
            && store.signed_pre_key(SIGNED_PRE_KEY_ID).is_some()
    }

    /// Create a fresh identity with its prekeys and persist it.
    ///
    /// Returns the public-only bundle for publication.
    #[tracing::instrument(skip(self, store), fields(user_id = %store.user_id()))]
    pub async fn generate_identity(
        &self,
        store: &KeyStore,
        device_id: &str,
    ) -> Result<GeneratedIdentity> {
        let mut account = OlmAccount::new();
        let registration_id = rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID);
        let created_at = now_millis();

        let fallback = account.generate_fallback_key()?;
        let signed_entry =
            signed_pre_key_to_entry(&account, SIGNED_PRE_KEY_ID, &fallback, created_at);
        let generated = account.generate_one_time_keys(self.prekey_count as usize);
        let pre_key_entries: Vec<PreKeyEntry> = (1..)
            .zip(&generated.created)
            .map(|(id, key)| pre_key_to_entry(id, key))
            .collect();
        let identity_entry = identity_to_entry(&account);

        store.store_identity_key_pair(identity_entry.clone()).await?;
        store.store_registration_id(registration_id).await?;
        store.store_signed_pre_key(signed_entry.clone()).await?;
        for entry in &pre_key_entries {
            store.store_pre_key(entry.clone()).await?;
        }
        store
            .store_metadata(KeyStoreMetadata {
                user_id: store.user_id().to_string(),
                device_id: device_id.to_string(),
                created_at,
                pending_backup: true,
                pending_publish: true,
            })
            .await?;

        info!(
            fingerprint = %fingerprint(&identity_entry.public_key),
            registration_id,
            prekey_count = pre_key_entries.len(),
            "Generated new identity"
        );

        Ok(GeneratedIdentity {
            identity_key: identity_entry.public_key.clone(),
            registration_id,
            bundle: public_bundle_from(
                &identity_entry,
                registration_id,
                &signed_entry,
                &pre_key_entries,
            ),
        })
    }

    /// Read the complete key set out of the store.
    pub fn export_key_set(&self, store: &KeyStore) -> Result<KeySet> {
        let identity_key_pair = store
            .identity_key_pair()
            .ok_or(KeyManagerError::MissingKeyMaterial("identity key pair"))?;
        let registration_id = store
            .registration_id()
            .ok_or(KeyManagerError::MissingKeyMaterial("registration id"))?;
        let signed_pre_key = store
            .signed_pre_key(SIGNED_PRE_KEY_ID)
            .ok_or(KeyManagerError::MissingKeyMaterial("signed prekey"))?;
        let pre_keys: Vec<PreKeyEntry> = (1..=self.scan_limit)
            .filter_map(|id| store.pre_key(id))
            .collect();
        let created_at = store
            .metadata()
            .map_or(signed_pre_key.created_at, |m| m.created_at);

        debug!(prekey_count = pre_keys.len(), "Exported key set");
        Ok(KeySet {
            identity_key_pair,
            registration_id,
            signed_pre_key,
            pre_keys,
            created_at,
        })
    }

    /// Check a key set before anything is written.
    pub fn validate_key_set(&self, key_set: &KeySet) -> Result<()> {
        let account = account_from_entry(&key_set.identity_key_pair)
            .map_err(|e| malformed(format!("identity key pair: {e}")))?;

        if !(1..=MAX_REGISTRATION_ID).contains(&key_set.registration_id) {
            return Err(malformed(format!(
                "registration id {} out of range",
                key_set.registration_id
            )));
        }

        let signed = &key_set.signed_pre_key;
        if signed.key_id != SIGNED_PRE_KEY_ID {
            return Err(malformed(format!(
                "unexpected signed prekey id {}",
                signed.key_id
            )));
        }
        verify_signed_pre_key(&account.identity_key(), signed)
            .map_err(|e| malformed(format!("signed prekey: {e}")))?;

        let mut seen = HashSet::with_capacity(key_set.pre_keys.len());
        for entry in &key_set.pre_keys {
            if entry.key_id == 0 || entry.key_id > self.scan_limit {
                return Err(malformed(format!("prekey id {} out of range", entry.key_id)));
            }
            if !seen.insert(entry.key_id) {
                return Err(malformed(format!("duplicate prekey id {}", entry.key_id)));
            }
            curve25519_key(&entry.public_key)
                .map_err(|e| malformed(format!("prekey {}: {e}", entry.key_id)))?;
        }
        Ok(())
    }

    /// Validate and persist a key set.
    ///
    /// Nothing is written unless the whole set is valid. The imported bundle
    /// is marked for publication, the backup is not.
    #[tracing::instrument(skip(self, store, key_set), fields(user_id = %store.user_id()))]
    pub async fn import_key_set(
        &self,
        store: &KeyStore,
        key_set: &KeySet,
        device_id: &str,
    ) -> Result<()> {
        self.validate_key_set(key_set)?;

        store
            .store_identity_key_pair(key_set.identity_key_pair.clone())
            .await?;
        store.store_registration_id(key_set.registration_id).await?;
        store
            .store_signed_pre_key(key_set.signed_pre_key.clone())
            .await?;
        for entry in &key_set.pre_keys {
            store.store_pre_key(entry.clone()).await?;
        }
        store
            .store_metadata(KeyStoreMetadata {
                user_id: store.user_id().to_string(),
                device_id: device_id.to_string(),
                created_at: key_set.created_at,
                pending_backup: false,
                pending_publish: true,
            })
            .await?;

        info!(
            fingerprint = %fingerprint(&key_set.identity_key_pair.public_key),
            prekey_count = key_set.pre_keys.len(),
            "Imported key set"
        );
        Ok(())
    }

    /// Rebuild the publishable bundle from the stored keys.
    pub fn public_bundle(&self, store: &KeyStore) -> Result<PublicPreKeyBundle> {
        let key_set = self.export_key_set(store)?;
        Ok(public_bundle_from(
            &key_set.identity_key_pair,
            key_set.registration_id,
            &key_set.signed_pre_key,
            &key_set.pre_keys,
        ))
    }

    /// Generate `count` more prekeys after the highest existing ID.
    ///
    /// Marks the key set as needing a new backup and a new publish.
    #[tracing::instrument(skip(self, store), fields(user_id = %store.user_id()))]
    pub async fn replenish_prekeys(&self, store: &KeyStore, count: u32) -> Result<Vec<PublicPreKey>> {
        if count == 0 || count > MAX_PREKEY_COUNT {
            return Err(KeyManagerError::InvalidPreKeyCount(count));
        }
        if !self.has_local_keys(store) {
            return Err(KeyManagerError::MissingKeyMaterial("identity key pair"));
        }

        let limit = KeyManagerError::PreKeyLimit {
            limit: self.scan_limit,
        };
        let last = store.pre_key_ids().last().copied().unwrap_or(0);
        let Some(start) = last.checked_add(1) else {
            return Err(limit);
        };
        match start.checked_add(count - 1) {
            Some(end) if end <= self.scan_limit => {}
            _ => return Err(limit),
        }

        let identity = store
            .identity_key_pair()
            .ok_or(KeyManagerError::MissingKeyMaterial("identity key pair"))?;
        let mut account = account_from_entry(&identity)?;
        let generated = account.generate_one_time_keys(count as usize);

        // Keys the account evicted can no longer start a session.
        for evicted in &generated.removed {
            let stale = store.pre_key_ids().into_iter().find(|id| {
                store
                    .pre_key(*id)
                    .is_some_and(|e| e.public_key.as_slice() == evicted.as_bytes())
            });
            if let Some(id) = stale {
                store.remove_pre_key(id).await?;
            }
        }

        store
            .store_identity_key_pair(identity_to_entry(&account))
            .await?;
        let entries: Vec<PreKeyEntry> = (start..)
            .zip(&generated.created)
            .map(|(id, key)| pre_key_to_entry(id, key))
            .collect();
        for entry in &entries {
            store.store_pre_key(entry.clone()).await?;
        }
        if let Some(mut metadata) = store.metadata() {
            metadata.pending_backup = true;
            metadata.pending_publish = true;
            store.store_metadata(metadata).await?;
        }

        info!(prekey_count = entries.len(), first_id = start, "Generated new prekeys");
        Ok(entries.iter().map(public_pre_key).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::storage::MemoryStorageProvider;

    async fn open_store(user: &str) -> KeyStore {
        let store = KeyStore::new(user, Arc::new(MemoryStorageProvider::new()));
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_generate_persists_everything() {
        let store = open_store("alice").await;
        let manager = KeyManager::new(5, 100);
        let generated = manager.generate_identity(&store, "dev-1").await.unwrap();

        assert!(manager.has_local_keys(&store));
        assert_eq!(store.pre_key_ids(), vec![1, 2, 3, 4, 5]);
        assert_eq!(generated.bundle.pre_keys.len(), 5);
        assert_eq!(generated.bundle.signed_pre_key.id, SIGNED_PRE_KEY_ID);
        assert_eq!(generated.identity_key.len(), 64);

        let metadata = store.metadata().unwrap();
        assert!(metadata.pending_backup);
        assert!(metadata.pending_publish);
        assert_eq!(metadata.device_id, "dev-1");
        assert!((1..=MAX_REGISTRATION_ID).contains(&generated.registration_id));
    }

    #[tokio::test]
    async fn test_bundle_is_public_only() {
        let store = open_store("alice").await;
        let manager = KeyManager::new(2, 100);
        let generated = manager.generate_identity(&store, "dev-1").await.unwrap();

        let json = serde_json::to_string(&generated.bundle).unwrap();
        let identity = store.identity_key_pair().unwrap();
        assert!(!json.contains(&identity.account));
        assert!(!json.contains("account"));
        assert_eq!(
            generated.bundle.identity_key,
            encoding::encode(&identity.public_key)
        );
    }

    #[tokio::test]
    async fn test_export_import_reproduces_material() {
        let source = open_store("alice").await;
        let manager = KeyManager::new(5, 100);
        manager.generate_identity(&source, "dev-1").await.unwrap();
        let exported = manager.export_key_set(&source).unwrap();

        let target = open_store("alice").await;
        manager
            .import_key_set(&target, &exported, "dev-1")
            .await
            .unwrap();
        let reexported = manager.export_key_set(&target).unwrap();
        assert_eq!(reexported, exported);
    }

    #[tokio::test]
    async fn test_export_requires_keys() {
        let store = open_store("alice").await;
        let manager = KeyManager::new(5, 100);
        assert!(matches!(
            manager.export_key_set(&store),
            Err(KeyManagerError::MissingKeyMaterial("identity key pair"))
        ));
    }

    #[tokio::test]
    async fn test_malformed_import_writes_nothing() {
        let source = open_store("alice").await;
        let manager = KeyManager::new(3, 100);
        manager.generate_identity(&source, "dev-1").await.unwrap();
        let mut key_set = manager.export_key_set(&source).unwrap();
        key_set.pre_keys[1].public_key.truncate(10);

        let target = open_store("alice").await;
        let result = manager.import_key_set(&target, &key_set, "dev-1").await;
        assert!(matches!(result, Err(KeyManagerError::MalformedKeySet(_))));
        assert!(target.identity_key_pair().is_none());
        assert!(target.registration_id().is_none());
        assert!(target.pre_key_ids().is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_forged_signature() {
        let source = open_store("alice").await;
        let manager = KeyManager::new(1, 100);
        manager.generate_identity(&source, "dev-1").await.unwrap();
        let mut key_set = manager.export_key_set(&source).unwrap();
        key_set.signed_pre_key.signature[0] ^= 0xFF;

        assert!(matches!(
            manager.validate_key_set(&key_set),
            Err(KeyManagerError::MalformedKeySet(_))
        ));
    }

    #[tokio::test]
    async fn test_import_rejects_duplicate_prekey_ids() {
        let source = open_store("alice").await;
        let manager = KeyManager::new(2, 100);
        manager.generate_identity(&source, "dev-1").await.unwrap();
        let mut key_set = manager.export_key_set(&source).unwrap();
        key_set.pre_keys[1].key_id = key_set.pre_keys[0].key_id;

        assert!(matches!(
            manager.validate_key_set(&key_set),
            Err(KeyManagerError::MalformedKeySet(_))
        ));
    }

    #[tokio::test]
    async fn test_replenish_continues_ids() {
        let store = open_store("alice").await;
        let manager = KeyManager::new(5, 100);
        manager.generate_identity(&store, "dev-1").await.unwrap();
        store.remove_pre_key(1).await.unwrap();

        let added = manager.replenish_prekeys(&store, 3).await.unwrap();
        let ids: Vec<u32> = added.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![6, 7, 8]);
        assert_eq!(store.pre_key_ids(), vec![2, 3, 4, 5, 6, 7, 8]);
        assert!(manager.replenish_prekeys(&store, 0).await.is_err());
        assert!(matches!(
            manager.replenish_prekeys(&store, 95).await,
            Err(KeyManagerError::PreKeyLimit { limit: 100 })
        ));
    }

    #[tokio::test]
    async fn test_replenished_keys_belong_to_account() {
        let store = open_store("alice").await;
        let manager = KeyManager::new(2, 100);
        manager.generate_identity(&store, "dev-1").await.unwrap();
        let mut metadata = store.metadata().unwrap();
        metadata.pending_publish = false;
        store.store_metadata(metadata).await.unwrap();

        manager.replenish_prekeys(&store, 2).await.unwrap();

        let key_set = manager.export_key_set(&store).unwrap();
        assert_eq!(key_set.pre_keys.len(), 4);
        manager.validate_key_set(&key_set).unwrap();
        assert!(store.metadata().unwrap().pending_publish);
    }

    #[tokio::test]
    async fn test_replenish_near_id_limit_does_not_overflow() {
        let store = open_store("alice").await;
        let manager = KeyManager::new(1, u32::MAX);
        manager.generate_identity(&store, "dev-1").await.unwrap();
        store
            .store_pre_key(PreKeyEntry {
                key_id: u32::MAX - 1,
                public_key: vec![9; 32],
            })
            .await
            .unwrap();

        assert!(matches!(
            manager.replenish_prekeys(&store, 5).await,
            Err(KeyManagerError::PreKeyLimit { limit: u32::MAX })
        ));

        store
            .store_pre_key(PreKeyEntry {
                key_id: u32::MAX,
                public_key: vec![9; 32],
            })
            .await
            .unwrap();
        assert!(matches!(
            manager.replenish_prekeys(&store, 1).await,
            Err(KeyManagerError::PreKeyLimit { limit: u32::MAX })
        ));
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let fp = fingerprint(&[1, 2, 3]);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, hex::encode(&Sha256::digest([1u8, 2, 3])[..8]));
    }
}
