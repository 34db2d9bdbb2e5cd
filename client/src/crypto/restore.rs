//! Restore Coordinator
//!
//! Reconciles the local key store with the backend backup on login.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::backup::{BackupCodec, BackupError};
use super::manager::{KeyManager, KeyManagerError};
use super::store::{KeyStore, KeyStoreError};
use super::types::{KeySet, KeyStoreMetadata};
use crate::network::{BackendError, KeyBackendApi};

/// Restore errors.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// Key store error.
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Key manager error.
    #[error("Key manager error: {0}")]
    KeyManager(#[from] KeyManagerError),

    /// Backup could not be decrypted or created.
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// Backend unreachable and no local keys to fall back on.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The key store for the restoring user could not be opened.
    #[error("Failed to open key store: {0}")]
    Open(Arc<KeyStoreError>),
}

/// Restore result type.
pub type Result<T> = std::result::Result<T, RestoreError>;

/// How a restore ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Local state was replaced by the backend key set.
    Restored,
    /// Local keys were uploaded as the new backup.
    BackedUp,
    /// A new identity was generated and published.
    Generated {
        /// Whether the new key set was also uploaded as a backup.
        uploaded: bool,
    },
    /// Local keys kept without reaching the backend.
    LocalKeysOnly,
}

/// Input of one restore.
#[derive(Clone)]
pub struct RestoreRequest {
    pub user_id: String,
    pub device_id: String,
    /// Backup password. Without it, backend backups are neither read nor written.
    pub password: Option<Zeroizing<String>>,
}

impl RestoreRequest {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            password: password.map(Zeroizing::new),
        }
    }

    fn password(&self) -> Option<&str> {
        self.password.as_deref().map(String::as_str)
    }
}

impl fmt::Debug for RestoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreRequest")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Whether unbacked local keys take precedence over the backend key set.
fn local_wins(local: Option<&KeyStoreMetadata>, remote: &KeySet) -> bool {
    local.is_some_and(|m| m.pending_backup && m.created_at > remote.created_at)
}

/// Whether the backup holds the identity the store already has.
fn same_identity(store: &KeyStore, remote: &KeySet) -> bool {
    store
        .identity_key_pair()
        .is_some_and(|local| local.public_key == remote.identity_key_pair.public_key)
}

/// Runs the login-time reconciliation between local keys and the backup.
pub struct RestoreCoordinator {
    manager: KeyManager,
    codec: BackupCodec,
    backend: Arc<dyn KeyBackendApi>,
}

impl RestoreCoordinator {
    pub fn new(manager: KeyManager, codec: BackupCodec, backend: Arc<dyn KeyBackendApi>) -> Self {
        Self {
            manager,
            codec,
            backend,
        }
    }

    /// Reconcile `store` with the backend.
    ///
    /// Backup decryption happens before local state is touched, so a wrong
    /// password leaves local keys intact. A backup of the identity already on
    /// this device never replaces it, so sessions and trusted identities
    /// survive a re-login. Backend failures degrade to
    /// [`RestoreOutcome::LocalKeysOnly`] whenever local keys exist.
    ///
    /// Whenever local keys exist and the backend answered, a public bundle
    /// that never reached the backend is published again.
    #[tracing::instrument(skip(self, store, request), fields(user_id = %request.user_id, device_id = %request.device_id))]
    pub async fn restore(&self, store: &KeyStore, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let has_local = self.manager.has_local_keys(store);
        let password = request.password();

        let remote = match self.backend.fetch_encrypted_bundle(&request.device_id).await {
            Ok(remote) => remote,
            Err(e) => return Self::degrade(has_local, e),
        };

        let outcome = match (remote, password) {
            (Some(bundle), Some(password)) => {
                let key_set = self.codec.decrypt_key_set(&bundle, password).await?;
                let metadata = store.metadata();
                if has_local && same_identity(store, &key_set) {
                    if metadata.as_ref().is_some_and(|m| m.pending_backup) {
                        info!("Local keys changed since the last backup");
                        self.upload_local(store, &request.device_id, password).await?
                    } else {
                        info!("Backup matches the local identity");
                        RestoreOutcome::Restored
                    }
                } else if has_local && local_wins(metadata.as_ref(), &key_set) {
                    info!("Local keys are newer than the backup");
                    self.upload_local(store, &request.device_id, password).await?
                } else {
                    self.replace_with(store, &key_set, &request.device_id).await?;
                    RestoreOutcome::Restored
                }
            }
            (_, Some(password)) if has_local => {
                self.upload_local(store, &request.device_id, password).await?
            }
            _ if !has_local => self.generate(store, request).await?,
            _ => RestoreOutcome::LocalKeysOnly,
        };

        if !matches!(outcome, RestoreOutcome::Generated { .. }) {
            self.publish_if_pending(store, request).await?;
        }

        info!(outcome = ?outcome, "Key restore finished");
        Ok(outcome)
    }

    /// Publish the public bundle if it changed since the last successful
    /// publish.
    ///
    /// Returns whether the backend has the current bundle. A failed publish
    /// is logged and retried by the next restore.
    async fn publish_if_pending(&self, store: &KeyStore, request: &RestoreRequest) -> Result<bool> {
        let Some(mut metadata) = store.metadata().filter(|m| m.pending_publish) else {
            return Ok(true);
        };
        let bundle = self.manager.public_bundle(store)?;

        if let Err(e) = self
            .backend
            .publish_public_bundle(&request.user_id, &request.device_id, &bundle)
            .await
        {
            warn!("Publishing the prekey bundle failed, will retry: {e}");
            return Ok(false);
        }

        metadata.pending_publish = false;
        store.store_metadata(metadata).await?;
        info!(prekey_count = bundle.pre_keys.len(), "Published prekey bundle");
        Ok(true)
    }

    fn degrade(has_local: bool, error: BackendError) -> Result<RestoreOutcome> {
        if has_local {
            warn!("Key backend unavailable, keeping local keys: {error}");
            Ok(RestoreOutcome::LocalKeysOnly)
        } else {
            Err(RestoreError::Backend(error))
        }
    }

    async fn replace_with(&self, store: &KeyStore, key_set: &KeySet, device_id: &str) -> Result<()> {
        self.manager.validate_key_set(key_set)?;
        store.wipe().await?;
        self.manager.import_key_set(store, key_set, device_id).await?;
        Ok(())
    }

    async fn upload_local(
        &self,
        store: &KeyStore,
        device_id: &str,
        password: &str,
    ) -> Result<RestoreOutcome> {
        let key_set = self.manager.export_key_set(store)?;
        let bundle = self.codec.encrypt_key_set(&key_set, password, device_id).await?;
        if let Err(e) = self.backend.store_encrypted_bundle(device_id, &bundle).await {
            return Self::degrade(true, e);
        }
        Self::mark_backed_up(store).await?;
        Ok(RestoreOutcome::BackedUp)
    }

    async fn generate(&self, store: &KeyStore, request: &RestoreRequest) -> Result<RestoreOutcome> {
        self.manager
            .generate_identity(store, &request.device_id)
            .await?;

        if !self.publish_if_pending(store, request).await? {
            return Ok(RestoreOutcome::LocalKeysOnly);
        }

        let Some(password) = request.password() else {
            return Ok(RestoreOutcome::Generated { uploaded: false });
        };
        match self.upload_local(store, &request.device_id, password).await? {
            RestoreOutcome::BackedUp => Ok(RestoreOutcome::Generated { uploaded: true }),
            degraded => Ok(degraded),
        }
    }

    async fn mark_backed_up(store: &KeyStore) -> Result<()> {
        if let Some(mut metadata) = store.metadata() {
            if metadata.pending_backup {
                metadata.pending_backup = false;
                store.store_metadata(metadata).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vc_common::{EncryptedKeyBundle, PublicPreKeyBundle};

    use super::*;
    use crate::crypto::backup::MIN_KDF_ITERATIONS;
    use crate::crypto::storage::MemoryStorageProvider;

    const PASSWORD: &str = "Correct-Horse-42";

    #[derive(Default)]
    struct FakeBackend {
        backup: Mutex<Option<EncryptedKeyBundle>>,
        published: AtomicUsize,
        uploads: AtomicUsize,
        offline: AtomicBool,
        reject_publish: AtomicBool,
    }

    impl FakeBackend {
        fn check_online(&self) -> crate::network::api::Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(BackendError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyBackendApi for FakeBackend {
        async fn publish_public_bundle(
            &self,
            _user_id: &str,
            _device_id: &str,
            _bundle: &PublicPreKeyBundle,
        ) -> crate::network::api::Result<()> {
            self.check_online()?;
            if self.reject_publish.load(Ordering::SeqCst) {
                return Err(BackendError::Status {
                    status: 500,
                    body: "publish failed".into(),
                });
            }
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn store_encrypted_bundle(
            &self,
            _device_id: &str,
            bundle: &EncryptedKeyBundle,
        ) -> crate::network::api::Result<()> {
            self.check_online()?;
            self.uploads.fetch_add(1, Ordering::SeqCst);
            *self.backup.lock().unwrap() = Some(bundle.clone());
            Ok(())
        }

        async fn fetch_encrypted_bundle(
            &self,
            _device_id: &str,
        ) -> crate::network::api::Result<Option<EncryptedKeyBundle>> {
            self.check_online()?;
            Ok(self.backup.lock().unwrap().clone())
        }
    }

    fn manager() -> KeyManager {
        KeyManager::new(5, 100)
    }

    fn codec() -> BackupCodec {
        BackupCodec::new(MIN_KDF_ITERATIONS)
    }

    fn coordinator(backend: &Arc<FakeBackend>) -> RestoreCoordinator {
        RestoreCoordinator::new(manager(), codec(), Arc::clone(backend) as Arc<dyn KeyBackendApi>)
    }

    async fn open_store(user: &str) -> KeyStore {
        let store = KeyStore::new(user, Arc::new(MemoryStorageProvider::new()));
        store.init().await.unwrap();
        store
    }

    fn request(password: Option<&str>) -> RestoreRequest {
        RestoreRequest::new("alice", "dev-1", password.map(str::to_string))
    }

    /// Key set generated on another device, stored as the backend backup.
    async fn seed_backup(backend: &FakeBackend, created_at: Option<i64>) -> KeySet {
        let other = open_store("alice").await;
        manager().generate_identity(&other, "dev-1").await.unwrap();
        let mut key_set = manager().export_key_set(&other).unwrap();
        if let Some(created_at) = created_at {
            key_set.created_at = created_at;
        }
        let bundle = codec()
            .encrypt_key_set(&key_set, PASSWORD, "dev-1")
            .await
            .unwrap();
        *backend.backup.lock().unwrap() = Some(bundle);
        key_set
    }

    #[tokio::test]
    async fn test_fresh_device_generates_and_uploads() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;

        let outcome = coordinator(&backend)
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::Generated { uploaded: true });
        assert_eq!(backend.published.load(Ordering::SeqCst), 1);
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
        assert!(!store.metadata().unwrap().pending_backup);

        let uploaded = backend.backup.lock().unwrap().clone().unwrap();
        let key_set = codec().decrypt_key_set(&uploaded, PASSWORD).await.unwrap();
        assert_eq!(
            Some(key_set.identity_key_pair),
            store.identity_key_pair()
        );
    }

    #[tokio::test]
    async fn test_fresh_device_without_password() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;

        let outcome = coordinator(&backend).restore(&store, &request(None)).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::Generated { uploaded: false });
        assert_eq!(backend.published.load(Ordering::SeqCst), 1);
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
        assert!(store.metadata().unwrap().pending_backup);
    }

    #[tokio::test]
    async fn test_backend_set_replaces_local_keys() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;
        manager().generate_identity(&store, "dev-1").await.unwrap();
        let mut metadata = store.metadata().unwrap();
        metadata.pending_backup = false;
        store.store_metadata(metadata).await.unwrap();
        let remote = seed_backup(&backend, None).await;

        let outcome = coordinator(&backend)
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(store.identity_key_pair(), Some(remote.identity_key_pair.clone()));
        assert_eq!(store.registration_id(), Some(remote.registration_id));
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
        assert!(!store.metadata().unwrap().pending_backup);
    }

    #[tokio::test]
    async fn test_newer_unbacked_local_keys_are_uploaded() {
        let backend = Arc::new(FakeBackend::default());
        let remote = seed_backup(&backend, Some(1)).await;
        let store = open_store("alice").await;
        manager().generate_identity(&store, "dev-1").await.unwrap();
        let local_identity = store.identity_key_pair().unwrap();

        let outcome = coordinator(&backend)
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::BackedUp);
        assert_eq!(store.identity_key_pair(), Some(local_identity.clone()));
        assert_ne!(local_identity, remote.identity_key_pair);

        let uploaded = backend.backup.lock().unwrap().clone().unwrap();
        let key_set = codec().decrypt_key_set(&uploaded, PASSWORD).await.unwrap();
        assert_eq!(key_set.identity_key_pair, local_identity);
        assert!(!store.metadata().unwrap().pending_backup);
    }

    #[tokio::test]
    async fn test_wrong_password_keeps_local_keys() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;
        manager().generate_identity(&store, "dev-1").await.unwrap();
        let local_identity = store.identity_key_pair();
        seed_backup(&backend, None).await;

        let result = coordinator(&backend)
            .restore(&store, &request(Some("Wrong-Password-99")))
            .await;

        assert!(matches!(
            result,
            Err(RestoreError::Backup(BackupError::DecryptionFailed))
        ));
        assert_eq!(store.identity_key_pair(), local_identity);
    }

    #[tokio::test]
    async fn test_local_keys_without_backup_are_uploaded() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;
        manager().generate_identity(&store, "dev-1").await.unwrap();

        let outcome = coordinator(&backend)
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::BackedUp);
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(backend.published.load(Ordering::SeqCst), 1);
        assert!(!store.metadata().unwrap().pending_publish);
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_by_next_restore() {
        let backend = Arc::new(FakeBackend::default());
        backend.reject_publish.store(true, Ordering::SeqCst);
        let store = open_store("alice").await;

        let outcome = coordinator(&backend)
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::LocalKeysOnly);
        assert!(store.metadata().unwrap().pending_publish);
        assert_eq!(backend.published.load(Ordering::SeqCst), 0);

        backend.reject_publish.store(false, Ordering::SeqCst);
        let outcome = coordinator(&backend)
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::BackedUp);
        assert_eq!(backend.published.load(Ordering::SeqCst), 1);
        assert!(!store.metadata().unwrap().pending_publish);

        // Nothing left to publish.
        coordinator(&backend).restore(&store, &request(None)).await.unwrap();
        assert_eq!(backend.published.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_without_password_or_backup() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;
        manager().generate_identity(&store, "dev-1").await.unwrap();

        let outcome = coordinator(&backend).restore(&store, &request(None)).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::LocalKeysOnly);
        assert_eq!(backend.published.load(Ordering::SeqCst), 1);
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backup_of_same_identity_keeps_local_state() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;
        let coordinator = coordinator(&backend);
        coordinator
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();

        let bob = vc_common::PeerAddress::new("bob", 1);
        store.store_session(&bob, "session".into()).await.unwrap();
        store.save_identity(&bob, &[4u8; 32]).await.unwrap();
        store.remove_pre_key(1).await.unwrap();

        let outcome = coordinator
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored);
        assert!(store.has_session(&bob));
        assert_eq!(store.trusted_identity(&bob), Some(vec![4u8; 32]));
        assert!(store.pre_key(1).is_none());
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_identity_with_unbacked_changes_is_uploaded() {
        let backend = Arc::new(FakeBackend::default());
        let store = open_store("alice").await;
        let coordinator = coordinator(&backend);
        coordinator
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();
        manager().replenish_prekeys(&store, 2).await.unwrap();
        let bob = vc_common::PeerAddress::new("bob", 1);
        store.store_session(&bob, "session".into()).await.unwrap();

        let outcome = coordinator
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::BackedUp);
        assert!(store.has_session(&bob));
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 2);
        assert_eq!(backend.published.load(Ordering::SeqCst), 2);

        let uploaded = backend.backup.lock().unwrap().clone().unwrap();
        let key_set = codec().decrypt_key_set(&uploaded, PASSWORD).await.unwrap();
        assert_eq!(key_set.pre_keys.len(), 7);
    }

    #[tokio::test]
    async fn test_local_keys_without_password_are_kept() {
        let backend = Arc::new(FakeBackend::default());
        seed_backup(&backend, None).await;
        let store = open_store("alice").await;
        manager().generate_identity(&store, "dev-1").await.unwrap();
        let local_identity = store.identity_key_pair();

        let outcome = coordinator(&backend).restore(&store, &request(None)).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::LocalKeysOnly);
        assert_eq!(store.identity_key_pair(), local_identity);
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_or_fails() {
        let backend = Arc::new(FakeBackend::default());
        backend.offline.store(true, Ordering::SeqCst);

        let empty = open_store("alice").await;
        let result = coordinator(&backend)
            .restore(&empty, &request(Some(PASSWORD)))
            .await;
        assert!(matches!(result, Err(RestoreError::Backend(_))));
        assert!(!manager().has_local_keys(&empty));

        let store = open_store("alice").await;
        manager().generate_identity(&store, "dev-1").await.unwrap();
        let outcome = coordinator(&backend)
            .restore(&store, &request(Some(PASSWORD)))
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::LocalKeysOnly);
        assert!(store.metadata().unwrap().pending_backup);
    }

    #[test]
    fn test_local_wins_rule() {
        let key_set_at = |created_at| KeySet {
            identity_key_pair: crate::crypto::types::IdentityEntry {
                public_key: vec![1; 64],
                account: "account".into(),
            },
            registration_id: 1,
            signed_pre_key: crate::crypto::types::SignedPreKeyEntry {
                key_id: 1,
                public_key: vec![1; 32],
                signature: vec![3; 64],
                created_at,
            },
            pre_keys: Vec::new(),
            created_at,
        };
        let metadata = |pending_backup, created_at| KeyStoreMetadata {
            user_id: "alice".into(),
            device_id: "dev-1".into(),
            created_at,
            pending_backup,
            pending_publish: false,
        };

        assert!(local_wins(Some(&metadata(true, 20)), &key_set_at(10)));
        assert!(!local_wins(Some(&metadata(false, 20)), &key_set_at(10)));
        assert!(!local_wins(Some(&metadata(true, 10)), &key_set_at(10)));
        assert!(!local_wins(None, &key_set_at(10)));
    }

    #[test]
    fn test_request_debug_redacts_password() {
        let debug = format!("{:?}", request(Some(PASSWORD)));
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(PASSWORD));
    }
}
