//! E2EE Facade
//!
//! Single entry point for the rest of the client. Opens the key store of the
//! active user on demand and coalesces concurrent restores.
//!
//! A restore opens its store inside the restore flight. Restores for another
//! user wait for the flight to settle, so switching users never closes a
//! store a restore is still writing to.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use vc_common::{ClaimedPreKeyBundle, PeerAddress, PublicPreKey};

use super::backup::{self, BackupCodec, PasswordRule};
use super::context::KeyContext;
use super::manager::{KeyManager, KeyManagerError};
use super::restore::{RestoreCoordinator, RestoreError, RestoreOutcome, RestoreRequest};
use super::session::{EncryptedMessage, SessionCoordinator, SessionError};
use super::single_flight::SingleFlight;
use super::store::{KeyStore, KeyStoreError};
use crate::config::KeysConfig;
use crate::network::{BackendError, KeyBackendApi};

/// Facade errors.
#[derive(Debug, Error)]
pub enum FacadeError {
    /// No key store is open; restore first.
    #[error("E2EE keys not initialized")]
    NotInitialized,

    /// The key store could not be opened.
    #[error("Failed to open key store: {0}")]
    Open(Arc<KeyStoreError>),

    #[error("Restore failed: {0}")]
    Restore(Arc<RestoreError>),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    KeyManager(#[from] KeyManagerError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Facade result type.
pub type Result<T> = std::result::Result<T, FacadeError>;

/// Key lifecycle entry point.
pub struct E2eeFacade {
    context: Arc<KeyContext>,
    manager: KeyManager,
    sessions: SessionCoordinator,
    restorer: Arc<RestoreCoordinator>,
    backend: Arc<dyn KeyBackendApi>,
    restoring: SingleFlight<String, std::result::Result<RestoreOutcome, Arc<RestoreError>>>,
}

impl E2eeFacade {
    pub fn new(context: KeyContext, backend: Arc<dyn KeyBackendApi>, config: &KeysConfig) -> Self {
        let manager = KeyManager::from_config(config);
        let restorer = RestoreCoordinator::new(
            manager.clone(),
            BackupCodec::new(config.kdf_iterations),
            Arc::clone(&backend),
        );
        Self {
            context: Arc::new(context),
            manager,
            sessions: SessionCoordinator::new(),
            restorer: Arc::new(restorer),
            backend,
            restoring: SingleFlight::new(),
        }
    }

    /// Open the key store for `user_id`.
    pub async fn store(&self, user_id: &str) -> Result<Arc<KeyStore>> {
        self.context.open(user_id).await.map_err(FacadeError::Open)
    }

    /// Device ID recorded with the local key set of `user_id`, if any.
    pub async fn stored_device_id(&self, user_id: &str) -> Result<Option<String>> {
        let store = self.store(user_id).await?;
        Ok(store.metadata().map(|m| m.device_id))
    }

    fn current(&self) -> Result<Arc<KeyStore>> {
        self.context.current().ok_or(FacadeError::NotInitialized)
    }

    /// Reconcile local keys with the backend backup.
    ///
    /// Overlapping calls for the same user and device share one run and get
    /// the same result.
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreOutcome> {
        let key = format!("{}:{}", request.user_id, request.device_id);
        let context = Arc::clone(&self.context);
        let restorer = Arc::clone(&self.restorer);

        self.restoring
            .run(key, move || async move {
                let store = context
                    .open(&request.user_id)
                    .await
                    .map_err(|e| Arc::new(RestoreError::Open(e)))?;
                restorer.restore(&store, &request).await.map_err(Arc::new)
            })
            .await
            .map_err(FacadeError::Restore)
    }

    pub async fn bootstrap_session(
        &self,
        peer: &PeerAddress,
        bundle: &ClaimedPreKeyBundle,
    ) -> Result<()> {
        let store = self.current()?;
        Ok(self.sessions.bootstrap_session(&store, peer, bundle).await?)
    }

    pub async fn encrypt(&self, peer: &PeerAddress, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let store = self.current()?;
        Ok(self.sessions.encrypt(&store, peer, plaintext).await?)
    }

    pub async fn decrypt(&self, peer: &PeerAddress, message: &EncryptedMessage) -> Result<Vec<u8>> {
        let store = self.current()?;
        Ok(self.sessions.decrypt(&store, peer, message).await?)
    }

    /// Whether a session with `peer` exists. False when no store is open.
    pub fn has_session(&self, peer: &PeerAddress) -> bool {
        self.context
            .current()
            .is_some_and(|store| self.sessions.has_session(&store, peer))
    }

    pub async fn remove_sessions_with(&self, user_id: &str) -> Result<usize> {
        let store = self.current()?;
        Ok(self.sessions.remove_sessions_with(&store, user_id).await?)
    }

    /// Generate `count` more prekeys and republish the public bundle.
    ///
    /// If the publish fails the new keys stay marked for publication and
    /// the next restore publishes them.
    pub async fn replenish_prekeys(&self, count: u32) -> Result<Vec<PublicPreKey>> {
        let store = self.current()?;
        let device_id = store
            .metadata()
            .map(|m| m.device_id)
            .ok_or(KeyStoreError::Missing("metadata"))?;

        let added = self.manager.replenish_prekeys(&store, count).await?;
        let bundle = self.manager.public_bundle(&store)?;
        self.backend
            .publish_public_bundle(store.user_id(), &device_id, &bundle)
            .await?;
        if let Some(mut metadata) = store.metadata() {
            metadata.pending_publish = false;
            store.store_metadata(metadata).await?;
        }

        info!(added = added.len(), total = bundle.pre_keys.len(), "Republished prekey bundle");
        Ok(added)
    }

    /// Close the key store. Keys stay on disk for the next login.
    pub fn logout(&self) {
        self.context.close();
        info!("E2EE key store closed");
    }

    pub fn validate_password_strength(&self, password: &str) -> Vec<PasswordRule> {
        backup::validate_password_strength(password)
    }
}
