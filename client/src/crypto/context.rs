//! Active key store for the signed-in user.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use super::single_flight::SingleFlight;
use super::storage::StorageProvider;
use super::store::{KeyStore, KeyStoreError};

type OpenResult = Result<Arc<KeyStore>, Arc<KeyStoreError>>;

/// Holds the key store of the active user.
///
/// Concurrent opens for one user share a single initialization. Opening a
/// different user waits for any in-flight open, then closes the previous store.
pub struct KeyContext {
    provider: Arc<dyn StorageProvider>,
    current: Arc<RwLock<Option<Arc<KeyStore>>>>,
    opening: SingleFlight<String, OpenResult>,
}

impl KeyContext {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            current: Arc::new(RwLock::new(None)),
            opening: SingleFlight::new(),
        }
    }

    /// Open (or return the already open) store for `user_id`.
    pub async fn open(&self, user_id: &str) -> OpenResult {
        if let Some(store) = Self::open_store_for(&self.current, user_id) {
            return Ok(store);
        }

        let provider = Arc::clone(&self.provider);
        let current = Arc::clone(&self.current);
        let user_id = user_id.to_string();

        self.opening
            .run(user_id.clone(), move || async move {
                if let Some(store) = Self::open_store_for(&current, &user_id) {
                    return Ok(store);
                }

                let store = Arc::new(KeyStore::new(user_id, provider));
                store.init().await.map_err(Arc::new)?;

                let previous = current
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(Arc::clone(&store));
                if let Some(previous) = previous {
                    info!(previous = %previous.user_id(), "Switching key store user");
                    previous.close();
                }
                Ok(store)
            })
            .await
    }

    /// The open store, if any.
    pub fn current(&self) -> Option<Arc<KeyStore>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|store| store.is_open())
            .cloned()
    }

    /// Close and forget the active store.
    pub fn close(&self) {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(store) = previous {
            store.close();
        }
    }

    fn open_store_for(
        current: &RwLock<Option<Arc<KeyStore>>>,
        user_id: &str,
    ) -> Option<Arc<KeyStore>> {
        current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|store| store.user_id() == user_id && store.is_open())
            .cloned()
    }
}
