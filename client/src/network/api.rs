//! Backend Key Endpoints
//!
//! Public bundle publication and encrypted key backup storage.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};
use vc_common::{EncryptedKeyBundle, PublicPreKeyBundle};

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport failure or undecodable response.
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("Server error {status}: {body}")]
    Status { status: u16, body: String },
}

/// Backend result type.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Key endpoints of the backend.
#[async_trait]
pub trait KeyBackendApi: Send + Sync {
    /// Publish the public prekey bundle of a device.
    async fn publish_public_bundle(
        &self,
        user_id: &str,
        device_id: &str,
        bundle: &PublicPreKeyBundle,
    ) -> Result<()>;

    /// Store the encrypted key backup of a device, replacing any previous one.
    async fn store_encrypted_bundle(
        &self,
        device_id: &str,
        bundle: &EncryptedKeyBundle,
    ) -> Result<()>;

    /// Fetch the encrypted key backup of a device, if one exists.
    async fn fetch_encrypted_bundle(&self, device_id: &str) -> Result<Option<EncryptedKeyBundle>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishBundleRequest<'a> {
    user_id: &'a str,
    device_id: &'a str,
    bundle: &'a PublicPreKeyBundle,
}

/// [`KeyBackendApi`] over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpKeyBackend {
    http: reqwest::Client,
    server_url: String,
    access_token: String,
}

impl HttpKeyBackend {
    pub fn new(
        server_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!(status = status.as_u16(), "Key backend request failed: {}", body);
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl KeyBackendApi for HttpKeyBackend {
    async fn publish_public_bundle(
        &self,
        user_id: &str,
        device_id: &str,
        bundle: &PublicPreKeyBundle,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url("/api/keys/bundle"))
            .bearer_auth(&self.access_token)
            .json(&PublishBundleRequest {
                user_id,
                device_id,
                bundle,
            })
            .send()
            .await?;
        Self::check(response).await?;

        info!(
            device_id,
            prekey_count = bundle.pre_keys.len(),
            "Published public prekey bundle"
        );
        Ok(())
    }

    async fn store_encrypted_bundle(
        &self,
        device_id: &str,
        bundle: &EncryptedKeyBundle,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url("/api/keys/backup"))
            .bearer_auth(&self.access_token)
            .json(bundle)
            .send()
            .await?;
        Self::check(response).await?;

        info!(device_id, "Backup uploaded successfully");
        Ok(())
    }

    async fn fetch_encrypted_bundle(&self, device_id: &str) -> Result<Option<EncryptedKeyBundle>> {
        let response = self
            .http
            .get(self.url(&format!("/api/keys/backup/{device_id}")))
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            debug!(device_id, "No backup found");
            return Ok(None);
        }

        let bundle = Self::check(response).await?.json().await?;
        Ok(Some(bundle))
    }
}
