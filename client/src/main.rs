//! Kaiku Key Tool - Main Entry Point
//!
//! Runs one login-time key restore for a user and device.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use vc_keys::crypto::{
    fingerprint, validate_password_strength, E2eeFacade, KeyContext, RestoreRequest,
    SqliteStorageProvider,
};
use vc_keys::network::HttpKeyBackend;
use vc_keys::KeysConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_keys=debug".into()),
        )
        .json()
        .init();

    let config = KeysConfig::from_env()?;
    let user_id = env::var("VC_USER_ID").context("VC_USER_ID must be set")?;
    let access_token = env::var("VC_ACCESS_TOKEN").context("VC_ACCESS_TOKEN must be set")?;
    let password = env::var("VC_BACKUP_PASSWORD").ok();

    if let Some(password) = password.as_deref() {
        let violations = validate_password_strength(password);
        if !violations.is_empty() {
            let rules: Vec<String> = violations.iter().map(ToString::to_string).collect();
            warn!(rules = ?rules, "Backup password is weak");
        }
    }

    let backend = HttpKeyBackend::new(&config.server_url, access_token, config.http_timeout())
        .context("Failed to build HTTP client")?;
    let provider = SqliteStorageProvider::new(&config.data_dir, config.store_key);
    let facade = E2eeFacade::new(KeyContext::new(Arc::new(provider)), Arc::new(backend), &config);

    // Reuse the device ID of an earlier run so the backup lookup finds it.
    let device_id = match env::var("VC_DEVICE_ID") {
        Ok(device_id) => device_id,
        Err(_) => facade
            .stored_device_id(&user_id)
            .await?
            .unwrap_or_else(|| Uuid::now_v7().to_string()),
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        user_id = %user_id,
        device_id = %device_id,
        "Starting key restore"
    );

    let outcome = facade
        .restore(RestoreRequest::new(&user_id, &device_id, password))
        .await
        .context("Key restore failed")?;

    let store = facade.store(&user_id).await?;
    let identity = store
        .identity_key_pair()
        .map(|entry| fingerprint(&entry.public_key))
        .unwrap_or_default();
    info!(outcome = ?outcome, identity = %identity, "Key restore complete");

    facade.logout();
    Ok(())
}
