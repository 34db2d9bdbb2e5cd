//! Key Lifecycle Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::backup::{DEFAULT_KDF_ITERATIONS, MIN_KDF_ITERATIONS};

/// Key lifecycle configuration loaded from environment variables.
#[derive(Clone)]
pub struct KeysConfig {
    /// Backend base URL (e.g., `https://chat.example.com`)
    pub server_url: String,

    /// Root directory for per-user key databases (default: ./data)
    pub data_dir: PathBuf,

    /// One-time prekeys generated with a new identity (default: 5)
    pub prekey_count: u32,

    /// Highest prekey ID scanned on export (default: 100)
    pub prekey_scan_limit: u32,

    /// PBKDF2 iterations for key backups (default: 310000, minimum 100000)
    pub kdf_iterations: u32,

    /// HTTP request timeout in seconds (default: 30)
    pub http_timeout_secs: u64,

    /// Master key sealing the key databases at rest (`VC_STORE_KEY`, 64 hex chars)
    pub store_key: [u8; 32],
}

impl fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysConfig")
            .field("server_url", &self.server_url)
            .field("data_dir", &self.data_dir)
            .field("prekey_count", &self.prekey_count)
            .field("prekey_scan_limit", &self.prekey_scan_limit)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish_non_exhaustive()
    }
}

fn parse_store_key(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim()).context("VC_STORE_KEY must be hex")?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("VC_STORE_KEY must be 32 bytes, got {}", bytes.len()))
}

impl KeysConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server_url: env::var("VC_SERVER_URL").context("VC_SERVER_URL must be set")?,
            data_dir: env::var("VC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            prekey_count: env::var("VC_PREKEY_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            prekey_scan_limit: env::var("VC_PREKEY_SCAN_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            kdf_iterations: env::var("VC_KDF_ITERATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_KDF_ITERATIONS)
                .max(MIN_KDF_ITERATIONS),
            http_timeout_secs: env::var("VC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            store_key: parse_store_key(
                &env::var("VC_STORE_KEY").context("VC_STORE_KEY must be set")?,
            )?,
        })
    }

    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Create a default configuration for testing.
    ///
    /// Uses the minimum KDF iteration count so backup round trips stay fast.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            data_dir: env::temp_dir().join("vc-keys-test"),
            prekey_count: 5,
            prekey_scan_limit: 100,
            kdf_iterations: MIN_KDF_ITERATIONS,
            http_timeout_secs: 30,
            store_key: [7; 32],
        }
    }
}
