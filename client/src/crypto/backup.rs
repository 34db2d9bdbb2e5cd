//! Password-Based Key Backup
//!
//! Seals a [`KeySet`] under a password so it can be stored by the backend.
//!
//! PBKDF2-HMAC-SHA256 derives a 256-bit key from the password and a random
//! salt; AES-256-GCM encrypts the JSON-encoded key set. The associated data
//! binds the backup format version and the device ID.

use std::fmt;
use std::num::NonZeroU32;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ring::pbkdf2;
use thiserror::Error;
use tracing::debug;
use vc_common::{encoding, EncryptedKeyBundle};
use zeroize::Zeroizing;

use super::types::KeySet;

/// Current backup format version.
pub const BACKUP_VERSION: u32 = 1;

/// Lowest accepted PBKDF2 iteration count.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Default PBKDF2 iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 310_000;

/// Maximum password length in bytes.
pub const MAX_PASSWORD_LEN: usize = 1_024;

/// Minimum password length in characters for [`validate_password_strength`].
pub const MIN_PASSWORD_LEN: usize = 12;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Backup codec errors.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Bundle was written by an unknown format version.
    #[error("Unsupported backup version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Wrong password, tampering, or a damaged bundle.
    #[error("Backup decryption failed")]
    DecryptionFailed,

    /// Password exceeds [`MAX_PASSWORD_LEN`].
    #[error("Password exceeds maximum length of {MAX_PASSWORD_LEN} bytes")]
    PasswordTooLong,

    /// Key set could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// OS random number generator failed.
    #[error("Random number generation failed: {0}")]
    Random(#[from] getrandom::Error),

    /// AEAD refused to encrypt.
    #[error("Backup encryption failed")]
    EncryptionFailed,

    /// Blocking KDF task failed.
    #[error("Backup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Backup result type.
pub type Result<T> = std::result::Result<T, BackupError>;

/// A password rule that was not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordRule {
    MinLength,
    Uppercase,
    Lowercase,
    Digit,
    Special,
}

impl fmt::Display for PasswordRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinLength => write!(f, "at least {MIN_PASSWORD_LEN} characters"),
            Self::Uppercase => f.write_str("an uppercase letter"),
            Self::Lowercase => f.write_str("a lowercase letter"),
            Self::Digit => f.write_str("a digit"),
            Self::Special => f.write_str("a special character"),
        }
    }
}

/// Rules `password` violates. Empty means the password is acceptable.
pub fn validate_password_strength(password: &str) -> Vec<PasswordRule> {
    let mut violated = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LEN {
        violated.push(PasswordRule::MinLength);
    }
    if !password.chars().any(char::is_uppercase) {
        violated.push(PasswordRule::Uppercase);
    }
    if !password.chars().any(char::is_lowercase) {
        violated.push(PasswordRule::Lowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violated.push(PasswordRule::Digit);
    }
    if !password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        violated.push(PasswordRule::Special);
    }
    violated
}

fn associated_data(version: u32, device_id: &str) -> Vec<u8> {
    format!("vc-keys:backup:v{version}:{device_id}").into_bytes()
}

fn derive_key(password: &[u8], salt: &[u8], iterations: NonZeroU32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password,
        key.as_mut_slice(),
    );
    key
}

/// Encrypts and decrypts key set backups.
#[derive(Debug, Clone, Copy)]
pub struct BackupCodec {
    iterations: NonZeroU32,
}

impl Default for BackupCodec {
    fn default() -> Self {
        Self::new(DEFAULT_KDF_ITERATIONS)
    }
}

impl BackupCodec {
    /// Iteration counts below [`MIN_KDF_ITERATIONS`] are raised to it.
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: NonZeroU32::new(iterations.max(MIN_KDF_ITERATIONS))
                .unwrap_or(NonZeroU32::MIN),
        }
    }

    pub const fn iterations(&self) -> u32 {
        self.iterations.get()
    }

    /// Encrypt `key_set` for `device_id` under `password`.
    ///
    /// Every call uses a fresh salt and nonce.
    pub async fn encrypt_key_set(
        &self,
        key_set: &KeySet,
        password: &str,
        device_id: &str,
    ) -> Result<EncryptedKeyBundle> {
        if password.len() > MAX_PASSWORD_LEN {
            return Err(BackupError::PasswordTooLong);
        }

        let plaintext = Zeroizing::new(serde_json::to_vec(key_set)?);
        let password = Zeroizing::new(password.as_bytes().to_vec());
        let device_id = device_id.to_string();
        let iterations = self.iterations;

        tokio::task::spawn_blocking(move || -> Result<EncryptedKeyBundle> {
            let mut salt = [0u8; SALT_LEN];
            let mut nonce = [0u8; NONCE_LEN];
            getrandom::getrandom(&mut salt)?;
            getrandom::getrandom(&mut nonce)?;

            let key = derive_key(&password, &salt, iterations);
            let cipher = Aes256Gcm::new_from_slice(key.as_slice())
                .map_err(|_| BackupError::EncryptionFailed)?;
            let aad = associated_data(BACKUP_VERSION, &device_id);
            let encrypted = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &plaintext,
                        aad: &aad,
                    },
                )
                .map_err(|_| BackupError::EncryptionFailed)?;

            debug!(device_id = %device_id, "Encrypted key set backup");
            Ok(EncryptedKeyBundle {
                encrypted: encoding::encode(encrypted),
                iv: encoding::encode(nonce),
                salt: encoding::encode(salt),
                version: BACKUP_VERSION,
                device_id,
            })
        })
        .await?
    }

    /// Decrypt a backup with `password`.
    ///
    /// The version is checked before any key derivation. Every other failure
    /// is reported as [`BackupError::DecryptionFailed`].
    pub async fn decrypt_key_set(
        &self,
        bundle: &EncryptedKeyBundle,
        password: &str,
    ) -> Result<KeySet> {
        if bundle.version != BACKUP_VERSION {
            return Err(BackupError::UnsupportedVersion {
                found: bundle.version,
                expected: BACKUP_VERSION,
            });
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(BackupError::PasswordTooLong);
        }

        let salt = encoding::decode_fixed::<SALT_LEN>("salt", &bundle.salt)
            .map_err(|_| BackupError::DecryptionFailed)?;
        let nonce = encoding::decode_fixed::<NONCE_LEN>("iv", &bundle.iv)
            .map_err(|_| BackupError::DecryptionFailed)?;
        let encrypted = encoding::decode("encrypted", &bundle.encrypted)
            .map_err(|_| BackupError::DecryptionFailed)?;
        let password = Zeroizing::new(password.as_bytes().to_vec());
        let aad = associated_data(bundle.version, &bundle.device_id);
        let iterations = self.iterations;

        tokio::task::spawn_blocking(move || -> Result<KeySet> {
            let key = derive_key(&password, &salt, iterations);
            let cipher = Aes256Gcm::new_from_slice(key.as_slice())
                .map_err(|_| BackupError::DecryptionFailed)?;
            let plaintext = Zeroizing::new(
                cipher
                    .decrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: &encrypted,
                            aad: &aad,
                        },
                    )
                    .map_err(|_| BackupError::DecryptionFailed)?,
            );
            serde_json::from_slice(&plaintext).map_err(|_| BackupError::DecryptionFailed)
        })
        .await?
    }
}
