//! At-Rest Encryption
//!
//! Key store rows are written as `(keyed hash of the key, sealed value)`, so
//! neither key material nor the peer addresses of sessions appear in plaintext
//! on disk.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::storage::{Result, StorageError};

const VALUE_ENCRYPTION_DOMAIN: &[u8] = b"vc-keys:value_encryption:v1";
const ROW_KEY_DOMAIN: &[u8] = b"vc-keys:row_key:v1";
const SEALED_PREFIX: &str = "enc2:";
const NONCE_LEN: usize = 12;

/// HMAC-SHA256 of `parts` under `key`, each part followed by a zero byte.
pub(crate) fn keyed_digest(key: &[u8], parts: &[&[u8]]) -> Zeroizing<[u8; 32]> {
    let mut mac = match <Hmac<Sha256> as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    };
    for part in parts {
        mac.update(part);
        mac.update(&[0u8]);
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Seals key store values under a per-user encryption key.
pub struct StoreCipher {
    value_key: Zeroizing<[u8; 32]>,
    row_key: Zeroizing<[u8; 32]>,
}

impl StoreCipher {
    pub fn new(encryption_key: &[u8; 32]) -> Self {
        Self {
            value_key: keyed_digest(encryption_key, &[VALUE_ENCRYPTION_DOMAIN]),
            row_key: keyed_digest(encryption_key, &[ROW_KEY_DOMAIN]),
        }
    }

    /// Opaque, deterministic storage key for `key`.
    pub fn row_key(&self, key: &str) -> String {
        STANDARD.encode(keyed_digest(self.row_key.as_ref(), &[key.as_bytes()]).as_ref())
    }

    /// AES-256-GCM with a random nonce: `enc2:` + base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let cipher = match Aes256Gcm::new_from_slice(self.value_key.as_ref()) {
            Ok(cipher) => cipher,
            Err(_) => unreachable!("SHA-256 output size matches AES-256 key size"),
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| StorageError::Encryption(format!("Nonce generation failed: {e}")))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| StorageError::Encryption(format!("Value encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(combined)))
    }

    /// Open a sealed value. `None` for anything that does not authenticate.
    pub fn open(&self, stored: &str) -> Option<Zeroizing<String>> {
        let encrypted = STANDARD.decode(stored.strip_prefix(SEALED_PREFIX)?).ok()?;
        if encrypted.len() <= NONCE_LEN {
            return None;
        }
        let cipher = Aes256Gcm::new_from_slice(self.value_key.as_ref()).ok()?;
        let (nonce, ciphertext) = encrypted.split_at(NONCE_LEN);
        let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
        String::from_utf8(plaintext).ok().map(Zeroizing::new)
    }
}
