//! Olm Store Adapter
//!
//! The only place where stored entries are translated to and from the Olm
//! types of `vc-crypto`. Everything the session layer reads or writes goes
//! through [`OlmStoreAdapter`].

use thiserror::Error;
use vc_common::PeerAddress;
use vc_crypto::olm::{curve25519_key, IdentityKey, OlmAccount, OlmSession};
use vc_crypto::types::Curve25519PublicKey;
use vc_crypto::CryptoError;

use super::store::{KeyStore, KeyStoreError};
use super::types::{IdentityEntry, PreKeyEntry, SignedPreKeyEntry};

// Pickles are sealed again by the key store at rest and by the backup codec
// in transit, so they share one fixed key and stay portable between devices.
const PICKLE_KEY: [u8; 32] = [0u8; 32];

/// Adapter errors.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Adapter result type.
pub type Result<T> = std::result::Result<T, AdapterError>;

pub(crate) fn identity_to_entry(account: &OlmAccount) -> IdentityEntry {
    IdentityEntry {
        public_key: account.identity_key().to_bytes().to_vec(),
        account: account.serialize(&PICKLE_KEY),
    }
}

/// Unpickle the account and check it matches the stored public identity.
pub(crate) fn account_from_entry(entry: &IdentityEntry) -> vc_crypto::Result<OlmAccount> {
    let account = OlmAccount::deserialize(&entry.account, &PICKLE_KEY)?;
    if account.identity_key().to_bytes().as_slice() != entry.public_key.as_slice() {
        return Err(CryptoError::InvalidKey(
            "account does not match the identity public key".into(),
        ));
    }
    Ok(account)
}

pub(crate) fn pre_key_to_entry(key_id: u32, key: &Curve25519PublicKey) -> PreKeyEntry {
    PreKeyEntry {
        key_id,
        public_key: key.as_bytes().to_vec(),
    }
}

/// Sign `key` with the account identity and wrap it as the signed prekey.
pub(crate) fn signed_pre_key_to_entry(
    account: &OlmAccount,
    key_id: u32,
    key: &Curve25519PublicKey,
    created_at: i64,
) -> SignedPreKeyEntry {
    SignedPreKeyEntry {
        key_id,
        public_key: key.as_bytes().to_vec(),
        signature: account.sign(key.as_bytes()).to_vec(),
        created_at,
    }
}

pub(crate) fn verify_signed_pre_key(
    identity: &IdentityKey,
    entry: &SignedPreKeyEntry,
) -> vc_crypto::Result<()> {
    curve25519_key(&entry.public_key)?;
    identity.verify(&entry.public_key, &entry.signature)
}

/// Olm view of a [`KeyStore`].
pub struct OlmStoreAdapter<'a> {
    store: &'a KeyStore,
}

impl<'a> OlmStoreAdapter<'a> {
    pub const fn new(store: &'a KeyStore) -> Self {
        Self { store }
    }

    pub fn load_account(&self) -> Result<OlmAccount> {
        let entry = self
            .store
            .identity_key_pair()
            .ok_or(KeyStoreError::Missing("identity key pair"))?;
        Ok(account_from_entry(&entry)?)
    }

    /// Persist the account after it changed (keys generated or consumed).
    pub async fn save_account(&self, account: &OlmAccount) -> Result<()> {
        self.store
            .store_identity_key_pair(identity_to_entry(account))
            .await?;
        Ok(())
    }

    pub fn load_session(&self, peer: &PeerAddress) -> Result<Option<OlmSession>> {
        self.store
            .session(peer)
            .map(|pickled| OlmSession::deserialize(&pickled, &PICKLE_KEY))
            .transpose()
            .map_err(AdapterError::from)
    }

    pub async fn store_session(&self, peer: &PeerAddress, session: &OlmSession) -> Result<()> {
        self.store
            .store_session(peer, session.serialize(&PICKLE_KEY))
            .await?;
        Ok(())
    }

    /// Drop the one-time prekey entry for `key`, if it was one.
    ///
    /// Returns the removed prekey ID. The signed prekey is never removed.
    pub async fn consume_pre_key(&self, key: &Curve25519PublicKey) -> Result<Option<u32>> {
        let used = self.store.pre_key_ids().into_iter().find(|id| {
            self.store
                .pre_key(*id)
                .is_some_and(|entry| entry.public_key.as_slice() == key.as_bytes())
        });
        if let Some(id) = used {
            self.store.remove_pre_key(id).await?;
        }
        Ok(used)
    }

    pub fn is_trusted_identity(&self, peer: &PeerAddress, key: &Curve25519PublicKey) -> bool {
        self.store.is_trusted_identity(peer, key.as_bytes())
    }

    /// Record `key` as the identity of `peer`. `true` if it replaced another key.
    pub async fn save_identity(&self, peer: &PeerAddress, key: &Curve25519PublicKey) -> Result<bool> {
        Ok(self.store.save_identity(peer, key.as_bytes()).await?)
    }
}
