//! Client-side Cryptography
//!
//! Local storage, backup and session management of E2EE key material.
//! Everything written to disk is sealed by [`sealing::StoreCipher`].

pub mod adapter;
pub mod backup;
pub mod context;
pub mod facade;
pub mod manager;
pub mod restore;
pub mod sealing;
pub mod session;
pub mod single_flight;
pub mod storage;
pub mod store;
pub mod types;

pub use adapter::{AdapterError, OlmStoreAdapter};
pub use backup::{validate_password_strength, BackupCodec, BackupError, PasswordRule};
pub use context::KeyContext;
pub use facade::{E2eeFacade, FacadeError};
pub use manager::{fingerprint, KeyManager, KeyManagerError};
pub use restore::{RestoreCoordinator, RestoreError, RestoreOutcome, RestoreRequest};
pub use session::{EncryptedMessage, SessionCoordinator, SessionError, WireMessageType};
pub use storage::{
    KeyValueStorage, MemoryStorageProvider, SqliteStorageProvider, StorageError, StorageProvider,
};
pub use store::{KeyStore, KeyStoreError};
pub use types::{
    GeneratedIdentity, IdentityEntry, KeySet, KeyStoreMetadata, PreKeyEntry, SignedPreKeyEntry,
};
