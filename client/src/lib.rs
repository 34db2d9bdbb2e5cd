//! Kaiku E2EE Key Lifecycle
//!
//! Generation, local storage, password-protected backup and restore of the
//! device key set, plus session bootstrap for 1:1 encrypted messaging.

pub mod config;
pub mod crypto;
pub mod network;

pub use config::KeysConfig;
pub use crypto::{E2eeFacade, FacadeError, KeyContext, RestoreOutcome, RestoreRequest};
