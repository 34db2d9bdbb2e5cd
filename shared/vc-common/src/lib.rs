//! `VoiceChat` Common Library
//!
//! Wire types shared by the client and the key backend: public prekey
//! bundles, encrypted key backups and peer addressing.

pub mod encoding;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
