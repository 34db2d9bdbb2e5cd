//! Network Layer
//!
//! Thin client for the backend key endpoints.

pub mod api;

pub use api::{BackendError, HttpKeyBackend, KeyBackendApi};
