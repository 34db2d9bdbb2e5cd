//! Shared wire types.

pub mod keys;

pub use keys::*;
