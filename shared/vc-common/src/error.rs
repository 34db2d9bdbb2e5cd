//! Error types for decoding wire values.

use thiserror::Error;

/// Errors raised while decoding base64 wire fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Field is not valid standard base64.
    #[error("Field `{field}` is not valid base64")]
    InvalidBase64 { field: &'static str },

    /// Field decoded to an unexpected number of bytes.
    #[error("Field `{field}` has length {actual}, expected {expected}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Result type for wire decoding.
pub type Result<T> = std::result::Result<T, Error>;
