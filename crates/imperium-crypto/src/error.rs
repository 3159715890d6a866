//! Crypto error types.

/// Errors from credential hashing.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid hash parameters: {0}")]
    InvalidParams(String),

    #[error("Hashing failed: {0}")]
    HashFailed(String),
}
