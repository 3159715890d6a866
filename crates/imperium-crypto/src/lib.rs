//! Imperium Credential Library
//!
//! Primitives used by the account layer to store and check credentials:
//!
//! - **Password**: argon2id (v0x13) with per-hash random salts, configurable cost
//! - **Digest**: SHA-256, used to key legacy accounts by username
//! - **Comparison**: constant-time equality for hashes and secrets

pub mod digest;
pub mod error;
pub mod password;

pub use digest::{constant_time_eq, sha256};
pub use error::CryptoError;
pub use password::{HashParams, PasswordHash, PasswordHasher};
