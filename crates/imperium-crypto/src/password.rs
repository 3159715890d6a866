//! Password hashing and verification using argon2id.
//!
//! Hashes are raw argon2id output stored next to the salt that produced
//! them, so verification re-derives with the stored salt and compares in
//! constant time.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::digest::constant_time_eq;
use crate::error::CryptoError;

/// Shortest salt argon2 accepts.
const MIN_SALT_LEN: usize = 8;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub output_len: usize,
    pub salt_len: usize,
}

impl HashParams {
    /// Minimal cost, for tests only.
    pub const fn testing() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
            output_len: 32,
            salt_len: 16,
        }
    }
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
            output_len: 64,
            salt_len: 64,
        }
    }
}

/// A derived hash and its salt.
///
/// Equality is constant time over both fields. Both buffers are zeroed when
/// the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PasswordHash {
    hash: Vec<u8>,
    salt: Vec<u8>,
}

impl PasswordHash {
    pub fn new(hash: Vec<u8>, salt: Vec<u8>) -> Self {
        Self { hash, salt }
    }

    /// A copy of the hash bytes.
    pub fn hash(&self) -> Vec<u8> {
        self.hash.clone()
    }

    /// A copy of the salt bytes.
    pub fn salt(&self) -> Vec<u8> {
        self.salt.clone()
    }
}

impl PartialEq for PasswordHash {
    fn eq(&self, other: &Self) -> bool {
        let hash = self.hash.ct_eq(&other.hash);
        let salt = self.salt.ct_eq(&other.salt);
        (hash & salt).into()
    }
}

impl Eq for PasswordHash {}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordHash")
            .field("hash", &format_args!("<{} bytes>", self.hash.len()))
            .field("salt", &format_args!("<{} bytes>", self.salt.len()))
            .finish()
    }
}

/// Argon2id (v0x13) hasher with fixed cost parameters.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    params: HashParams,
}

impl PasswordHasher {
    /// Build a hasher, rejecting parameters argon2 would refuse.
    pub fn new(params: HashParams) -> Result<Self, CryptoError> {
        if params.salt_len < MIN_SALT_LEN {
            return Err(CryptoError::InvalidParams(format!(
                "salt length {} is below the minimum of {}",
                params.salt_len,
                MIN_SALT_LEN
            )));
        }
        let argon2_params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(params.output_len),
        )
        .map_err(|e| CryptoError::InvalidParams(e.to_string()))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params),
            params,
        })
    }

    pub const fn params(&self) -> HashParams {
        self.params
    }

    /// A fresh random salt from the OS RNG.
    pub fn salt(&self) -> Vec<u8> {
        let mut salt = vec![0u8; self.params.salt_len];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Derive the hash of `password` under `salt`.
    pub fn hash(&self, password: &str, salt: &[u8]) -> Result<PasswordHash, CryptoError> {
        let hash = self.derive(password, salt, self.params.output_len)?;
        Ok(PasswordHash::new(hash, salt.to_vec()))
    }

    /// Hash `password` under a new random salt.
    pub fn hash_fresh(&self, password: &str) -> Result<PasswordHash, CryptoError> {
        let salt = self.salt();
        self.hash(password, &salt)
    }

    /// Check `password` against a stored hash.
    ///
    /// Re-derives with the stored salt and the stored output length, so
    /// hashes written under a different output length still verify.
    pub fn verify(&self, password: &str, expected: &PasswordHash) -> Result<bool, CryptoError> {
        let mut derived = self.derive(password, &expected.salt, expected.hash.len())?;
        let matches = constant_time_eq(&derived, &expected.hash);
        derived.zeroize();
        Ok(matches)
    }

    fn derive(&self, password: &str, salt: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; len];
        self.argon2
            .hash_password_into(password.as_bytes(), salt, &mut out)
            .map_err(|e| CryptoError::HashFailed(e.to_string()))?;
        Ok(out)
    }
}
