//! Error type shared by the Imperium services.

use std::fmt;

use imperium_core::StoreError;
use imperium_core::string::StringRequirement;
use imperium_crypto::CryptoError;

use crate::bus::BusError;

/// Which credential a requirement list applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    Username,
    Password,
}

impl fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Username => f.write_str("username"),
            Self::Password => f.write_str("password"),
        }
    }
}

/// Failures surfaced by the services.
///
/// Conflicts (duplicate username, taken session key, lost update) are not
/// errors: operations report them as `false` or `None`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Missing {kind} requirements: {}", format_requirements(.missing))]
    MissingRequirements {
        kind: RequirementKind,
        missing: Vec<StringRequirement>,
    },

    #[error("Invalid metadata key: {0:?}")]
    InvalidKey(String),

    #[error("Corrupted row: {0}")]
    Corrupted(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_requirements(missing: &[StringRequirement]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Whether `e` is a UNIQUE or PRIMARY KEY violation.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Whether `e` is a FOREIGN KEY violation.
pub(crate) fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}
