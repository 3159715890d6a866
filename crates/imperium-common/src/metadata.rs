//! Free-form per-account key/value metadata.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use imperium_core::Store;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::{Message, MessageBus};
use crate::error::{Error, Result, is_foreign_key_violation};

const SCHEMA: &str = include_str!("../schema/metadata.sql");

#[allow(clippy::expect_used)]
static KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9_]+$").expect("static regex is valid"));

pub const MAX_KEY_LENGTH: usize = 64;

/// A metadata entry was written (`Some`) or deleted (`None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub account: i64,
    pub key: String,
    pub value: Option<String>,
}

impl Message for MetadataUpdate {
    const TOPIC: &'static str = "imperium.account.MetadataUpdate";
}

pub fn register_messages(bus: &MessageBus) {
    bus.register::<MetadataUpdate>();
}

/// Reject keys outside `^[a-z0-9_]+$` or longer than [`MAX_KEY_LENGTH`].
pub fn validate_key(key: &str) -> Result<()> {
    let matches = KEY.is_match(key);
    if !matches || key.len() > MAX_KEY_LENGTH {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Owns the `account_metadata` table.
pub struct MetadataService {
    store: Store,
    bus: Arc<MessageBus>,
}

impl MetadataService {
    pub const fn new(store: Store, bus: Arc<MessageBus>) -> Self {
        Self { store, bus }
    }

    pub async fn init(&self) -> Result<()> {
        self.store.execute_script(SCHEMA).await?;
        Ok(())
    }

    pub async fn select_metadata(&self, account: i64, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let value = sqlx::query_scalar(
            "SELECT value FROM account_metadata WHERE account_id = ? AND key = ?",
        )
        .bind(account)
        .bind(key)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(value)
    }

    pub async fn select_all_metadata(&self, account: i64) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM account_metadata WHERE account_id = ?")
                .bind(account)
                .fetch_all(self.store.pool())
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Entries whose key starts with `prefix`. `_` is matched literally.
    pub async fn select_all_metadata_by_prefix(
        &self,
        account: i64,
        prefix: &str,
    ) -> Result<BTreeMap<String, String>> {
        validate_key(prefix)?;
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value FROM account_metadata \
             WHERE account_id = ? AND substr(key, 1, ?) = ?",
        )
        .bind(account)
        .bind(i64::try_from(prefix.len()).unwrap_or(i64::MAX))
        .bind(prefix)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Insert or replace an entry. `true` iff the stored value changed;
    /// `false` for an unknown account.
    pub async fn update_metadata(&self, account: i64, key: &str, value: &str) -> Result<bool> {
        validate_key(key)?;
        let result = sqlx::query(
            "INSERT INTO account_metadata (account_id, key, value) VALUES (?, ?, ?) \
             ON CONFLICT(account_id, key) DO UPDATE SET value = excluded.value \
             WHERE account_metadata.value != excluded.value",
        )
        .bind(account)
        .bind(key)
        .bind(value)
        .execute(self.store.pool())
        .await;

        let changed = match result {
            Ok(done) => done.rows_affected() > 0,
            Err(e) if is_foreign_key_violation(&e) => {
                debug!(account, key, "Metadata write for unknown account");
                false
            }
            Err(e) => return Err(e.into()),
        };
        if changed {
            self.notify(MetadataUpdate {
                account,
                key: key.to_string(),
                value: Some(value.to_string()),
            })
            .await;
        }
        Ok(changed)
    }

    pub async fn delete_metadata(&self, account: i64, key: &str) -> Result<bool> {
        validate_key(key)?;
        let deleted = sqlx::query("DELETE FROM account_metadata WHERE account_id = ? AND key = ?")
            .bind(account)
            .bind(key)
            .execute(self.store.pool())
            .await?
            .rows_affected()
            > 0;
        if deleted {
            self.notify(MetadataUpdate {
                account,
                key: key.to_string(),
                value: None,
            })
            .await;
        }
        Ok(deleted)
    }

    async fn notify(&self, update: MetadataUpdate) {
        if let Err(e) = self.bus.broadcast(&update).await {
            warn!(account = update.account, key = %update.key, error = %e, "Failed to broadcast metadata update");
        }
    }
}
