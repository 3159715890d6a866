//! Account queries and mutations.

use std::sync::Arc;
use std::time::Duration;

use imperium_core::Store;
use imperium_core::db::unix_timestamp;
use imperium_core::string::{
    StringRequirement, default_password_requirements, default_username_requirements,
    missing_requirements,
};
use imperium_crypto::{PasswordHash, PasswordHasher, sha256};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{Account, AccountRow, AccountUpdate, Rank, discord_to_column};
use crate::bus::{Message, MessageBus};
use crate::error::{Error, RequirementKind, Result, is_unique_violation};

const SCHEMA: &str = include_str!("../../schema/account.sql");

const TEST_USERNAME: &str = "test";
const TEST_PASSWORD: &str = "test";

/// Owns the `account` and `legacy_account` tables.
pub struct AccountService {
    store: Store,
    hasher: Arc<PasswordHasher>,
    bus: Arc<MessageBus>,
    username_requirements: Vec<StringRequirement>,
    password_requirements: Vec<StringRequirement>,
}

impl AccountService {
    pub fn new(store: Store, hasher: Arc<PasswordHasher>, bus: Arc<MessageBus>) -> Self {
        Self {
            store,
            hasher,
            bus,
            username_requirements: default_username_requirements(),
            password_requirements: default_password_requirements(),
        }
    }

    /// Replace the default requirement lists.
    #[must_use]
    pub fn with_requirements(
        mut self,
        username: Vec<StringRequirement>,
        password: Vec<StringRequirement>,
    ) -> Self {
        self.username_requirements = username;
        self.password_requirements = password;
        self
    }

    pub async fn init(&self) -> Result<()> {
        self.store.execute_script(SCHEMA).await?;
        Ok(())
    }

    pub fn username_requirements(&self) -> &[StringRequirement] {
        &self.username_requirements
    }

    pub fn password_requirements(&self) -> &[StringRequirement] {
        &self.password_requirements
    }

    // =========================================================================
    // Registration and credentials
    // =========================================================================

    /// Create an account, returning its id, or `None` if the username is
    /// taken by a live or legacy account.
    pub async fn register(&self, username: &str, password: &str) -> Result<Option<i64>> {
        check(RequirementKind::Username, &self.username_requirements, username)?;
        check(RequirementKind::Password, &self.password_requirements, password)?;

        let hash = self.hash_fresh(password).await?;

        let mut handle = self.store.begin_immediate().await?;
        if exists_by_username(&mut handle, username).await?
            || exists_legacy_by_username(&mut handle, username).await?
        {
            debug!(username, "Registration rejected, username taken");
            return Ok(None);
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO account (username, password_hash, password_salt, rank, creation) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(username)
        .bind(hash.hash())
        .bind(hash.salt())
        .bind(Rank::Everyone.as_str())
        .bind(unix_timestamp())
        .fetch_one(&mut *handle)
        .await;

        let id = match inserted {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                debug!(username, "Registration lost a race for the username");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        handle.commit().await?;

        info!(account = id, username, "Account registered");
        self.notify(&AccountUpdate { account: id }).await;
        Ok(Some(id))
    }

    /// Replace the password after re-verifying the current one.
    ///
    /// Returns `false` without writing if the account is unknown, the old
    /// password is wrong, or the stored hash changed concurrently.
    pub async fn update_password(&self, id: i64, old: &str, new: &str) -> Result<bool> {
        check(RequirementKind::Password, &self.password_requirements, new)?;

        let Some(current) = self.select_password_by_id(id).await? else {
            return Ok(false);
        };
        if !self.verify(old, current.clone()).await? {
            debug!(account = id, "Password change rejected, wrong password");
            return Ok(false);
        }

        let fresh = self.hash_fresh(new).await?;
        let updated = sqlx::query(
            "UPDATE account SET password_hash = ?, password_salt = ? \
             WHERE id = ? AND password_hash = ? AND password_salt = ?",
        )
        .bind(fresh.hash())
        .bind(fresh.salt())
        .bind(id)
        .bind(current.hash())
        .bind(current.salt())
        .execute(self.store.pool())
        .await?
        .rows_affected()
            > 0;

        if updated {
            info!(account = id, "Password changed");
        }
        Ok(updated)
    }

    pub async fn select_password_by_id(&self, id: i64) -> Result<Option<PasswordHash>> {
        let row: Option<(Vec<u8>, Vec<u8>)> =
            sqlx::query_as("SELECT password_hash, password_salt FROM account WHERE id = ?")
                .bind(id)
                .fetch_optional(self.store.pool())
                .await?;
        Ok(row.map(|(hash, salt)| PasswordHash::new(hash, salt)))
    }

    /// Check `password` against the stored hash of account `id`.
    pub async fn verify_password(&self, id: i64, password: &str) -> Result<bool> {
        match self.select_password_by_id(id).await? {
            Some(expected) => self.verify(password, expected).await,
            None => Ok(false),
        }
    }

    /// Whether `username` belongs to an account migrated from the previous
    /// system and not yet claimed.
    pub async fn exists_legacy_by_username(&self, username: &str) -> Result<bool> {
        let mut conn = self.store.pool().acquire().await?;
        exists_legacy_by_username(&mut conn, username).await
    }

    /// Upsert the well-known `test` / `test` owner account.
    pub async fn seed_test_account(&self) -> Result<i64> {
        let hash = self.hash_fresh(TEST_PASSWORD).await?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO account (username, password_hash, password_salt, rank, creation) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(username) DO UPDATE SET \
             password_hash = excluded.password_hash, \
             password_salt = excluded.password_salt, \
             rank = excluded.rank \
             RETURNING id",
        )
        .bind(TEST_USERNAME)
        .bind(hash.hash())
        .bind(hash.salt())
        .bind(Rank::Owner.as_str())
        .bind(unix_timestamp())
        .fetch_one(self.store.pool())
        .await?;

        warn!(account = id, "Testing mode: seeded the test account, do not use in production");
        self.notify(&AccountUpdate { account: id }).await;
        Ok(id)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn select_by_id(&self, id: i64) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT id, username, discord, playtime, rank, creation, legacy FROM account WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?
        .map(Account::try_from)
        .transpose()
    }

    pub async fn select_by_username(&self, username: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT id, username, discord, playtime, rank, creation, legacy FROM account \
             WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(self.store.pool())
        .await?
        .map(Account::try_from)
        .transpose()
    }

    pub async fn select_by_discord(&self, discord: u64) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT id, username, discord, playtime, rank, creation, legacy FROM account \
             WHERE discord = ?",
        )
        .bind(discord_to_column(discord))
        .fetch_optional(self.store.pool())
        .await?
        .map(Account::try_from)
        .transpose()
    }

    pub async fn exists_by_id(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM account WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(found.is_some())
    }

    pub async fn exists_by_username(&self, username: &str) -> Result<bool> {
        let mut conn = self.store.pool().acquire().await?;
        exists_by_username(&mut conn, username).await
    }

    // =========================================================================
    // Conditional mutators: notify only when a row actually changed
    // =========================================================================

    /// Link a Discord account. `false` if unchanged, unknown, or the id is
    /// already linked to another account.
    pub async fn update_discord(&self, id: i64, discord: u64) -> Result<bool> {
        let result = sqlx::query("UPDATE account SET discord = ? WHERE id = ? AND discord IS NOT ?")
            .bind(discord_to_column(discord))
            .bind(id)
            .bind(discord_to_column(discord))
            .execute(self.store.pool())
            .await;

        let changed = match result {
            Ok(done) => done.rows_affected() > 0,
            Err(e) if is_unique_violation(&e) => {
                debug!(account = id, discord, "Discord id already linked elsewhere");
                false
            }
            Err(e) => return Err(e.into()),
        };
        self.changed(id, changed).await
    }

    pub async fn increment_playtime(&self, id: i64, duration: Duration) -> Result<bool> {
        let seconds = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
        if seconds == 0 {
            return Ok(false);
        }
        let changed = sqlx::query("UPDATE account SET playtime = playtime + ? WHERE id = ?")
            .bind(seconds)
            .bind(id)
            .execute(self.store.pool())
            .await?
            .rows_affected()
            > 0;
        self.changed(id, changed).await
    }

    pub async fn update_rank(&self, id: i64, rank: Rank) -> Result<bool> {
        let changed = sqlx::query("UPDATE account SET rank = ? WHERE id = ? AND rank != ?")
            .bind(rank.as_str())
            .bind(id)
            .bind(rank.as_str())
            .execute(self.store.pool())
            .await?
            .rows_affected()
            > 0;
        if changed {
            info!(account = id, %rank, "Rank updated");
        }
        self.changed(id, changed).await
    }

    async fn changed(&self, id: i64, changed: bool) -> Result<bool> {
        if changed {
            self.notify(&AccountUpdate { account: id }).await;
        }
        Ok(changed)
    }

    /// Broadcast after a committed write. The write stands even if the
    /// broadcast fails, so the failure is logged rather than returned.
    async fn notify<M: Message>(&self, message: &M) {
        if let Err(e) = self.bus.broadcast(message).await {
            warn!(topic = M::TOPIC, error = %e, "Failed to broadcast update");
        }
    }

    // =========================================================================
    // Hashing on the blocking pool
    // =========================================================================

    async fn hash_fresh(&self, password: &str) -> Result<PasswordHash> {
        let hasher = Arc::clone(&self.hasher);
        let password = Zeroizing::new(password.to_owned());
        tokio::task::spawn_blocking(move || hasher.hash_fresh(&password))
            .await
            .map_err(|e| Error::Worker(e.to_string()))?
            .map_err(Error::from)
    }

    async fn verify(&self, password: &str, expected: PasswordHash) -> Result<bool> {
        let hasher = Arc::clone(&self.hasher);
        let password = Zeroizing::new(password.to_owned());
        tokio::task::spawn_blocking(move || hasher.verify(&password, &expected))
            .await
            .map_err(|e| Error::Worker(e.to_string()))?
            .map_err(Error::from)
    }
}

fn check(kind: RequirementKind, requirements: &[StringRequirement], value: &str) -> Result<()> {
    let missing = missing_requirements(requirements, value);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingRequirements { kind, missing })
    }
}

async fn exists_by_username(conn: &mut SqliteConnection, username: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM account WHERE username = ?")
        .bind(username)
        .fetch_optional(conn)
        .await?;
    Ok(found.is_some())
}

async fn exists_legacy_by_username(conn: &mut SqliteConnection, username: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM legacy_account WHERE username_hash = ?")
            .bind(sha256(username.as_bytes()).to_vec())
            .fetch_optional(conn)
            .await?;
    Ok(found.is_some())
}
