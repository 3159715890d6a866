//! Session queries, login and logout.

use std::sync::Arc;
use std::time::Duration;

use imperium_core::Store;
use imperium_core::db::unix_timestamp;
use tracing::{debug, info, warn};

use super::{
    Session, SessionKey, SessionRow, SessionUpdate, SessionUpdateKind, address_from_column,
    address_to_column,
};
use crate::account::AccountService;
use crate::bus::MessageBus;
use crate::error::{Result, is_unique_violation};

const SCHEMA: &str = include_str!("../../schema/session.sql");

/// Owns the `account_mindustry_session` table.
///
/// Dead sessions are never swept in bulk: each read deletes the dead rows it
/// finds and announces them.
pub struct SessionService {
    store: Store,
    accounts: Arc<AccountService>,
    bus: Arc<MessageBus>,
    window: i64,
}

impl SessionService {
    pub fn new(
        store: Store,
        accounts: Arc<AccountService>,
        bus: Arc<MessageBus>,
        window: Duration,
    ) -> Self {
        Self {
            store,
            accounts,
            bus,
            window: i64::try_from(window.as_secs()).unwrap_or(i64::MAX),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.store.execute_script(SCHEMA).await?;
        Ok(())
    }

    /// The live session for `key`, if any.
    pub async fn select_by_key(&self, key: SessionKey) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT account_id, uuid, usid, address, server, created_at, expires_at, last_login \
             FROM account_mindustry_session WHERE uuid = ? AND usid = ? AND address = ?",
        )
        .bind(key.uuid)
        .bind(key.usid)
        .bind(address_to_column(key.address))
        .fetch_optional(self.store.pool())
        .await?;

        match row {
            Some(row) => self.validate(Session::try_from(row)?, unix_timestamp()).await,
            None => Ok(None),
        }
    }

    /// Every live session of `account`.
    pub async fn select_all_by_account(&self, account: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT account_id, uuid, usid, address, server, created_at, expires_at, last_login \
             FROM account_mindustry_session WHERE account_id = ?",
        )
        .bind(account)
        .fetch_all(self.store.pool())
        .await?;

        let now = unix_timestamp();
        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(session) = self.validate(Session::try_from(row)?, now).await? {
                live.push(session);
            }
        }
        Ok(live)
    }

    /// Open a session for `key`.
    ///
    /// `false` if the key already has a live session, the username is
    /// unknown or the password is wrong. Callers cannot tell which.
    pub async fn login(&self, key: SessionKey, username: &str, password: &str) -> Result<bool> {
        if self.select_by_key(key).await?.is_some() {
            debug!(?key, "Login rejected, session already open");
            return Ok(false);
        }
        let Some(account) = self.accounts.select_by_username(username).await? else {
            return Ok(false);
        };
        if !self.accounts.verify_password(account.id, password).await? {
            return Ok(false);
        }

        let now = unix_timestamp();
        let address = address_to_column(key.address);
        let mut handle = self.store.begin_immediate().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT last_login FROM account_mindustry_session \
             WHERE uuid = ? AND usid = ? AND address = ?",
        )
        .bind(key.uuid)
        .bind(key.usid)
        .bind(&address)
        .fetch_optional(&mut *handle)
        .await?;
        if let Some(last_login) = existing {
            if now < last_login.saturating_add(self.window) {
                debug!(?key, "Login lost a race for the session key");
                return Ok(false);
            }
            sqlx::query(
                "DELETE FROM account_mindustry_session WHERE uuid = ? AND usid = ? AND address = ?",
            )
            .bind(key.uuid)
            .bind(key.usid)
            .bind(&address)
            .execute(&mut *handle)
            .await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO account_mindustry_session \
             (account_id, uuid, usid, address, server, created_at, last_login, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account.id)
        .bind(key.uuid)
        .bind(key.usid)
        .bind(&address)
        .bind(self.bus.name())
        .bind(now)
        .bind(now)
        .bind(now.saturating_add(self.window))
        .execute(&mut *handle)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                debug!(?key, "Login lost a race for the session key");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        handle.commit().await?;

        info!(account = account.id, ?key, "Session opened");
        self.notify(key, SessionUpdateKind::Create).await;
        Ok(true)
    }

    /// Close the session of `key`, or with `all`, every session of its
    /// account. `false` if `key` has no live session.
    pub async fn logout(&self, key: SessionKey, all: bool) -> Result<bool> {
        let Some(session) = self.select_by_key(key).await? else {
            return Ok(false);
        };

        let removed: Vec<(i64, i64, Vec<u8>)> = if all {
            sqlx::query_as(
                "DELETE FROM account_mindustry_session WHERE account_id = ? \
                 RETURNING uuid, usid, address",
            )
            .bind(session.account)
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query_as(
                "DELETE FROM account_mindustry_session WHERE uuid = ? AND usid = ? AND address = ? \
                 RETURNING uuid, usid, address",
            )
            .bind(key.uuid)
            .bind(key.usid)
            .bind(address_to_column(key.address))
            .fetch_all(self.store.pool())
            .await?
        };

        info!(account = session.account, all, removed = removed.len(), "Sessions closed");
        for (uuid, usid, address) in &removed {
            match address_from_column(address) {
                Ok(address) => {
                    self.notify(SessionKey::new(*uuid, *usid, address), SessionUpdateKind::Delete)
                        .await;
                }
                Err(e) => warn!(error = %e, "Removed a session with a corrupted address"),
            }
        }
        Ok(!removed.is_empty())
    }

    /// Slide a live session forward as if the client just logged in again.
    pub async fn refresh(&self, key: SessionKey) -> Result<bool> {
        let now = unix_timestamp();
        let refreshed = sqlx::query(
            "UPDATE account_mindustry_session SET last_login = ?, expires_at = ? \
             WHERE uuid = ? AND usid = ? AND address = ? AND last_login > ?",
        )
        .bind(now)
        .bind(now.saturating_add(self.window))
        .bind(key.uuid)
        .bind(key.usid)
        .bind(address_to_column(key.address))
        .bind(now.saturating_sub(self.window))
        .execute(self.store.pool())
        .await?
        .rows_affected()
            > 0;
        Ok(refreshed)
    }

    /// Keep `session` if live; otherwise delete it and announce the removal.
    async fn validate(&self, session: Session, now: i64) -> Result<Option<Session>> {
        if session.is_live(now, self.window) {
            return Ok(Some(session));
        }

        let deleted = sqlx::query(
            "DELETE FROM account_mindustry_session \
             WHERE uuid = ? AND usid = ? AND address = ? AND last_login = ?",
        )
        .bind(session.key.uuid)
        .bind(session.key.usid)
        .bind(address_to_column(session.key.address))
        .bind(session.last_login)
        .execute(self.store.pool())
        .await?
        .rows_affected()
            > 0;
        if deleted {
            debug!(key = ?session.key, "Removed dead session");
            self.notify(session.key, SessionUpdateKind::Delete).await;
        }
        Ok(None)
    }

    async fn notify(&self, key: SessionKey, kind: SessionUpdateKind) {
        if let Err(e) = self.bus.broadcast(&SessionUpdate { key, kind }).await {
            warn!(?key, error = %e, "Failed to broadcast session update");
        }
    }
}
