//! Accounts: registration, credentials, ranks and the notifications that
//! keep other nodes in sync.

mod service;

#[cfg(test)]
mod tests;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{Message, MessageBus};
use crate::error::Error;

pub use service::AccountService;

/// Linear authority ordering. Later variants outrank earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rank {
    Everyone,
    Verified,
    Overseer,
    Moderator,
    Admin,
    Owner,
}

impl Rank {
    pub const ALL: [Self; 6] = [
        Self::Everyone,
        Self::Verified,
        Self::Overseer,
        Self::Moderator,
        Self::Admin,
        Self::Owner,
    ];

    /// Name as stored in the `rank` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Everyone => "EVERYONE",
            Self::Verified => "VERIFIED",
            Self::Overseer => "OVERSEER",
            Self::Moderator => "MODERATOR",
            Self::Admin => "ADMIN",
            Self::Owner => "OWNER",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rank {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|rank| rank.as_str() == s)
            .ok_or_else(|| Error::Corrupted(format!("unknown rank {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub discord: Option<u64>,
    pub playtime: Duration,
    /// Unix seconds.
    pub creation: i64,
    /// Migrated from the previous account system.
    pub legacy: bool,
    pub rank: Rank,
}

#[derive(sqlx::FromRow)]
pub(crate) struct AccountRow {
    id: i64,
    username: String,
    discord: Option<i64>,
    playtime: i64,
    rank: String,
    creation: i64,
    legacy: bool,
}

impl TryFrom<AccountRow> for Account {
    type Error = Error;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let playtime = u64::try_from(row.playtime).map_err(|_| {
            Error::Corrupted(format!("account {} has negative playtime", row.id))
        })?;
        Ok(Self {
            id: row.id,
            username: row.username,
            discord: row.discord.map(discord_from_column),
            playtime: Duration::from_secs(playtime),
            creation: row.creation,
            legacy: row.legacy,
            rank: row.rank.parse()?,
        })
    }
}

/// Discord snowflakes are stored bit-for-bit in a signed column.
#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn discord_to_column(discord: u64) -> i64 {
    discord as i64
}

#[allow(clippy::cast_sign_loss)]
pub(crate) const fn discord_from_column(discord: i64) -> u64 {
    discord as u64
}

/// Some field of the account changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub account: i64,
}

impl Message for AccountUpdate {
    const TOPIC: &'static str = "imperium.account.AccountUpdate";
}

/// Make the account topics decodable on `bus`.
pub fn register_messages(bus: &MessageBus) {
    bus.register::<AccountUpdate>();
}
