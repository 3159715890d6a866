//! Achievements, stored as presence-only metadata keys
//! `achievement_completed_<name>`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::{Message, MessageBus};
use crate::error::{Error, Result};
use crate::metadata::MetadataService;

pub const KEY_PREFIX: &str = "achievement_completed_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Achievement {
    Active,
    Hyper,
    Addict,
    Gamer,
    Steam,
    Discord,
    Day,
    Week,
    Month,
}

impl Achievement {
    pub const ALL: [Self; 9] = [
        Self::Active,
        Self::Hyper,
        Self::Addict,
        Self::Gamer,
        Self::Steam,
        Self::Discord,
        Self::Day,
        Self::Week,
        Self::Month,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Hyper => "HYPER",
            Self::Addict => "ADDICT",
            Self::Gamer => "GAMER",
            Self::Steam => "STEAM",
            Self::Discord => "DISCORD",
            Self::Day => "DAY",
            Self::Week => "WEEK",
            Self::Month => "MONTH",
        }
    }

    /// Progress needed to complete: active days for the activity streaks,
    /// minutes of playtime for the playtime tiers, 1 otherwise.
    pub const fn goal(self) -> u32 {
        match self {
            Self::Active => 7,
            Self::Hyper => 30,
            Self::Addict => 90,
            Self::Gamer => 8 * 60,
            Self::Steam | Self::Discord => 1,
            Self::Day => 24 * 60,
            Self::Week => 7 * 24 * 60,
            Self::Month => 30 * 24 * 60,
        }
    }

    /// Hidden from players until completed.
    pub const fn secret(self) -> bool {
        matches!(self, Self::Active | Self::Hyper | Self::Addict)
    }

    /// The metadata key recording completion.
    pub fn key(self) -> String {
        format!("{KEY_PREFIX}{}", self.as_str().to_ascii_lowercase())
    }
}

impl fmt::Display for Achievement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Achievement {
    type Err = Error;

    /// Case-insensitive name lookup.
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Corrupted(format!("unknown achievement {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementUpdate {
    pub account: i64,
    pub achievement: Achievement,
    pub completed: bool,
}

impl Message for AchievementUpdate {
    const TOPIC: &'static str = "imperium.account.AchievementUpdate";
}

pub fn register_messages(bus: &MessageBus) {
    bus.register::<AchievementUpdate>();
}

pub struct AchievementService {
    metadata: Arc<MetadataService>,
    bus: Arc<MessageBus>,
}

impl AchievementService {
    pub const fn new(metadata: Arc<MetadataService>, bus: Arc<MessageBus>) -> Self {
        Self { metadata, bus }
    }

    pub async fn select_achievement(&self, account: i64, achievement: Achievement) -> Result<bool> {
        Ok(self
            .metadata
            .select_metadata(account, &achievement.key())
            .await?
            .is_some())
    }

    /// Completed achievements. Keys naming no known achievement are skipped.
    pub async fn select_all_achievements(&self, account: i64) -> Result<BTreeSet<Achievement>> {
        let entries = self
            .metadata
            .select_all_metadata_by_prefix(account, KEY_PREFIX)
            .await?;

        let mut completed = BTreeSet::new();
        for key in entries.keys() {
            let Some(name) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            match name.parse() {
                Ok(achievement) => {
                    completed.insert(achievement);
                }
                Err(_) => debug!(account, key = %key, "Skipped unknown achievement"),
            }
        }
        Ok(completed)
    }

    /// Mark `achievement` completed or not. `true` iff that changed.
    pub async fn upsert_achievement(
        &self,
        account: i64,
        achievement: Achievement,
        completed: bool,
    ) -> Result<bool> {
        let key = achievement.key();
        let changed = if completed {
            self.metadata.update_metadata(account, &key, "").await?
        } else {
            self.metadata.delete_metadata(account, &key).await?
        };

        if changed {
            info!(account, %achievement, completed, "Achievement updated");
            let update = AchievementUpdate {
                account,
                achievement,
                completed,
            };
            if let Err(e) = self.bus.broadcast(&update).await {
                warn!(account, %achievement, error = %e, "Failed to broadcast achievement update");
            }
        }
        Ok(changed)
    }
}
