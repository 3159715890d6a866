//! Per-node cache of the accounts behind connected clients.
//!
//! Entries are loaded on demand from the store and kept coherent with
//! writes made by other nodes through bus notifications. The cache is never
//! authoritative; a miss always falls back to [`AccountCache::load`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::account::{Account, AccountService, AccountUpdate};
use crate::achievement::{Achievement, AchievementService, AchievementUpdate};
use crate::bus::MessageBus;
use crate::error::Result;
use crate::metadata::{MetadataService, MetadataUpdate};
use crate::session::{SessionKey, SessionService, SessionUpdate, SessionUpdateKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAccount {
    pub account: Account,
    pub achievements: BTreeSet<Achievement>,
    pub metadata: BTreeMap<String, String>,
}

pub struct AccountCache {
    accounts: Arc<AccountService>,
    sessions: Arc<SessionService>,
    metadata: Arc<MetadataService>,
    achievements: Arc<AchievementService>,
    entries: RwLock<HashMap<SessionKey, CachedAccount>>,
}

impl AccountCache {
    pub fn new(
        accounts: Arc<AccountService>,
        sessions: Arc<SessionService>,
        metadata: Arc<MetadataService>,
        achievements: Arc<AchievementService>,
    ) -> Self {
        Self {
            accounts,
            sessions,
            metadata,
            achievements,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Follow remote account, metadata, achievement and session changes.
    ///
    /// Handlers hold a weak reference, so subscribing does not keep the
    /// cache alive.
    pub fn subscribe(self: &Arc<Self>, bus: &MessageBus) {
        let weak = Arc::downgrade(self);
        bus.subscribe(move |update: AccountUpdate| {
            let cache = weak.upgrade();
            async move {
                if let Some(cache) = cache {
                    cache.refresh_account(update.account).await?;
                }
                anyhow::Ok(())
            }
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(move |update: MetadataUpdate| {
            let cache = weak.upgrade();
            async move {
                if let Some(cache) = cache {
                    cache.apply_metadata(update).await;
                }
                anyhow::Ok(())
            }
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(move |update: AchievementUpdate| {
            let cache = weak.upgrade();
            async move {
                if let Some(cache) = cache {
                    cache.apply_achievement(update).await;
                }
                anyhow::Ok(())
            }
        });

        let weak = Arc::downgrade(self);
        bus.subscribe(move |update: SessionUpdate| {
            let cache = weak.upgrade();
            async move {
                if let (Some(cache), SessionUpdateKind::Delete) = (cache, update.kind) {
                    cache.evict(update.key).await;
                }
                anyhow::Ok(())
            }
        });
    }

    /// Load the account logged in under `key` and cache it. `None` if the
    /// key has no live session.
    pub async fn load(&self, key: SessionKey) -> Result<Option<CachedAccount>> {
        let Some(session) = self.sessions.select_by_key(key).await? else {
            return Ok(None);
        };
        let Some(account) = self.accounts.select_by_id(session.account).await? else {
            return Ok(None);
        };
        let entry = CachedAccount {
            achievements: self.achievements.select_all_achievements(account.id).await?,
            metadata: self.metadata.select_all_metadata(account.id).await?,
            account,
        };

        self.entries.write().await.insert(key, entry.clone());
        debug!(?key, account = entry.account.id, "Cached account");
        Ok(Some(entry))
    }

    pub async fn get(&self, key: SessionKey) -> Option<CachedAccount> {
        self.entries.read().await.get(&key).cloned()
    }

    pub async fn evict(&self, key: SessionKey) -> Option<CachedAccount> {
        self.entries.write().await.remove(&key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Re-read account `id` into every entry that holds it.
    pub async fn refresh_account(&self, id: i64) -> Result<()> {
        if !self.holds(id).await {
            return Ok(());
        }
        let Some(account) = self.accounts.select_by_id(id).await? else {
            return Ok(());
        };
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut().filter(|e| e.account.id == id) {
            entry.account = account.clone();
        }
        Ok(())
    }

    async fn apply_metadata(&self, update: MetadataUpdate) {
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut().filter(|e| e.account.id == update.account) {
            match &update.value {
                Some(value) => {
                    entry.metadata.insert(update.key.clone(), value.clone());
                }
                None => {
                    entry.metadata.remove(&update.key);
                }
            }
        }
    }

    async fn apply_achievement(&self, update: AchievementUpdate) {
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut().filter(|e| e.account.id == update.account) {
            if update.completed {
                entry.achievements.insert(update.achievement);
            } else {
                entry.achievements.remove(&update.achievement);
            }
        }
    }

    async fn holds(&self, id: i64) -> bool {
        self.entries.read().await.values().any(|e| e.account.id == id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::task::JoinSet;

    use super::*;
    use crate::account::Rank;
    use crate::test_helpers::{Fixture, PASSWORD};

    const KEY: SessionKey = SessionKey::new(1, 2, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

    fn cached(f: &Fixture) -> Arc<AccountCache> {
        let cache = Arc::new(AccountCache::new(
            Arc::clone(&f.accounts),
            Arc::clone(&f.sessions),
            Arc::clone(&f.metadata),
            Arc::clone(&f.achievements),
        ));
        cache.subscribe(&f.peer);
        cache
    }

    async fn deliver(f: &Fixture) {
        let mut tasks = JoinSet::new();
        f.peer.poll(&mut tasks).await.unwrap();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn load_requires_a_live_session() {
        let f = Fixture::new().await;
        let cache = cached(&f);
        f.account("player_one").await;

        assert_eq!(cache.load(KEY).await.unwrap(), None);
        assert!(cache.is_empty().await);

        assert!(f.sessions.login(KEY, "player_one", PASSWORD).await.unwrap());
        let entry = cache.load(KEY).await.unwrap().unwrap();
        assert_eq!(entry.account.username, "player_one");
        assert_eq!(cache.get(KEY).await, Some(entry));
    }

    #[tokio::test]
    async fn remote_writes_refresh_entries() {
        let f = Fixture::new().await;
        let cache = cached(&f);
        let account = f.account("player_one").await;
        f.sessions.login(KEY, "player_one", PASSWORD).await.unwrap();
        cache.load(KEY).await.unwrap();

        f.accounts.update_rank(account, Rank::Moderator).await.unwrap();
        f.metadata.update_metadata(account, "color", "red").await.unwrap();
        f.achievements
            .upsert_achievement(account, Achievement::Discord, true)
            .await
            .unwrap();
        deliver(&f).await;

        let entry = cache.get(KEY).await.unwrap();
        assert_eq!(entry.account.rank, Rank::Moderator);
        assert_eq!(entry.metadata.get("color").map(String::as_str), Some("red"));
        assert!(entry.achievements.contains(&Achievement::Discord));
    }

    #[tokio::test]
    async fn remote_logout_evicts() {
        let f = Fixture::new().await;
        let cache = cached(&f);
        f.account("player_one").await;
        f.sessions.login(KEY, "player_one", PASSWORD).await.unwrap();
        cache.load(KEY).await.unwrap();

        assert!(f.sessions.logout(KEY, false).await.unwrap());
        deliver(&f).await;

        assert_eq!(cache.get(KEY).await, None);
    }
}
