//! Composition root: wires every service of a node in dependency order.

use std::sync::Arc;

use imperium_core::config::SecurityConfig;
use imperium_core::{ImperiumConfig, Store};
use imperium_crypto::{HashParams, PasswordHasher};
use tokio::sync::Mutex;
use tracing::info;

use crate::account::{self, AccountService};
use crate::achievement::{self, AchievementService};
use crate::bus::{BusPoller, MessageBus};
use crate::cache::AccountCache;
use crate::error::Result;
use crate::metadata::{self, MetadataService};
use crate::session::{self, SessionService};

pub struct Services {
    pub store: Store,
    pub bus: Arc<MessageBus>,
    pub accounts: Arc<AccountService>,
    pub sessions: Arc<SessionService>,
    pub metadata: Arc<MetadataService>,
    pub achievements: Arc<AchievementService>,
    pub cache: Arc<AccountCache>,
    poller: Mutex<Option<BusPoller>>,
}

impl Services {
    /// Open the store, apply every schema and register every topic.
    pub async fn build(config: &ImperiumConfig) -> Result<Self> {
        let store = Store::connect(&config.database).await?;
        let hasher = Arc::new(PasswordHasher::new(hash_params(&config.security))?);

        let bus = Arc::new(MessageBus::new(
            store.clone(),
            config.server.name.clone(),
            config.messenger.clone(),
        ));
        bus.init().await?;

        let accounts = Arc::new(AccountService::new(store.clone(), hasher, Arc::clone(&bus)));
        accounts.init().await?;

        let sessions = Arc::new(SessionService::new(
            store.clone(),
            Arc::clone(&accounts),
            Arc::clone(&bus),
            config.session.window(),
        ));
        sessions.init().await?;

        let metadata = Arc::new(MetadataService::new(store.clone(), Arc::clone(&bus)));
        metadata.init().await?;

        let achievements = Arc::new(AchievementService::new(
            Arc::clone(&metadata),
            Arc::clone(&bus),
        ));

        let cache = Arc::new(AccountCache::new(
            Arc::clone(&accounts),
            Arc::clone(&sessions),
            Arc::clone(&metadata),
            Arc::clone(&achievements),
        ));

        account::register_messages(&bus);
        session::register_messages(&bus);
        metadata::register_messages(&bus);
        achievement::register_messages(&bus);
        cache.subscribe(&bus);

        info!(server = %config.server.name, "Services ready");

        Ok(Self {
            store,
            bus,
            accounts,
            sessions,
            metadata,
            achievements,
            cache,
            poller: Mutex::new(None),
        })
    }

    /// Start polling the bus. Idempotent.
    pub async fn start(&self) {
        let mut poller = self.poller.lock().await;
        if poller.is_none() {
            *poller = Some(self.bus.start());
        }
    }

    /// Stop polling, drain in-flight handlers, then close the store.
    pub async fn shutdown(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.shutdown().await;
        }
        self.store.close().await;
    }
}

pub const fn hash_params(security: &SecurityConfig) -> HashParams {
    HashParams {
        memory_kib: security.memory_kib,
        iterations: security.iterations,
        parallelism: security.parallelism,
        output_len: security.output_length,
        salt_len: security.salt_length,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::{IpAddr, Ipv6Addr};
    use std::time::Duration;

    use imperium_core::config::MessengerConfig;

    use super::*;
    use crate::account::Rank;
    use crate::session::SessionKey;

    fn config(name: &str) -> ImperiumConfig {
        let mut config = ImperiumConfig::default();
        config.server.name = name.to_string();
        config.database.memory = true;
        config.security = SecurityConfig {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
            output_length: 32,
            salt_length: 16,
        };
        config.messenger = MessengerConfig {
            poll_interval_ms: 10,
            ..MessengerConfig::default()
        };
        config
    }

    #[test]
    fn security_section_maps_onto_hash_params() {
        assert_eq!(hash_params(&SecurityConfig::default()), HashParams::default());
    }

    #[tokio::test]
    async fn build_registers_every_topic() {
        let services = Services::build(&config("hub")).await.unwrap();
        for topic in [
            "imperium.account.AccountUpdate",
            "imperium.account.SessionUpdate",
            "imperium.account.MetadataUpdate",
            "imperium.account.AchievementUpdate",
        ] {
            assert!(services.bus.is_registered(topic), "{topic}");
        }
        services.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_hash_params_fail_the_build() {
        let mut config = config("hub");
        config.security.salt_length = 2;
        assert!(Services::build(&config).await.is_err());
    }

    #[tokio::test]
    async fn cache_follows_writes_from_another_node() {
        let services = Services::build(&config("hub")).await.unwrap();
        let remote = MessageBus::new(services.store.clone(), "survival", MessengerConfig::default());
        remote.init().await.unwrap();
        services.start().await;

        let id = services
            .accounts
            .register("player_one", "Sup3r-secret")
            .await
            .unwrap()
            .unwrap();
        let key = SessionKey::new(7, 8, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(services.sessions.login(key, "player_one", "Sup3r-secret").await.unwrap());
        services.cache.load(key).await.unwrap().unwrap();

        sqlx::query("UPDATE account SET rank = 'ADMIN' WHERE id = ?")
            .bind(id)
            .execute(services.store.pool())
            .await
            .unwrap();
        remote.broadcast(&account::AccountUpdate { account: id }).await.unwrap();

        let refreshed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if services.cache.get(key).await.unwrap().account.rank == Rank::Admin {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(refreshed.is_ok());

        services.shutdown().await;
    }
}
