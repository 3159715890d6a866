//! Shared fixture for service tests: every service wired to one in-memory
//! store, plus a second bus endpoint that collects what gets broadcast.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use imperium_core::Store;
use imperium_core::config::{MessengerConfig, SessionConfig};
use imperium_crypto::{HashParams, PasswordHasher};

use crate::account::AccountService;
use crate::achievement::AchievementService;
use crate::bus::{Message, MessageBus};
use crate::metadata::MetadataService;
use crate::session::SessionService;

pub const PASSWORD: &str = "Sup3r-secret";
pub const PEER: &str = "node-peer";

pub struct Fixture {
    pub store: Store,
    pub bus: Arc<MessageBus>,
    pub peer: Arc<MessageBus>,
    pub accounts: Arc<AccountService>,
    pub sessions: Arc<SessionService>,
    pub metadata: Arc<MetadataService>,
    pub achievements: Arc<AchievementService>,
}

impl Fixture {
    pub async fn new() -> Self {
        let store = Store::open_in_memory().await.unwrap();
        let bus = Arc::new(MessageBus::new(store.clone(), "node-a", MessengerConfig::default()));
        bus.init().await.unwrap();
        let peer = Arc::new(MessageBus::new(store.clone(), PEER, MessengerConfig::default()));
        peer.init().await.unwrap();

        let hasher = Arc::new(PasswordHasher::new(HashParams::testing()).unwrap());
        let accounts = Arc::new(AccountService::new(store.clone(), hasher, Arc::clone(&bus)));
        accounts.init().await.unwrap();

        let sessions = Arc::new(SessionService::new(
            store.clone(),
            Arc::clone(&accounts),
            Arc::clone(&bus),
            SessionConfig::default().window(),
        ));
        sessions.init().await.unwrap();

        let metadata = Arc::new(MetadataService::new(store.clone(), Arc::clone(&bus)));
        metadata.init().await.unwrap();
        let achievements = Arc::new(AchievementService::new(
            Arc::clone(&metadata),
            Arc::clone(&bus),
        ));

        Self {
            store,
            bus,
            peer,
            accounts,
            sessions,
            metadata,
            achievements,
        }
    }

    /// Register `username` with [`PASSWORD`].
    pub async fn account(&self, username: &str) -> i64 {
        self.accounts
            .register(username, PASSWORD)
            .await
            .unwrap()
            .unwrap()
    }
}

/// Take the `M` envelopes queued for the peer, oldest first. Envelopes of
/// other topics stay queued.
pub async fn received<M: Message>(f: &Fixture) -> Vec<M> {
    let payloads: Vec<String> = sqlx::query_scalar(
        "SELECT payload FROM message_queue WHERE sender_name = ? AND topic = ? ORDER BY id",
    )
    .bind(PEER)
    .bind(M::TOPIC)
    .fetch_all(f.store.pool())
    .await
    .unwrap();

    sqlx::query("DELETE FROM message_queue WHERE sender_name = ? AND topic = ?")
        .bind(PEER)
        .bind(M::TOPIC)
        .execute(f.store.pool())
        .await
        .unwrap();

    payloads
        .iter()
        .map(|payload| serde_json::from_str(payload).unwrap())
        .collect()
}
