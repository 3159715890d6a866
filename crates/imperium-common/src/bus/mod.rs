//! Cross-process message bus built on table polling.
//!
//! Every node keeps a heartbeat row in `message_queue_sender`. Broadcasting
//! fans a JSON payload out into `message_queue`, one row per other node
//! whose heartbeat is fresh. Each node polls its own rows on a fixed delay,
//! deletes them in the same transaction, then hands the decoded messages to
//! its subscribers on independent tasks. Delivery is at most once.

mod poller;
mod registry;


use std::future::Future;
use std::sync::Arc;

use imperium_core::config::MessengerConfig;
use imperium_core::db::unix_timestamp_micros;
use imperium_core::{Store, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqliteConnection;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

pub use poller::BusPoller;
use registry::{Registry, Resolved};

const SCHEMA: &str = include_str!("../../schema/bus.sql");

/// A payload that can travel over the bus.
///
/// `TOPIC` is the fully-qualified logical name stored next to each payload;
/// receivers look it up in their registry to pick a decoder.
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TOPIC: &'static str;
}

/// Bus failures. Only publishing and polling report errors; decode and
/// handler failures are logged where they happen.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode {topic}: {source}")]
    Encode {
        topic: &'static str,
        source: serde_json::Error,
    },

    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
}

impl From<sqlx::Error> for BusError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.into())
    }
}

#[derive(sqlx::FromRow)]
struct Envelope {
    id: i64,
    topic: String,
    payload: String,
}

/// One node's endpoint on the bus.
pub struct MessageBus {
    store: Store,
    name: String,
    config: MessengerConfig,
    registry: Registry,
}

impl MessageBus {
    /// Create an endpoint named `name`. The name must be unique among live
    /// nodes sharing the store.
    pub fn new(store: Store, name: impl Into<String>, config: MessengerConfig) -> Self {
        Self {
            store,
            name: name.into(),
            config,
            registry: Registry::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Apply the schema, drop envelopes left over from a previous run of
    /// this node and write the first heartbeat.
    pub async fn init(&self) -> Result<(), BusError> {
        self.store.execute_script(SCHEMA).await?;

        let mut handle = self.store.begin_immediate().await?;
        let stale = sqlx::query("DELETE FROM message_queue WHERE sender_name = ?")
            .bind(&self.name)
            .execute(&mut *handle)
            .await?
            .rows_affected();
        self.heartbeat(&mut *handle, unix_timestamp_micros()).await?;
        handle.commit().await?;

        if stale > 0 {
            debug!(sender = %self.name, stale, "Discarded envelopes from a previous run");
        }
        Ok(())
    }

    /// Make `M` decodable without subscribing to it.
    pub fn register<M: Message>(&self) {
        self.registry.register::<M>();
    }

    /// Run `handler` for every `M` received. Any number of handlers may
    /// share a topic; each runs on its own task.
    pub fn subscribe<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.subscribe::<M, F, Fut>(handler);
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.registry.is_registered(topic)
    }

    /// Queue `message` for every other node with a fresh heartbeat.
    pub async fn broadcast<M: Message>(&self, message: &M) -> Result<(), BusError> {
        let payload = serde_json::to_string(message).map_err(|source| BusError::Encode {
            topic: M::TOPIC,
            source,
        })?;
        if payload.len() > self.config.max_payload_bytes {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_bytes,
            });
        }

        let now = unix_timestamp_micros();
        let fresh_since = now - micros(self.config.heartbeat_timeout());

        let mut handle = self.store.begin_immediate().await?;
        let receivers = sqlx::query(
            "INSERT INTO message_queue (sender_name, topic, payload, timestamp) \
             SELECT name, ?, ?, ? FROM message_queue_sender WHERE last_poll >= ? AND name != ?",
        )
        .bind(M::TOPIC)
        .bind(&payload)
        .bind(now)
        .bind(fresh_since)
        .bind(&self.name)
        .execute(&mut *handle)
        .await?
        .rows_affected();
        handle.commit().await?;

        debug!(topic = M::TOPIC, receivers, "Broadcast message");
        Ok(())
    }

    /// Run one poll cycle and spawn a dispatch task per handler into `tasks`.
    ///
    /// Returns the number of envelopes taken off the queue.
    pub(crate) async fn poll(&self, tasks: &mut JoinSet<()>) -> Result<usize, BusError> {
        let envelopes = self.take().await?;
        for envelope in &envelopes {
            self.dispatch(envelope, tasks);
        }
        Ok(envelopes.len())
    }

    /// Heartbeat, prune stale senders, then select and delete this node's
    /// envelopes, oldest first, in one transaction.
    async fn take(&self) -> Result<Vec<Envelope>, BusError> {
        let now = unix_timestamp_micros();
        let retain_since = now - micros(self.config.sender_retention());

        let mut handle = self.store.begin_immediate().await?;
        self.heartbeat(&mut *handle, now).await?;

        let pruned = sqlx::query("DELETE FROM message_queue_sender WHERE last_poll < ?")
            .bind(retain_since)
            .execute(&mut *handle)
            .await?
            .rows_affected();
        if pruned > 0 {
            debug!(pruned, "Pruned stale senders");
        }

        let envelopes = sqlx::query_as::<_, Envelope>(
            "SELECT id, topic, payload FROM message_queue WHERE sender_name = ? ORDER BY id ASC",
        )
        .bind(&self.name)
        .fetch_all(&mut *handle)
        .await?;

        if let Some(last) = envelopes.last() {
            let deleted =
                sqlx::query("DELETE FROM message_queue WHERE sender_name = ? AND id <= ?")
                    .bind(&self.name)
                    .bind(last.id)
                    .execute(&mut *handle)
                    .await?
                    .rows_affected();
            if usize::try_from(deleted).ok() != Some(envelopes.len()) {
                warn!(
                    selected = envelopes.len(),
                    deleted, "Deleted envelope count does not match the polled count"
                );
            }
        }
        handle.commit().await?;

        Ok(envelopes)
    }

    fn dispatch(&self, envelope: &Envelope, tasks: &mut JoinSet<()>) {
        let (decoded, handlers) = match self.registry.resolve(&envelope.topic, &envelope.payload) {
            Resolved::Decoded(decoded, handlers) => (decoded, handlers),
            Resolved::Unknown => {
                debug!(topic = %envelope.topic, "Dropped message with unknown topic");
                return;
            }
            Resolved::Malformed(e) => {
                error!(topic = %envelope.topic, error = %e, "Dropped undecodable message");
                return;
            }
        };

        for handler in handlers {
            let decoded = Arc::clone(&decoded);
            let topic = envelope.topic.clone();
            tasks.spawn(async move {
                if let Err(e) = handler(decoded).await {
                    warn!(topic = %topic, error = %e, "Message handler failed");
                }
            });
        }
    }

    async fn heartbeat(&self, conn: &mut SqliteConnection, now: i64) -> Result<(), BusError> {
        sqlx::query(
            "INSERT INTO message_queue_sender (name, last_poll) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET last_poll = excluded.last_poll",
        )
        .bind(&self.name)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Start polling on a background task.
    pub fn start(self: &Arc<Self>) -> BusPoller {
        BusPoller::spawn(Arc::clone(self))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn micros(duration: std::time::Duration) -> i64 {
    duration.as_micros() as i64
}
