//! Topic registry: maps a topic string to its decoder and subscribers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use super::Message;

/// A decoded message whose concrete type is only known to the subscribers
/// of its topic.
pub(crate) type Decoded = Arc<dyn Any + Send + Sync>;

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub(crate) type Handler = Arc<dyn Fn(Decoded) -> HandlerFuture + Send + Sync>;

type Decoder = fn(&str) -> Result<Decoded, serde_json::Error>;

struct TopicEntry {
    decode: Decoder,
    handlers: Vec<Handler>,
}

/// Outcome of resolving a polled envelope.
pub(crate) enum Resolved {
    /// No module registered the topic.
    Unknown,
    Malformed(serde_json::Error),
    Decoded(Decoded, Vec<Handler>),
}

#[derive(Default)]
pub(crate) struct Registry {
    topics: RwLock<HashMap<&'static str, TopicEntry>>,
}

fn decode<M: Message>(payload: &str) -> Result<Decoded, serde_json::Error> {
    let message: M = serde_json::from_str(payload)?;
    Ok(Arc::new(message))
}

impl Registry {
    /// Make `M` decodable. Idempotent.
    pub(crate) fn register<M: Message>(&self) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics.entry(M::TOPIC).or_insert_with(|| TopicEntry {
            decode: decode::<M>,
            handlers: Vec::new(),
        });
    }

    pub(crate) fn subscribe<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |decoded: Decoded| -> HandlerFuture {
            match decoded.downcast_ref::<M>() {
                Some(message) => Box::pin(handler(message.clone())),
                None => Box::pin(async {
                    Err(anyhow::anyhow!("message is not a {}", M::TOPIC))
                }),
            }
        });

        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(M::TOPIC)
            .or_insert_with(|| TopicEntry {
                decode: decode::<M>,
                handlers: Vec::new(),
            })
            .handlers
            .push(handler);
    }

    pub(crate) fn resolve(&self, topic: &str, payload: &str) -> Resolved {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = topics.get(topic) else {
            return Resolved::Unknown;
        };
        match (entry.decode)(payload) {
            Ok(decoded) => Resolved::Decoded(decoded, entry.handlers.clone()),
            Err(e) => Resolved::Malformed(e),
        }
    }

    pub(crate) fn is_registered(&self, topic: &str) -> bool {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.contains_key(topic)
    }
}
