//! Imperium shared services.
//!
//! State shared by every node of an Imperium network:
//! - Message bus over table polling in the shared store
//! - Accounts, credentials and ranks
//! - Game-client sessions with a sliding validity window
//! - Per-account metadata and achievements
//! - A per-node account cache kept coherent through the bus

pub mod account;
pub mod achievement;
pub mod bus;
pub mod cache;
pub mod error;
pub mod metadata;
pub mod services;
pub mod session;

#[cfg(test)]
mod test_helpers;

pub use account::{Account, AccountService, AccountUpdate, Rank};
pub use achievement::{Achievement, AchievementService, AchievementUpdate};
pub use bus::{BusError, BusPoller, Message, MessageBus};
pub use cache::{AccountCache, CachedAccount};
pub use error::{Error, RequirementKind, Result};
pub use metadata::{MetadataService, MetadataUpdate};
pub use services::Services;
pub use session::{Session, SessionKey, SessionService, SessionUpdate, SessionUpdateKind};
