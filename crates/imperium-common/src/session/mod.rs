//! Game-client login sessions keyed by client fingerprint.

mod service;


use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::bus::{Message, MessageBus};
use crate::error::{Error, Result};

pub use service::SessionService;

/// Client fingerprint: game uuid, secondary id and source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub uuid: i64,
    pub usid: i64,
    pub address: IpAddr,
}

impl SessionKey {
    pub const fn new(uuid: i64, usid: i64, address: IpAddr) -> Self {
        Self {
            uuid,
            usid,
            address,
        }
    }
}

/// A stored session. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub key: SessionKey,
    pub account: i64,
    /// Name of the node that created the session.
    pub server: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_login: i64,
}

impl Session {
    /// Live iff used within the sliding `window_secs`. `expires_at` is
    /// informational and does not gate liveness.
    pub const fn is_live(&self, now: i64, window_secs: i64) -> bool {
        now < self.last_login.saturating_add(window_secs)
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SessionRow {
    account_id: i64,
    uuid: i64,
    usid: i64,
    address: Vec<u8>,
    server: String,
    created_at: i64,
    expires_at: i64,
    last_login: i64,
}

impl TryFrom<SessionRow> for Session {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            key: SessionKey::new(row.uuid, row.usid, address_from_column(&row.address)?),
            account: row.account_id,
            server: row.server,
            created_at: row.created_at,
            expires_at: row.expires_at,
            last_login: row.last_login,
        })
    }
}

/// Raw octets: 4 bytes for IPv4, 16 for IPv6.
pub(crate) fn address_to_column(address: IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub(crate) fn address_from_column(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::from(octets));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::from(octets));
    }
    Err(Error::Corrupted(format!(
        "session address has {} bytes",
        bytes.len()
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionUpdateKind {
    Create,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub key: SessionKey,
    pub kind: SessionUpdateKind,
}

impl Message for SessionUpdate {
    const TOPIC: &'static str = "imperium.account.SessionUpdate";
}

pub fn register_messages(bus: &MessageBus) {
    bus.register::<SessionUpdate>();
}
