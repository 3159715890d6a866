//! Configuration resolution for Imperium nodes.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Config file (explicit path, else `~/.config/imperium/config.json`)
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary)

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[allow(clippy::expect_used)]
static SERVER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9](-?[a-z0-9])+$").expect("static regex is valid"));

/// Longest accepted server name; it doubles as the bus sender name.
pub const MAX_SERVER_NAME_LENGTH: usize = 32;

/// Complete Imperium configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ImperiumConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub messenger: MessengerConfig,
    pub security: SecurityConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    /// Seeds a well-known test account on startup.
    pub testing: bool,
}

/// Identity of this node on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    /// Use a private in-memory database instead of `path`.
    pub memory: bool,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

impl DatabaseConfig {
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            memory: false,
            max_connections: 8,
            busy_timeout_secs: 5,
        }
    }
}

/// Message bus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    pub poll_interval_ms: u64,
    /// Senders whose heartbeat is older than this stop receiving broadcasts.
    pub heartbeat_timeout_secs: u64,
    /// Bound on waiting for in-flight handlers at shutdown.
    pub drain_timeout_secs: u64,
    pub max_payload_bytes: usize,
    /// Sender rows older than this are pruned, with their queued envelopes.
    pub sender_retention_secs: u64,
}

impl MessengerConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub const fn sender_retention(&self) -> Duration {
        Duration::from_secs(self.sender_retention_secs)
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            heartbeat_timeout_secs: 30,
            drain_timeout_secs: 5,
            max_payload_bytes: 16 * 1024,
            sender_retention_secs: 60 * 60,
        }
    }
}

/// Argon2id parameters for credential hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub output_length: usize,
    pub salt_length: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
            output_length: 64,
            salt_length: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sliding window: a session unused for this long is dead. Default: 7 days.
    pub window_secs: u64,
}

impl SessionConfig {
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "imperium=info".to_string(),
            json: false,
        }
    }
}

impl ImperiumConfig {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        validate_server_name(&self.server.name)?;
        if self.messenger.poll_interval_ms == 0 {
            return Err(Error::Config("messenger.poll_interval_ms must be positive".into()));
        }
        if self.database.path.is_none() && !self.database.memory {
            return Err(Error::Config(
                "database.path is required unless database.memory is set".into(),
            ));
        }
        Ok(())
    }
}

/// Validate a node name: lowercase alphanumerics with single dashes.
pub fn validate_server_name(name: &str) -> Result<()> {
    let matches = SERVER_NAME.is_match(name);
    if !matches || name.len() > MAX_SERVER_NAME_LENGTH {
        return Err(Error::Config(format!(
            "Server name {name:?} must match ^[a-z0-9](-?[a-z0-9])+$ and be at most {MAX_SERVER_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<ImperiumConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => global_config_path().filter(|p| p.exists()),
    };

    let mut config = match path {
        Some(path) => load_config_file(&path)?,
        None => ImperiumConfig::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("imperium").join("config.json"))
}

/// Get the default database path.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("imperium").join("imperium.db"))
}

fn load_config_file(path: &Path) -> Result<ImperiumConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut ImperiumConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("IMPERIUM_SERVER_NAME") {
        config.server.name = val;
    }
    if let Some(val) = var("IMPERIUM_DATABASE_PATH") {
        config.database.path = Some(PathBuf::from(val));
    }
    if let Some(n) = var("IMPERIUM_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.messenger.poll_interval_ms = n;
    }
    if let Some(val) = var("IMPERIUM_LOG_FILTER") {
        config.logging.filter = val;
    }
    if let Some(b) = var("IMPERIUM_LOG_JSON").and_then(|v| v.parse().ok()) {
        config.logging.json = b;
    }
    if let Some(b) = var("IMPERIUM_TESTING").and_then(|v| v.parse().ok()) {
        config.testing = b;
    }
}
