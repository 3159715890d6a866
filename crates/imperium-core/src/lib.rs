//! Imperium Core Library
//!
//! Shared functionality for Imperium nodes:
//! - Relational store over pooled `SQLite` connections
//! - Configuration resolution
//! - String requirements and the trie matcher
//! - Tracing initialization and common error types

pub mod config;
pub mod db;
pub mod error;
pub mod string;
pub mod tracing_init;

pub use config::ImperiumConfig;
pub use db::{Handle, Store, StoreError};
pub use error::{Error, Result};
