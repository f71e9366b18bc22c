//! Core building blocks for the Validana client gateway.
//!
//! This crate defines the pieces shared by the store and server crates:
//! - Process configuration loaded from file and environment
//! - The typed publish/subscribe event hub
//! - TTL caches with single-flight refresh
//! - The binary transaction wire format

pub mod cache;
pub mod config;
pub mod error;
pub mod hub;
pub mod tx;

pub use cache::Cache;
pub use config::{AppConfig, LogFormat};
pub use error::{CoreError, CoreResult};
pub use hub::{ConnectionId, EventHub, HubRegistry};
pub use tx::Transaction;

/// Environment prefix for configuration keys.
pub const ENV_PREFIX: &str = "VSERVER_";

/// Channel the processor notifies on after writing a block.
pub const NOTIFICATION_CHANNEL: &str = "blocks";
