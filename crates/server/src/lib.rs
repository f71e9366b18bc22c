//! Validana client gateway.
//!
//! This crate provides the request-dispatch and event-fanout engine:
//! - HTTP and WebSocket protocols over a shared verb registry
//! - The notification fanout joining `LISTEN blocks` to subscriptions
//! - TTL-cached read verbs and the metrics aggregator
//! - The master/worker supervisor and graceful-restart machinery

pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod http;
pub mod listener;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod notifications;
pub mod state;
pub mod supervisor;
pub mod testing;
pub mod worker;
pub mod ws;

pub use dispatch::Dispatcher;
pub use error::{ApiError, ApiResult};
pub use message::{Connection, Message, TransportKind};
pub use state::{AppState, Shutdown};
