//! Verb registry shared by both protocols.
//!
//! Each API version owns a map of lower-cased verbs to handlers. Modules
//! add their verbs through [`Dispatcher::register`]; the built-in bundle
//! lives in [`crate::handlers::basics`]. HTTP and WebSocket both dispatch
//! through [`Dispatcher::receive`], so a verb behaves identically on
//! either transport.

use crate::error::{ApiError, ApiResult};
use crate::message::Message;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use validana_core::{EventHub, HubRegistry};

/// Event type observed before every dispatch.
pub const MESSAGE_EVENT: &str = "message";

/// A registered verb handler.
pub type Handler = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, ApiResult<Value>> + Send + Sync>;

struct Registration {
    handler: Handler,
    log: bool,
}

/// Per-API-version verb registry.
pub struct Dispatcher {
    versions: HashMap<String, HashMap<String, Registration>>,
    message_hub: Arc<EventHub>,
}

impl Dispatcher {
    pub fn new(hubs: &HubRegistry) -> Self {
        Self {
            versions: HashMap::new(),
            message_hub: hubs.hub(MESSAGE_EVENT),
        }
    }

    /// Register `verb` under `version`. Both are stored lower-cased. When
    /// `log` is set, every invocation is logged.
    pub fn register<F, Fut>(&mut self, version: &str, verb: &str, log: bool, handler: F)
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message| Box::pin(handler(message)));
        self.versions
            .entry(version.to_lowercase())
            .or_default()
            .insert(verb.to_lowercase(), Registration { handler, log });
    }

    /// Resolve a path segment to a registered version key, case-insensitive.
    pub fn resolve_version(&self, segment: &str) -> Option<String> {
        let lowered = segment.to_lowercase();
        self.versions.contains_key(&lowered).then_some(lowered)
    }

    /// The registered versions (lower-cased).
    pub fn versions(&self) -> Vec<String> {
        self.versions.keys().cloned().collect()
    }

    /// Dispatch a message to its verb handler.
    pub async fn receive(&self, message: Arc<Message>) -> ApiResult<Value> {
        // Introspection hooks observe every invocation before dispatch.
        self.message_hub.emit(
            &json!({
                "version": message.api_version,
                "type": message.verb,
                "remote": message.connection.remote.to_string(),
            }),
            None,
        );

        let verbs = self
            .versions
            .get(&message.api_version)
            .ok_or_else(|| ApiError::bad_request(format!("Unknown api version: {}", message.api_version)))?;

        let registration = verbs.get(&message.verb).ok_or_else(|| {
            let mut known: Vec<&str> = verbs.keys().map(String::as_str).collect();
            known.sort_unstable();
            ApiError::bad_request(format!(
                "Invalid type: {}, supported types: {}",
                message.verb,
                known.join(", ")
            ))
        })?;

        if registration.log {
            tracing::info!(
                version = %message.api_version,
                verb = %message.verb,
                remote = %message.connection.remote,
                "Dispatching request"
            );
        }

        (registration.handler)(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Connection, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(version: &str, verb: &str, data: Value) -> Arc<Message> {
        let conn = Arc::new(Connection::rest(1, "127.0.0.1:1000".parse().unwrap()));
        Message::new(conn, TransportKind::Rest, version, verb, data, None)
    }

    fn dispatcher() -> (Dispatcher, Arc<HubRegistry>) {
        let hubs = Arc::new(HubRegistry::new());
        (Dispatcher::new(&hubs), hubs)
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let (mut dispatcher, _hubs) = dispatcher();
        dispatcher.register("v1", "echo", false, |message: Arc<Message>| async move {
            Ok(message.data.clone())
        });

        let result = dispatcher
            .receive(message("v1", "echo", json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(result, json!({"a": 1}));
    }

    #[tokio::test]
    async fn unknown_verb_lists_supported_types() {
        let (mut dispatcher, _hubs) = dispatcher();
        dispatcher.register("v1", "time", false, |_| async { Ok(Value::Null) });
        dispatcher.register("v1", "process", false, |_| async { Ok(Value::Null) });

        let err = dispatcher
            .receive(message("v1", "nosuch", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(
            err.client_message(),
            "Invalid type: nosuch, supported types: process, time"
        );
    }

    #[tokio::test]
    async fn version_resolution_is_case_insensitive() {
        let (mut dispatcher, _hubs) = dispatcher();
        dispatcher.register("V1", "time", false, |_| async { Ok(Value::Null) });

        assert_eq!(dispatcher.resolve_version("v1"), Some("v1".to_string()));
        assert_eq!(dispatcher.resolve_version("V1"), Some("v1".to_string()));
        assert_eq!(dispatcher.resolve_version("v2"), None);
    }

    #[tokio::test]
    async fn message_event_fires_before_dispatch() {
        let (mut dispatcher, hubs) = dispatcher();
        dispatcher.register("v1", "time", false, |_| async { Ok(Value::Null) });

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        hubs.hub(MESSAGE_EVENT).subscribe(
            None,
            None,
            Arc::new(move |data| {
                assert_eq!(data["type"], "time");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher
            .receive(message("v1", "time", Value::Null))
            .await
            .unwrap();
        // Unknown verbs are observed too.
        let _ = dispatcher.receive(message("v1", "nosuch", Value::Null)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
