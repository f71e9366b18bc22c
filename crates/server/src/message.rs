//! In-flight request and connection types.
//!
//! A [`Connection`] is the live transport: request-scoped for HTTP,
//! session-scoped for WebSocket. A [`Message`] is one dispatched request
//! travelling through the verb registry; handlers read its parsed data and
//! may override the response status, add headers, or clear the latency
//! clock for long-poll semantics.

use axum::http::StatusCode;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use validana_core::ConnectionId;

/// Which protocol produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Rest,
    Ws,
}

/// Outbound WebSocket traffic, queued per connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// A live client transport.
pub struct Connection {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub opened_at: Instant,
    /// Session mapping shared by every message of the connection.
    session: Mutex<HashMap<String, Value>>,
    /// Writer handle; `None` for HTTP, which cannot push.
    push: Option<mpsc::UnboundedSender<OutboundFrame>>,
}

impl Connection {
    /// A request-scoped HTTP connection.
    pub fn rest(id: ConnectionId, remote: SocketAddr) -> Self {
        Self {
            id,
            remote,
            opened_at: Instant::now(),
            session: Mutex::new(HashMap::new()),
            push: None,
        }
    }

    /// A session-scoped WebSocket connection with its writer channel.
    pub fn ws(id: ConnectionId, remote: SocketAddr, out: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            id,
            remote,
            opened_at: Instant::now(),
            session: Mutex::new(HashMap::new()),
            push: Some(out),
        }
    }

    /// Whether this transport supports server pushes.
    pub fn can_push(&self) -> bool {
        self.push.is_some()
    }

    /// Push `{pushType, data, status}` to the client. A no-op on HTTP.
    pub fn push(&self, push_type: &str, data: Value, status: u16) {
        match &self.push {
            Some(out) => {
                let frame = json!({
                    "pushType": push_type,
                    "data": data,
                    "status": status,
                });
                // A closed channel means the socket is already gone.
                let _ = out.send(OutboundFrame::Text(frame.to_string()));
            }
            None => {
                tracing::error!(
                    remote = %self.remote,
                    push_type,
                    "Push attempted on a transport that cannot push"
                );
            }
        }
    }

    /// Queue a raw outbound frame (WebSocket responses and closes).
    pub fn send(&self, frame: OutboundFrame) {
        if let Some(out) = &self.push {
            let _ = out.send(frame);
        }
    }

    /// Read a session value.
    pub fn session_get(&self, key: &str) -> Option<Value> {
        self.session
            .lock()
            .expect("session lock poisoned")
            .get(key)
            .cloned()
    }

    /// Write a session value.
    pub fn session_set(&self, key: impl Into<String>, value: Value) {
        self.session
            .lock()
            .expect("session lock poisoned")
            .insert(key.into(), value);
    }
}

#[derive(Debug, Default)]
struct ResponseState {
    status: Option<StatusCode>,
    headers: Vec<(String, String)>,
    latency_cleared: bool,
}

/// One dispatched request.
pub struct Message {
    pub connection: Arc<Connection>,
    pub transport: TransportKind,
    pub api_version: String,
    pub verb: String,
    pub data: Value,
    pub received_at: Instant,
    /// Correlation id of the originating WebSocket frame.
    pub ws_id: Option<String>,
    response: Mutex<ResponseState>,
}

impl Message {
    pub fn new(
        connection: Arc<Connection>,
        transport: TransportKind,
        api_version: impl Into<String>,
        verb: impl Into<String>,
        data: Value,
        ws_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            transport,
            api_version: api_version.into(),
            verb: verb.into(),
            data,
            received_at: Instant::now(),
            ws_id,
            response: Mutex::new(ResponseState::default()),
        })
    }

    /// Override the response status (e.g. 202 for acknowledged submissions).
    pub fn set_status(&self, status: StatusCode) {
        self.response.lock().expect("response lock poisoned").status = Some(status);
    }

    /// Add a response header. A handler-set `Content-Type` means the body
    /// is already a string and must not be JSON-serialised again.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.response
            .lock()
            .expect("response lock poisoned")
            .headers
            .push((name.into(), value.into()));
    }

    /// Stop the latency clock for this request. Long-polling handlers call
    /// this so waits do not pollute the latency histogram.
    pub fn clear_latency(&self) {
        self.response
            .lock()
            .expect("response lock poisoned")
            .latency_cleared = true;
    }

    /// The status override, if any.
    pub fn status_override(&self) -> Option<StatusCode> {
        self.response.lock().expect("response lock poisoned").status
    }

    /// The accumulated header overrides.
    pub fn header_overrides(&self) -> Vec<(String, String)> {
        self.response
            .lock()
            .expect("response lock poisoned")
            .headers
            .clone()
    }

    /// Whether the latency clock should still be recorded.
    pub fn latency_active(&self) -> bool {
        !self
            .response
            .lock()
            .expect("response lock poisoned")
            .latency_cleared
    }

    /// The request body, truncated for error logs.
    pub fn data_for_log(&self) -> String {
        let mut body = self.data.to_string();
        const MAX: usize = 1000;
        if body.len() > MAX {
            let mut end = MAX;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
            body.push('…');
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn rest_connections_cannot_push() {
        let conn = Connection::rest(1, addr());
        assert!(!conn.can_push());
        // Must not panic, only log.
        conn.push("transaction", json!({}), 200);
    }

    #[test]
    fn ws_push_produces_a_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::ws(2, addr(), tx);
        assert!(conn.can_push());

        conn.push("transaction", json!({"id": "ff"}), 200);
        let OutboundFrame::Text(frame) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["pushType"], "transaction");
        assert_eq!(value["data"]["id"], "ff");
        assert_eq!(value["status"], 200);
        assert!(value.get("id").is_none());
    }

    #[test]
    fn session_is_shared_across_messages() {
        let conn = Arc::new(Connection::rest(3, addr()));
        let first = Message::new(
            conn.clone(),
            TransportKind::Rest,
            "v1",
            "process",
            Value::Null,
            None,
        );
        first.connection.session_set("user", json!("alice"));

        let second = Message::new(conn, TransportKind::Rest, "v1", "time", Value::Null, None);
        assert_eq!(second.connection.session_get("user"), Some(json!("alice")));
    }

    #[test]
    fn response_overrides_accumulate() {
        let conn = Arc::new(Connection::rest(4, addr()));
        let message = Message::new(conn, TransportKind::Rest, "v1", "process", Value::Null, None);

        assert!(message.latency_active());
        message.set_status(StatusCode::ACCEPTED);
        message.set_header("Content-Type", "text/plain; charset=UTF-8");
        message.clear_latency();

        assert_eq!(message.status_override(), Some(StatusCode::ACCEPTED));
        assert_eq!(message.header_overrides().len(), 1);
        assert!(!message.latency_active());
    }

    #[test]
    fn log_data_is_truncated() {
        let conn = Arc::new(Connection::rest(5, addr()));
        let message = Message::new(
            conn,
            TransportKind::Rest,
            "v1",
            "process",
            json!("x".repeat(5000)),
            None,
        );
        assert!(message.data_for_log().len() < 1100);
    }
}
