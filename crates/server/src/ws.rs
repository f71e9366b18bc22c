//! WebSocket protocol.
//!
//! Upgrades are accepted on any path containing a registered API version;
//! anything else is closed with code 4100. Each connection runs one task
//! that owns the socket reader, a writer task draining the connection's
//! outbound queue, and a one-second timer driving keep-alive. Inbound
//! frames are `{id, type, data?}` requests dispatched through the shared
//! registry; dispatch is pipelined, so responses are ordered by completion
//! and correlated by `id`. Pushes ride the same outbound queue.

use crate::message::{Connection, Message, OutboundFrame, TransportKind};
use crate::state::{AppState, Shutdown};
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::http::Uri;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Close code for server shutdown and keep-alive violations.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for an invalid upgrade path.
pub const CLOSE_INVALID_URL: u16 = 4100;

/// Accept or reject an upgrade request.
pub fn upgrade(
    app: Arc<AppState>,
    upgrade: WebSocketUpgrade,
    remote: SocketAddr,
    uri: &Uri,
) -> Response {
    let version = crate::http::decoded_path_lowercase(uri).and_then(|path| {
        path.split('/')
            .filter(|s| !s.is_empty())
            .find_map(|segment| app.dispatcher().resolve_version(segment))
    });

    match version {
        Some(version) => {
            upgrade.on_upgrade(move |socket| connection_task(app, socket, remote, version))
        }
        // The upgrade must complete before a close code can be delivered.
        None => upgrade.on_upgrade(move |mut socket| async move {
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CLOSE_INVALID_URL,
                    reason: "Invalid url.".into(),
                })))
                .await;
        }),
    }
}

async fn connection_task(app: Arc<AppState>, socket: WebSocket, remote: SocketAddr, version: String) {
    let conn_id = app.next_connection_id();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let connection = Arc::new(Connection::ws(conn_id, remote, out_tx));
    app.metrics.record_ws_open();
    tracing::debug!(conn_id, %remote, "WebSocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drains the outbound queue until a close frame or the socket
    // fails. Responses, pushes and keep-alive pings all pass through here.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                OutboundFrame::Text(text) => ws_tx.send(WsMessage::Text(text.into())).await,
                OutboundFrame::Ping => ws_tx.send(WsMessage::Ping(Vec::new().into())).await,
                OutboundFrame::Close { code, reason } => {
                    let _ = ws_tx
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let mut shutdown = app.shutdown_watch();
    let keepalive = app.config.keepalive();
    // Ping slots are spread over the period by connection id, so a large
    // population is touched a few connections per second instead of all at
    // once.
    let slot = Duration::from_secs(conn_id % keepalive.as_secs().max(1));
    let mut next_ping = Instant::now() + slot + keepalive;
    let mut awaiting_pong = false;
    let inflight = Arc::new(AtomicUsize::new(0));
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut draining = false;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                match *shutdown.borrow() {
                    Shutdown::Hard => {
                        connection.send(OutboundFrame::Close {
                            code: CLOSE_GOING_AWAY,
                            reason: "Server shutting down.".to_string(),
                        });
                        break;
                    }
                    Shutdown::Graceful => {
                        // Let in-flight dispatches finish; the drain check
                        // below closes the socket once they have.
                        draining = true;
                    }
                    Shutdown::Running => {}
                }
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !draining {
                            handle_frame(&app, &connection, &version, text.as_str(), &inflight);
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    // The library answers pings itself.
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Binary(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        let text = e.to_string();
                        if text.contains("reset") {
                            tracing::debug!(conn_id, "WebSocket reset by peer");
                        } else {
                            tracing::warn!(conn_id, error = %text, "WebSocket transport error");
                            connection.send(OutboundFrame::Close {
                                code: 1006,
                                reason: String::new(),
                            });
                        }
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                if draining && inflight.load(Ordering::Acquire) == 0 {
                    connection.send(OutboundFrame::Close {
                        code: CLOSE_GOING_AWAY,
                        reason: "Server shutting down.".to_string(),
                    });
                    break;
                }

                if Instant::now() >= next_ping {
                    if awaiting_pong {
                        // No pong since the previous touch.
                        tracing::debug!(conn_id, "Keep-alive expired");
                        connection.send(OutboundFrame::Close {
                            code: CLOSE_GOING_AWAY,
                            reason: "Keep-alive timeout.".to_string(),
                        });
                        break;
                    }
                    connection.send(OutboundFrame::Ping);
                    awaiting_pong = true;
                    next_ping += keepalive;
                }
            }
        }
    }

    app.hubs.unsubscribe_connection(conn_id);
    app.metrics.record_ws_close(connection.opened_at.elapsed());
    tracing::debug!(conn_id, "WebSocket closed");

    // Give the writer a moment to flush the close frame, then stop it.
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
}

/// Parse one inbound frame and dispatch it. Invalid frames produce an
/// error response on the same socket instead of closing it.
fn handle_frame(
    app: &Arc<AppState>,
    connection: &Arc<Connection>,
    version: &str,
    text: &str,
    inflight: &Arc<AtomicUsize>,
) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            connection.send(error_frame(Value::Null, 400, "Invalid request."));
            return;
        }
    };

    let id = parsed.get("id").cloned().unwrap_or(Value::Null);
    let Some(id_str) = id.as_str().map(str::to_string) else {
        connection.send(error_frame(id, 400, "Request is missing an id."));
        return;
    };
    let Some(verb) = parsed.get("type").and_then(Value::as_str) else {
        connection.send(error_frame(id, 400, "Request is missing a type."));
        return;
    };
    let data = parsed.get("data").cloned().unwrap_or(Value::Null);

    let message = Message::new(
        connection.clone(),
        TransportKind::Ws,
        version,
        verb.to_lowercase(),
        data,
        Some(id_str.clone()),
    );

    // Pipelined: each request runs in its own task, responses are ordered
    // by completion and correlated by id.
    inflight.fetch_add(1, Ordering::AcqRel);
    let app = app.clone();
    let connection = connection.clone();
    let inflight = inflight.clone();
    tokio::spawn(async move {
        let result = app.dispatcher().receive(message.clone()).await;

        let (status, frame) = match result {
            Ok(value) => {
                let status = message
                    .status_override()
                    .unwrap_or(axum::http::StatusCode::OK);
                (
                    status,
                    json!({"id": id_str, "status": status.as_u16(), "data": value}),
                )
            }
            Err(error) => {
                if error.is_internal() {
                    tracing::error!(
                        error = %error,
                        verb = %message.verb,
                        body = %message.data_for_log(),
                        "Request failed"
                    );
                }
                let status = error.status_code();
                (
                    status,
                    json!({
                        "id": id_str,
                        "status": status.as_u16(),
                        "error": error.client_message(),
                    }),
                )
            }
        };

        connection.send(OutboundFrame::Text(frame.to_string()));
        app.metrics.record_response(TransportKind::Ws, status);
        if message.latency_active() {
            app.metrics.record_latency(message.received_at.elapsed());
        }
        inflight.fetch_sub(1, Ordering::AcqRel);
    });
}

fn error_frame(id: Value, status: u16, error: &str) -> OutboundFrame {
    OutboundFrame::Text(json!({"id": id, "status": status, "error": error}).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::error::ApiError;
    use crate::testing::memory_store;
    use validana_core::AppConfig;

    fn app_with_echo() -> Arc<AppState> {
        let state = AppState::new(AppConfig::for_testing(), memory_store());
        let mut dispatcher = Dispatcher::new(&state.hubs);
        dispatcher.register("v1", "echo", false, |message: Arc<Message>| async move {
            Ok(message.data.clone())
        });
        dispatcher.register("v1", "boom", false, |_| async {
            Err::<Value, _>(ApiError::bad_request("No existing blocks found."))
        });
        state.set_dispatcher(Arc::new(dispatcher));
        state
    }

    fn ws_connection(app: &Arc<AppState>) -> (Arc<Connection>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::ws(
            app.next_connection_id(),
            "127.0.0.1:1234".parse().unwrap(),
            tx,
        ));
        (conn, rx)
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Value {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no frame before timeout")
            .expect("channel closed")
        {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_are_correlated_by_id() {
        let app = app_with_echo();
        let (conn, mut rx) = ws_connection(&app);
        let inflight = Arc::new(AtomicUsize::new(0));

        handle_frame(
            &app,
            &conn,
            "v1",
            r#"{"id":"a","type":"echo","data":{"n":1}}"#,
            &inflight,
        );
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["id"], "a");
        assert_eq!(frame["status"], 200);
        assert_eq!(frame["data"]["n"], 1);
    }

    #[tokio::test]
    async fn errors_use_the_error_field() {
        let app = app_with_echo();
        let (conn, mut rx) = ws_connection(&app);
        let inflight = Arc::new(AtomicUsize::new(0));

        handle_frame(&app, &conn, "v1", r#"{"id":"a","type":"boom"}"#, &inflight);
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["id"], "a");
        assert_eq!(frame["status"], 400);
        assert_eq!(frame["error"], "No existing blocks found.");
        assert!(frame.get("data").is_none());
    }

    #[tokio::test]
    async fn unknown_type_is_dispatched_as_invalid() {
        let app = app_with_echo();
        let (conn, mut rx) = ws_connection(&app);
        let inflight = Arc::new(AtomicUsize::new(0));

        handle_frame(&app, &conn, "v1", r#"{"id":"b","type":"nosuch"}"#, &inflight);
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["status"], 400);
        assert!(
            frame["error"]
                .as_str()
                .unwrap()
                .starts_with("Invalid type: nosuch, supported types:")
        );
    }

    #[tokio::test]
    async fn malformed_frames_get_a_direct_error() {
        let app = app_with_echo();
        let (conn, mut rx) = ws_connection(&app);
        let inflight = Arc::new(AtomicUsize::new(0));

        handle_frame(&app, &conn, "v1", "not json", &inflight);
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["status"], 400);
        assert_eq!(frame["error"], "Invalid request.");

        handle_frame(&app, &conn, "v1", r#"{"type":"echo"}"#, &inflight);
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["error"], "Request is missing an id.");

        handle_frame(&app, &conn, "v1", r#"{"id":"x"}"#, &inflight);
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["error"], "Request is missing a type.");

        handle_frame(&app, &conn, "v1", r#"{"id":7,"type":"echo"}"#, &inflight);
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["error"], "Request is missing an id.");
    }

    #[tokio::test]
    async fn verb_type_is_case_insensitive() {
        let app = app_with_echo();
        let (conn, mut rx) = ws_connection(&app);
        let inflight = Arc::new(AtomicUsize::new(0));

        handle_frame(
            &app,
            &conn,
            "v1",
            r#"{"id":"c","type":"ECHO","data":1}"#,
            &inflight,
        );
        let frame = next_text(&mut rx).await;
        assert_eq!(frame["status"], 200);
    }
}
