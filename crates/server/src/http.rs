//! HTTP protocol.
//!
//! The REST surface is `/{...}/{version}/{verb}[?query]` with the version
//! and verb resolved at runtime against the dispatcher, so the router is a
//! single catch-all handler rather than a static route table. WebSocket
//! upgrades arriving on a shared port are handed to [`crate::ws`].

use crate::error::ApiError;
use crate::message::{Connection, Message, TransportKind};
use crate::state::AppState;
use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::response::Response;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Router state: the worker state plus which protocols this listener serves.
#[derive(Clone)]
pub struct GatewayState {
    pub app: Arc<AppState>,
    pub serves_http: bool,
    pub serves_ws: bool,
}

/// Build the router for one listening server.
pub fn router(app: Arc<AppState>, serves_http: bool, serves_ws: bool) -> Router {
    let state = GatewayState {
        app,
        serves_http,
        serves_ws,
    };
    Router::new()
        .fallback(gateway)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Entry point for every request on the listener.
async fn gateway(
    State(state): State<GatewayState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .ok();
    let req = Request::from_parts(parts, body);
    if let Some(upgrade) = ws {
        if state.serves_ws {
            return crate::ws::upgrade(state.app.clone(), upgrade, remote, req.uri());
        }
        return with_cors(plain(StatusCode::BAD_REQUEST, "WebSocket is not served here."));
    }
    if !state.serves_http {
        return with_cors(plain(StatusCode::BAD_REQUEST, "HTTP is not served here."));
    }

    let response = handle_http(&state.app, remote, req).await;
    with_cors(response)
}

async fn handle_http(app: &Arc<AppState>, remote: SocketAddr, req: Request) -> Response {
    if req.method() == Method::OPTIONS {
        return plain(StatusCode::OK, "");
    }

    let max_payload = app.config.maxpayloadsize;
    let uri = req.uri().clone();
    let url_len = uri
        .path_and_query()
        .map(|pq| pq.as_str().len())
        .unwrap_or_else(|| uri.path().len());
    if max_payload != 0 && url_len as u64 > max_payload {
        let response = plain(StatusCode::URI_TOO_LONG, "Url too long.");
        record(app, TransportKind::Rest, response.status(), None);
        return response;
    }

    let Ok(path) = percent_decode_str(uri.path()).decode_utf8() else {
        let response = plain(StatusCode::BAD_REQUEST, "Invalid url.");
        record(app, TransportKind::Rest, response.status(), None);
        return response;
    };

    let Some((version, verb)) = split_version_and_verb(app, &path) else {
        let response = plain(StatusCode::BAD_REQUEST, "Invalid url.");
        record(app, TransportKind::Rest, response.status(), None);
        return response;
    };

    let method = req.method().clone();
    let data = match method {
        Method::GET => parse_query(uri.query().unwrap_or("")),
        Method::POST => {
            let limit = if max_payload == 0 {
                usize::MAX
            } else {
                max_payload as usize
            };
            match axum::body::to_bytes(req.into_body(), limit).await {
                Ok(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(body) => parse_body(body),
                    Err(_) => {
                        let response = plain(StatusCode::BAD_REQUEST, "Invalid body encoding.");
                        record(app, TransportKind::Rest, response.status(), None);
                        return response;
                    }
                },
                // Exceeding the limit mid-stream; remaining bytes are dropped
                // with the connection.
                Err(_) => {
                    let response = plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large.");
                    record(app, TransportKind::Rest, response.status(), None);
                    return response;
                }
            }
        }
        _ => {
            let response = plain(StatusCode::METHOD_NOT_ALLOWED, "Unsupported method.");
            record(app, TransportKind::Rest, response.status(), None);
            return response;
        }
    };

    let connection = Arc::new(Connection::rest(app.next_connection_id(), remote));
    let message = Message::new(
        connection.clone(),
        TransportKind::Rest,
        version,
        verb,
        data,
        None,
    );

    let result = app.dispatcher().receive(message.clone()).await;
    // Request-scoped transport: anything the handler subscribed on behalf
    // of this connection dies with the request.
    app.hubs.unsubscribe_connection(connection.id);

    let response = build_response(&message, result);
    record(
        app,
        TransportKind::Rest,
        response.status(),
        message.latency_active().then(|| message.received_at.elapsed()),
    );
    response
}

/// Locate the API version segment and join what follows into the verb.
fn split_version_and_verb(app: &AppState, path: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    let dispatcher = app.dispatcher();
    let position = segments
        .iter()
        .position(|segment| dispatcher.resolve_version(segment).is_some())?;
    if position + 1 >= segments.len() {
        return None;
    }
    let version = dispatcher.resolve_version(segments[position])?;
    let verb = segments[position + 1..].join("/").to_lowercase();
    Some((version, verb))
}

/// Query strings try JSON first (percent-decoded as a whole), then form
/// pairs, then a bare string.
pub fn parse_query(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(decoded) = percent_decode_str(raw).decode_utf8() {
        if let Ok(value) = serde_json::from_str::<Value>(&decoded) {
            return value;
        }
        if raw.contains('=') {
            return parse_form(raw);
        }
        return Value::String(decoded.into_owned());
    }
    Value::String(raw.to_string())
}

/// Bodies try JSON first, then form pairs, then a bare string.
pub fn parse_body(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    if raw.contains('=') {
        return parse_form(raw);
    }
    Value::String(raw.to_string())
}

fn parse_form(raw: &str) -> Value {
    let mut object = Map::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        object.insert(
            form_decode(key),
            Value::String(form_decode(value)),
        );
    }
    Value::Object(object)
}

fn form_decode(component: &str) -> String {
    let with_spaces = component.replace('+', " ");
    percent_decode_str(&with_spaces)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or(with_spaces)
}

/// Shape the handler outcome into an HTTP response.
fn build_response(message: &Message, result: Result<Value, ApiError>) -> Response {
    match result {
        Ok(value) => {
            let status = message.status_override().unwrap_or(StatusCode::OK);
            let overrides = message.header_overrides();
            let handler_content_type = overrides
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));

            // A handler-set Content-Type means the body is already a string;
            // null results (acknowledgements) produce an empty body.
            let body = if handler_content_type {
                match value {
                    Value::String(raw) => raw,
                    Value::Null => String::new(),
                    other => other.to_string(),
                }
            } else if value.is_null() {
                String::new()
            } else {
                value.to_string()
            };

            let mut builder = Response::builder().status(status);
            if !handler_content_type {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
            }
            for (name, value) in overrides {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, ""))
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
            plain(error.status_code(), &error.client_message())
        }
    }
}

fn record(
    app: &AppState,
    transport: TransportKind,
    status: StatusCode,
    latency: Option<std::time::Duration>,
) {
    app.metrics.record_response(transport, status);
    if let Some(elapsed) = latency {
        app.metrics.record_latency(elapsed);
    }
}

fn plain(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=UTF-8")
        .body(Body::from(body.to_string()))
        .expect("static response")
}

/// CORS headers go on every response of the protocol.
fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("origin, content-type, accept"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

/// Helper for modules that need the decoded, lower-cased path (the
/// WebSocket upgrade check).
pub fn decoded_path_lowercase(uri: &Uri) -> Option<String> {
    percent_decode_str(uri.path())
        .decode_utf8()
        .ok()
        .map(|path| path.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_parses_json_first() {
        let value = parse_query("%7B%22a%22%3A1%7D");
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn query_falls_back_to_form_pairs() {
        let value = parse_query("txId=ff00&push=true");
        assert_eq!(value, json!({"txId": "ff00", "push": "true"}));
    }

    #[test]
    fn query_falls_back_to_bare_string() {
        assert_eq!(parse_query("transfer"), json!("transfer"));
        assert_eq!(parse_query(""), Value::Null);
    }

    #[test]
    fn form_decoding_handles_plus_and_percent() {
        let value = parse_query("name=hello+world&note=a%26b");
        assert_eq!(value, json!({"name": "hello world", "note": "a&b"}));
    }

    #[test]
    fn body_parses_json_form_string() {
        assert_eq!(parse_body(r#"{"wait":true}"#), json!({"wait": true}));
        assert_eq!(parse_body("a=1"), json!({"a": "1"}));
        assert_eq!(parse_body("plain"), json!("plain"));
        assert_eq!(parse_body(""), Value::Null);
    }
}
