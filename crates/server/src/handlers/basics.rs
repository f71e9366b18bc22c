//! The built-in verb bundle.
//!
//! Modules are composed onto a dispatcher: [`register`] adds the basics
//! verbs under an API version and wires up the caches they serve from.
//! Additional bundles follow the same shape, taking the dispatcher and
//! registering their own verbs.

use crate::dispatch::Dispatcher;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// The API version the gateway serves by default.
pub const API_VERSION: &str = "v1";

/// Cached contract descriptors live this long.
const CONTRACTS_TTL: Duration = Duration::from_secs(60);
/// The latest-block timestamp is cached briefly.
const TIME_TTL: Duration = Duration::from_secs(5);

/// Register the basics verbs under `version`.
pub fn register(dispatcher: &mut Dispatcher, version: &str, app: Arc<AppState>) {
    // Contract descriptors, keyed by type ("" = every contract).
    let store = app.store.clone();
    app.caches.contracts.add_all(
        CONTRACTS_TTL,
        Arc::new(move |keys: Vec<String>| {
            let store = store.clone();
            Box::pin(async move {
                let mut values = Vec::with_capacity(keys.len());
                for key in keys {
                    let rows = if key.is_empty() {
                        store.list_contracts().await?
                    } else {
                        store.get_contracts_by_type(&key).await?
                    };
                    values.push(Value::Array(
                        rows.iter().map(|row| row.api_json()).collect(),
                    ));
                }
                Ok(values)
            })
        }),
    );

    // Latest block timestamp. Refreshing an empty chain is not an error;
    // the handler turns the null into a client-facing message.
    let store = app.store.clone();
    app.caches.time.add(
        "time",
        TIME_TTL,
        Arc::new(move |_key| {
            let store = store.clone();
            Box::pin(async move {
                let block = store.latest_block().await?;
                Ok(block.map_or(Value::Null, |b| Value::from(b.processed_ts)))
            })
        }),
    );

    let state = app.clone();
    dispatcher.register(version, "process", true, move |message| {
        super::process::process(state.clone(), message)
    });
    let state = app.clone();
    dispatcher.register(version, "transaction", false, move |message| {
        super::transactions::transaction(state.clone(), message)
    });
    let state = app.clone();
    dispatcher.register(version, "txStatus", false, move |message| {
        super::transactions::tx_status(state.clone(), message)
    });
    let state = app.clone();
    dispatcher.register(version, "contracts", false, move |message| {
        super::contracts::contracts(state.clone(), message)
    });
    let state = app.clone();
    dispatcher.register(version, "time", false, move |message| {
        super::time::time(state.clone(), message)
    });
    let state = app.clone();
    dispatcher.register(version, "metrics", false, move |message| {
        super::metrics::metrics(state.clone(), message)
    });
}

/// The request body as an object, or an empty map for null bodies.
pub(super) fn body_object(data: &Value) -> ApiResult<Map<String, Value>> {
    match data {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        _ => Err(ApiError::bad_request("Invalid format.")),
    }
}

/// A required string field.
pub(super) fn require_str(map: &Map<String, Value>, field: &str) -> ApiResult<String> {
    map.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request(format!("Missing or invalid {field}.")))
}

/// An optional boolean field. Form-encoded requests carry booleans as
/// strings, so "true"/"false" are accepted too.
pub(super) fn optional_bool(map: &Map<String, Value>, field: &str) -> ApiResult<bool> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(value)) => Ok(*value),
        Some(Value::String(s)) if s == "true" => Ok(true),
        Some(Value::String(s)) if s == "false" => Ok(false),
        Some(_) => Err(ApiError::bad_request(format!("Missing or invalid {field}."))),
    }
}

/// An optional integer field.
pub(super) fn optional_i64(map: &Map<String, Value>, field: &str) -> ApiResult<Option<i64>> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| ApiError::bad_request(format!("Missing or invalid {field}."))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_object_accepts_null_and_objects() {
        assert!(body_object(&Value::Null).unwrap().is_empty());
        assert_eq!(
            body_object(&json!({"a": 1})).unwrap().get("a"),
            Some(&json!(1))
        );
        assert!(body_object(&json!([1])).is_err());
    }

    #[test]
    fn optional_bool_accepts_form_strings() {
        let map = body_object(&json!({"wait": "true", "push": false, "bad": 3})).unwrap();
        assert!(optional_bool(&map, "wait").unwrap());
        assert!(!optional_bool(&map, "push").unwrap());
        assert!(!optional_bool(&map, "absent").unwrap());
        assert!(optional_bool(&map, "bad").is_err());
    }

    #[test]
    fn require_str_reports_the_field() {
        let map = body_object(&json!({"format": 7})).unwrap();
        let err = require_str(&map, "format").unwrap_err();
        assert_eq!(err.client_message(), "Missing or invalid format.");
    }
}
