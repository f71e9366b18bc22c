//! The `transaction` and `txStatus` verbs.
//!
//! Both query submitted transactions by id; they differ only in response
//! shape. `wait = true` blocks until every requested id has been
//! processed. `push = true` (WebSocket only) answers with what is already
//! processed and pushes the rest as `pushType = "transaction"` frames when
//! their notifications arrive.

use super::basics::{body_object, optional_bool};
use crate::error::{ApiError, ApiResult};
use crate::message::Message;
use crate::notifications::TRANSACTION_ID_EVENT;
use crate::state::AppState;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use validana_core::tx::parse_tx_id;
use validana_store::models::TransactionRow;

/// Requests may carry at most this many ids.
const MAX_IDS: usize = 64;

#[derive(Clone, Copy, PartialEq)]
enum Shape {
    /// Full rows for `transaction`.
    Full,
    /// `{id, status, message}` triples for `txStatus`.
    Status,
}

impl Shape {
    fn render_row(self, row: &TransactionRow) -> Value {
        match self {
            Self::Full => row.api_json(),
            Self::Status => row.status_json(),
        }
    }

    /// Reshape an emitted full-row payload.
    fn render_emitted(self, data: &Value) -> Value {
        match self {
            Self::Full => data.clone(),
            Self::Status => json!({
                "id": data.get("id").cloned().unwrap_or(Value::Null),
                "status": data.get("status").cloned().unwrap_or(Value::Null),
                "message": data.get("message").cloned().unwrap_or(Value::Null),
            }),
        }
    }
}

pub async fn transaction(app: Arc<AppState>, message: Arc<Message>) -> ApiResult<Value> {
    query(app, message, Shape::Full).await
}

pub async fn tx_status(app: Arc<AppState>, message: Arc<Message>) -> ApiResult<Value> {
    query(app, message, Shape::Status).await
}

async fn query(app: Arc<AppState>, message: Arc<Message>, shape: Shape) -> ApiResult<Value> {
    // `{txId, push?, wait?}`, or a bare string carrying a single id.
    let (ids, single, push, wait) = match &message.data {
        Value::String(id) => (vec![id.clone()], true, false, false),
        data => {
            let body = body_object(data)?;
            let (ids, single) = match body.get("txId") {
                Some(Value::String(id)) => (vec![id.clone()], true),
                Some(Value::Array(list)) => {
                    let mut ids = Vec::with_capacity(list.len());
                    for entry in list {
                        match entry.as_str() {
                            Some(id) => ids.push(id.to_string()),
                            None => return Err(ApiError::bad_request("Missing or invalid txId.")),
                        }
                    }
                    (ids, false)
                }
                _ => return Err(ApiError::bad_request("Missing or invalid txId.")),
            };
            (
                ids,
                single,
                optional_bool(&body, "push")?,
                optional_bool(&body, "wait")?,
            )
        }
    };

    if ids.len() > MAX_IDS {
        return Err(ApiError::bad_request("Too many transaction ids."));
    }
    let mut id_bytes = Vec::with_capacity(ids.len());
    for id in &ids {
        id_bytes.push(
            parse_tx_id(&id.to_lowercase())
                .map_err(|_| ApiError::bad_request(format!("Invalid transaction id: {id}.")))?
                .to_vec(),
        );
    }
    let ids: Vec<String> = id_bytes
        .iter()
        .map(|id| validana_core::tx::hex_encode(id))
        .collect();
    // Subscriptions and completion counting work on the distinct ids;
    // duplicates in the request only affect the response ordering.
    let mut unique_ids: Vec<String> = Vec::with_capacity(ids.len());
    for id in &ids {
        if !unique_ids.contains(id) {
            unique_ids.push(id.clone());
        }
    }

    if push && !message.connection.can_push() {
        return Err(ApiError::bad_request("Cannot send push requests."));
    }
    if push || wait {
        message.clear_latency();
    }

    let conn = message.connection.clone();
    let hub = app.hubs.hub(TRANSACTION_ID_EVENT);

    // Waiting subscribes before the lookup so a transaction processed in
    // between is not missed; ids that turn out processed are unsubscribed
    // again below.
    let mut waiter = None;
    if push || wait {
        let (emitted_tx, emitted_rx) = mpsc::unbounded_channel::<Value>();
        for id in &unique_ids {
            if wait {
                let emitted_tx = emitted_tx.clone();
                hub.subscribe(
                    Some(conn.id),
                    Some(id),
                    Arc::new(move |data| {
                        let _ = emitted_tx.send(data.clone());
                    }),
                );
            } else {
                // Push mode forwards straight to the client.
                let push_conn = conn.clone();
                hub.subscribe(
                    Some(conn.id),
                    Some(id),
                    Arc::new(move |data| {
                        push_conn.push("transaction", shape.render_emitted(data), 200);
                    }),
                );
            }
        }
        waiter = Some(emitted_rx);
    }

    let rows = app.store.get_transactions_by_ids(&id_bytes).await?;
    let by_id: HashMap<String, &TransactionRow> =
        rows.iter().map(|row| (row.id_hex(), row)).collect();

    let processed: Vec<String> = unique_ids
        .iter()
        .filter(|id| {
            by_id
                .get(*id)
                .is_some_and(|row| row.tx_status().map(|s| s.is_processed()).unwrap_or(false))
        })
        .cloned()
        .collect();

    if push || wait {
        // Already-processed ids will not be emitted again.
        for id in &processed {
            hub.unsubscribe(Some(conn.id), Some(id));
        }
    }

    if wait {
        let mut emitted_rx = waiter.expect("wait mode has a channel");
        let mut pending: usize = unique_ids.len() - processed.len();
        let mut emitted: HashMap<String, Value> = HashMap::new();
        while pending > 0 {
            let Some(data) = emitted_rx.recv().await else {
                // Connection closed mid-wait; the sweep dropped our senders.
                return Err(ApiError::bad_request("Connection closed."));
            };
            if let Some(id) = data.get("id").and_then(Value::as_str) {
                if !emitted.contains_key(id) && unique_ids.iter().any(|known| known == id) {
                    hub.unsubscribe(Some(conn.id), Some(id));
                    emitted.insert(id.to_string(), data);
                    pending -= 1;
                }
            }
        }

        let results: Vec<Value> = ids
            .iter()
            .map(|id| match emitted.get(id) {
                Some(data) => shape.render_emitted(data),
                None => shape.render_row(by_id[id]),
            })
            .collect();
        return Ok(collapse(results, single));
    }

    // Without wait, respond with the current state of whatever exists.
    // In push mode only processed rows are included; the rest arrive as
    // pushes.
    let results: Vec<Value> = ids
        .iter()
        .filter_map(|id| {
            let row = by_id.get(id)?;
            if push && !processed.contains(id) {
                return None;
            }
            Some(shape.render_row(row))
        })
        .collect();
    Ok(collapse(results, single))
}

/// A request made with a bare id answers with a bare value.
fn collapse(mut results: Vec<Value>, single: bool) -> Value {
    if single {
        if results.is_empty() {
            Value::Null
        } else {
            results.remove(0)
        }
    } else {
        Value::Array(results)
    }
}
