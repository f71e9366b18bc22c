//! The `process` verb: submit a transaction.

use super::basics::{body_object, optional_bool, optional_i64, require_str};
use crate::error::{ApiError, ApiResult};
use crate::message::Message;
use crate::notifications::TRANSACTION_ID_EVENT;
use crate::state::AppState;
use axum::http::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use validana_core::Transaction;
use validana_store::models::{NewTransaction, TxStatus};

/// Insert a submitted transaction with status `new`. By default the
/// submission is acknowledged with 202 before the processor sees it;
/// `wait = true` blocks until the processor has finished with it.
pub async fn process(app: Arc<AppState>, message: Arc<Message>) -> ApiResult<Value> {
    let body = body_object(&message.data)?;
    let base64tx = require_str(&body, "base64tx")?;
    let wait = optional_bool(&body, "wait")?;
    let create_ts = optional_i64(&body, "createTs")?.unwrap_or_else(now_ms);

    let tx = Transaction::from_base64(&base64tx)?;
    let id_hex = tx.id_hex();

    if tx.valid_till > i64::MAX as u64 {
        return Err(ApiError::bad_request("Missing or invalid base64tx."));
    }
    let new_tx = NewTransaction {
        transaction_id: tx.id.to_vec(),
        version: tx.version as i16,
        contract_hash: tx.contract_hash.to_vec(),
        valid_till: tx.valid_till as i64,
        payload: tx.payload,
        signature: tx.signature,
        public_key: tx.public_key,
        create_ts,
    };

    if !wait {
        app.store.insert_transaction(&new_tx).await?;
        message.set_status(StatusCode::ACCEPTED);
        return Ok(Value::Null);
    }

    // Long poll: the latency clock stops and the processed-transaction hub
    // resolves the request. Subscribing before the insert closes the window
    // in which the processor could finish first.
    message.clear_latency();
    let hub = app.hubs.hub(TRANSACTION_ID_EVENT);
    let (processed_tx, mut processed_rx) = mpsc::unbounded_channel::<Value>();
    hub.subscribe(
        Some(message.connection.id),
        Some(&id_hex),
        Arc::new(move |data| {
            let _ = processed_tx.send(data.clone());
        }),
    );

    if let Err(e) = app.store.insert_transaction(&new_tx).await {
        hub.unsubscribe(Some(message.connection.id), Some(&id_hex));
        return Err(e.into());
    }

    let processed = processed_rx.recv().await;
    hub.unsubscribe(Some(message.connection.id), Some(&id_hex));
    let Some(processed) = processed else {
        // The subscription was swept because the connection closed.
        return Err(ApiError::bad_request("Connection closed."));
    };

    let status = processed
        .get("status")
        .and_then(Value::as_str)
        .and_then(|s| TxStatus::parse(s).ok());
    match status {
        Some(TxStatus::Accepted) => Ok(Value::Null),
        _ => {
            let diagnostic = processed
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Transaction was rejected.");
            Err(ApiError::unprocessable(diagnostic))
        }
    }
}

pub(super) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
