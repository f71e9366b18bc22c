//! Fanout of processed-transaction notifications.
//!
//! The store-side listener forwards raw `blocks` channel payloads into a
//! channel consumed here. When a payload announces processed work and
//! anyone is subscribed, the freshly processed rows are fetched once and
//! emitted into the transaction hubs; WebSocket subscriptions then push
//! them to clients.

use crate::state::AppState;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use validana_store::models::{BlockNotification, TransactionRow};

/// Hub keyed by transaction id (hex).
pub const TRANSACTION_ID_EVENT: &str = "transactionId";
/// Hub keyed by sender or receiver address.
pub const TRANSACTION_ADDRESS_EVENT: &str = "transactionAddress";
/// Hub keyed by contract type.
pub const TRANSACTION_CONTRACT_EVENT: &str = "transactionContract";
/// Hub for every processed transaction, no subtype.
pub const TRANSACTION_EVENT: &str = "transaction";
/// Hub carrying raw block announcements.
pub const BLOCK_EVENT: &str = "block";

/// Consume forwarded notification payloads until the sender side closes.
pub fn spawn(app: Arc<AppState>, mut payloads: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = payloads.recv().await {
            handle_payload(&app, &payload).await;
        }
    })
}

/// Process one raw channel payload.
pub async fn handle_payload(app: &AppState, payload: &str) {
    let notification: BlockNotification = match serde_json::from_str(payload) {
        Ok(notification) => notification,
        Err(e) => {
            tracing::warn!(error = %e, payload, "Discarding malformed notification");
            return;
        }
    };

    if let Some(block) = notification.block {
        app.hubs
            .hub(BLOCK_EVENT)
            .emit(&json!({"block": block, "ts": notification.ts}), None);
    }

    let interested = [
        TRANSACTION_ID_EVENT,
        TRANSACTION_ADDRESS_EVENT,
        TRANSACTION_CONTRACT_EVENT,
        TRANSACTION_EVENT,
    ]
    .iter()
    .any(|event| app.hubs.hub(event).has_any_subscribers());

    if !interested || !notification.has_work() {
        return;
    }

    let rows = match app.store.get_transactions_processed_at(notification.ts).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, ts = notification.ts, "Could not load processed transactions");
            return;
        }
    };

    for row in &rows {
        fan_out(app, row);
    }
}

/// Emit one processed row into every transaction hub.
fn fan_out(app: &AppState, row: &TransactionRow) {
    let data = row.api_json();

    app.hubs
        .hub(TRANSACTION_ID_EVENT)
        .emit(&data, Some(&row.id_hex()));

    let addresses = app.hubs.hub(TRANSACTION_ADDRESS_EVENT);
    if let Some(sender) = &row.sender {
        addresses.emit(&data, Some(sender));
    }
    if let Some(receiver) = &row.receiver {
        // A self-transfer would otherwise notify the same subtype twice.
        if row.sender.as_deref() != Some(receiver.as_str()) {
            addresses.emit(&data, Some(receiver));
        }
    }

    if let Some(contract_type) = &row.contract_type {
        app.hubs
            .hub(TRANSACTION_CONTRACT_EVENT)
            .emit(&data, Some(contract_type));
    }

    app.hubs.hub(TRANSACTION_EVENT).emit(&data, None);
}
