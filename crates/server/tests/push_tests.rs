//! Push and long-poll semantics across the dispatcher and the
//! notification fanout.

mod common;

use common::{base64_tx, gateway, tx_id_hex};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use validana_server::message::{Connection, Message, OutboundFrame, TransportKind};
use validana_server::notifications;
use validana_server::testing::processed_row;
use validana_store::models::TxStatus;

fn ws_connection(
    gw: &common::TestGateway,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<OutboundFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Connection::ws(
        gw.state.next_connection_id(),
        "127.0.0.1:50000".parse().unwrap(),
        tx,
    ));
    (conn, rx)
}

fn ws_message(conn: &Arc<Connection>, verb: &str, data: Value) -> Arc<Message> {
    Message::new(
        conn.clone(),
        TransportKind::Ws,
        "v1",
        verb,
        data,
        Some("test".to_string()),
    )
}

async fn recv_push(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Value {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("push before timeout")
        .expect("channel open")
    {
        OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn tx_status_push_returns_known_and_pushes_the_rest() {
    let gw = gateway();
    // "ff" is already processed, "ee" is not.
    gw.store
        .push_processed(processed_row([0xff; 16], TxStatus::Accepted, 10_000));

    let (conn, mut rx) = ws_connection(&gw);
    let message = ws_message(
        &conn,
        "txstatus",
        json!({"txId": [tx_id_hex(0xff), tx_id_hex(0xee)], "push": true}),
    );

    let result = gw
        .state
        .dispatcher()
        .receive(message)
        .await
        .expect("dispatch succeeds");
    let list = result.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], tx_id_hex(0xff));

    // The processor marks "ee" and notifies.
    gw.store
        .push_processed(processed_row([0xee; 16], TxStatus::Accepted, 20_000));
    notifications::handle_payload(&gw.state, r#"{"ts":20000,"txs":1,"other":0}"#).await;

    let push = recv_push(&mut rx).await;
    assert_eq!(push["pushType"], "transaction");
    assert_eq!(push["status"], 200);
    assert_eq!(push["data"]["id"], tx_id_hex(0xee));
    assert!(push.get("id").is_none());
}

#[tokio::test]
async fn tx_status_wait_blocks_until_all_ids_processed() {
    let gw = gateway();
    gw.store
        .push_processed(processed_row([0x01; 16], TxStatus::Accepted, 10_000));

    let (conn, _rx) = ws_connection(&gw);
    let message = ws_message(
        &conn,
        "txstatus",
        json!({"txId": [tx_id_hex(0x01), tx_id_hex(0x02)], "wait": true}),
    );

    let state = gw.state.clone();
    let waiter = tokio::spawn(async move { state.dispatcher().receive(message).await });

    // Give the handler time to subscribe, then process the second id.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    gw.store
        .push_processed(processed_row([0x02; 16], TxStatus::Rejected, 20_000));
    notifications::handle_payload(&gw.state, r#"{"ts":20000,"txs":1,"other":0}"#).await;

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("wait resolves")
        .unwrap()
        .expect("dispatch succeeds");
    let list = result.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], tx_id_hex(0x01));
    assert_eq!(list[0]["status"], "accepted");
    assert_eq!(list[1]["id"], tx_id_hex(0x02));
    assert_eq!(list[1]["status"], "rejected");
}

#[tokio::test]
async fn process_wait_resolves_on_acceptance() {
    let gw = gateway();
    let (conn, _rx) = ws_connection(&gw);
    let message = ws_message(
        &conn,
        "process",
        json!({"base64tx": base64_tx(0x42), "wait": true}),
    );

    let state = gw.state.clone();
    let waiter = tokio::spawn(async move { state.dispatcher().receive(message).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    let store = gw.store.clone();
    store.mark_processed(&[0x42; 16], TxStatus::Accepted, None, 30_000);
    notifications::handle_payload(&gw.state, r#"{"ts":30000,"txs":1,"other":0}"#).await;

    let result = waiter.await.unwrap().expect("accepted transactions succeed");
    assert_eq!(result, Value::Null);
}

#[tokio::test]
async fn process_wait_carries_the_processor_diagnostic_on_reject() {
    let gw = gateway();
    let (conn, _rx) = ws_connection(&gw);
    let message = ws_message(
        &conn,
        "process",
        json!({"base64tx": base64_tx(0x43), "wait": true}),
    );

    let state = gw.state.clone();
    let waiter = tokio::spawn(async move { state.dispatcher().receive(message).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    gw.store.mark_processed(
        &[0x43; 16],
        TxStatus::Rejected,
        Some("Insufficient balance."),
        31_000,
    );
    notifications::handle_payload(&gw.state, r#"{"ts":31000,"txs":1,"other":0}"#).await;

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.status_code(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err.client_message(), "Insufficient balance.");
}

#[tokio::test]
async fn closed_connections_stop_receiving_pushes() {
    let gw = gateway();
    let (conn, mut rx) = ws_connection(&gw);
    let message = ws_message(
        &conn,
        "txstatus",
        json!({"txId": [tx_id_hex(0x77)], "push": true}),
    );
    gw.state
        .dispatcher()
        .receive(message)
        .await
        .expect("dispatch succeeds");

    // The connection closes; the protocol sweeps its subscriptions.
    gw.state.hubs.unsubscribe_connection(conn.id);

    gw.store
        .push_processed(processed_row([0x77; 16], TxStatus::Accepted, 40_000));
    notifications::handle_payload(&gw.state, r#"{"ts":40000,"txs":1,"other":0}"#).await;

    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "no push may arrive after the close sweep"
    );
}
