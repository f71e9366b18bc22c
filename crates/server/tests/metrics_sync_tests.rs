//! Metrics sync semantics against the store.

mod common;

use axum::http::StatusCode;
use common::gateway;
use std::time::Duration;
use validana_server::message::TransportKind;
use validana_store::repos::MetricsRepo;

#[tokio::test]
async fn totals_accumulate_across_workers_under_minus_one() {
    let gw = gateway();
    let metrics = &gw.state.metrics;

    metrics.record_response(TransportKind::Rest, StatusCode::OK);
    metrics.record_response(TransportKind::Rest, StatusCode::OK);

    // Worker 0 syncs and resets.
    let snapshot = metrics.totals_snapshot();
    gw.store.sync_metrics(0, &snapshot, &[]).await.unwrap();
    metrics.commit_totals(&snapshot);

    // Worker 1 (same registers reused here) syncs one more success.
    metrics.record_response(TransportKind::Rest, StatusCode::OK);
    let snapshot = metrics.totals_snapshot();
    gw.store.sync_metrics(1, &snapshot, &[]).await.unwrap();
    metrics.commit_totals(&snapshot);

    let aggregated = gw.store.aggregated_metrics().await.unwrap();
    // The sum over workers landed in the single worker = -1 row.
    assert_eq!(aggregated.totals["requestsSuccessRest"], 3);

    // Local counters are empty after the commits.
    let remaining: i64 = gw
        .state
        .metrics
        .totals_snapshot()
        .into_iter()
        .map(|(_, value)| value)
        .sum();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn currents_replace_rather_than_accumulate() {
    let gw = gateway();

    let currents = gw.state.metrics.currents_snapshot(100, 1_000);
    gw.store.sync_metrics(0, &[], &currents).await.unwrap();
    let currents = gw.state.metrics.currents_snapshot(64, 2_000);
    gw.store.sync_metrics(0, &[], &currents).await.unwrap();

    let aggregated = gw.store.aggregated_metrics().await.unwrap();
    let memory = aggregated.currents["memory"].as_array().unwrap().clone();
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0]["value"], 64);
    assert_eq!(aggregated.currents["lastSync"][0]["value"], 2_000);
}

#[tokio::test]
async fn stale_worker_rows_are_deleted() {
    let gw = gateway();

    // Rows from a departed worker 7 and a live worker 0.
    let currents = gw.state.metrics.currents_snapshot(100, 1_000);
    gw.store.sync_metrics(7, &[], &currents).await.unwrap();
    gw.store.sync_metrics(0, &[], &currents).await.unwrap();
    gw.store
        .sync_metrics(0, &[("custom".to_string(), 5)], &[])
        .await
        .unwrap();

    let removed = gw.store.delete_stale_workers(&[0, 1]).await.unwrap();
    assert_eq!(removed, 3);

    let aggregated = gw.store.aggregated_metrics().await.unwrap();
    assert_eq!(aggregated.currents["memory"].as_array().unwrap().len(), 1);
    // Totals under worker = -1 survive worker cleanup.
    assert_eq!(aggregated.totals["custom"], 5);
}

#[tokio::test]
async fn ws_lifetime_flows_into_the_store() {
    let gw = gateway();
    let metrics = &gw.state.metrics;

    metrics.record_ws_open();
    metrics.record_ws_close(Duration::from_secs(200));

    let totals = metrics.totals_snapshot();
    gw.store.sync_metrics(0, &totals, &[]).await.unwrap();

    let aggregated = gw.store.aggregated_metrics().await.unwrap();
    assert_eq!(aggregated.totals["websocket300"], 1);
    assert_eq!(aggregated.totals["websocketTotal"], 200);
}
