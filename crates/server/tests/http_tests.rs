//! HTTP protocol tests against the in-memory store.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{base64_tx, body_text, gateway, gateway_with, tx_id_hex};
use serde_json::{Value, json};
use validana_core::AppConfig;
use validana_store::models::TxStatus;
use validana_store::repos::MetricsRepo;

#[tokio::test]
async fn options_preflight_carries_cors_headers() {
    let gw = gateway();
    let response = gw
        .request(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/v1/time")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .unwrap(),
        "POST, GET"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_MAX_AGE)
            .unwrap(),
        "86400"
    );
    assert!(body_text(response).await.is_empty());
}

#[tokio::test]
async fn unknown_verb_lists_supported_types() {
    let gw = gateway();
    let response = gw.get("/api/v1/nosuch").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_text(response).await;
    assert!(
        body.starts_with("Invalid type: nosuch, supported types:"),
        "unexpected body: {body}"
    );
}

#[tokio::test]
async fn missing_version_segment_is_rejected() {
    let gw = gateway();
    let response = gw.get("/api/v9/time").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Invalid url.");

    // A bare version with no verb is also invalid.
    let response = gw.get("/v1").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn version_and_verb_are_case_insensitive() {
    let gw = gateway();
    gw.store.push_block(1, 42_000);
    let response = gw.get("/api/V1/TIME").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "42000");
}

#[tokio::test]
async fn time_without_blocks_is_a_client_error() {
    let gw = gateway();
    let response = gw.get("/api/v1/time").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "No existing blocks found.");
}

#[tokio::test]
async fn time_reports_latest_block() {
    let gw = gateway();
    gw.store.push_block(1, 41_000);
    gw.store.push_block(2, 42_000);

    let response = gw.get("/v1/time").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(body_text(response).await, "42000");
}

#[tokio::test]
async fn unsupported_method_yields_405() {
    let gw = gateway();
    let response = gw
        .request(
            Request::builder()
                .method("PUT")
                .uri("/v1/time")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn overlong_url_yields_414() {
    let mut config = AppConfig::for_testing();
    config.maxpayloadsize = 64;
    let gw = gateway_with(config);

    let response = gw.get(&format!("/v1/time?pad={}", "x".repeat(100))).await;
    assert_eq!(response.status(), StatusCode::URI_TOO_LONG);

    // At exactly the limit the request goes through.
    let path = "/v1/time";
    let padded = format!("{path}?p={}", "x".repeat(64 - path.len() - 3));
    assert_eq!(padded.len(), 64);
    let response = gw.get(&padded).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "No existing blocks found.");
}

#[tokio::test]
async fn oversized_post_body_yields_413() {
    let mut config = AppConfig::for_testing();
    config.maxpayloadsize = 128;
    let gw = gateway_with(config);

    let body = format!(r#"{{"base64tx":"{}"}}"#, "A".repeat(500));
    let response = gw.post("/v1/process", &body).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn process_acknowledges_with_202() {
    let gw = gateway();
    let body = json!({"base64tx": base64_tx(0xaa)}).to_string();

    let response = gw.post("/v1/process", &body).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_text(response).await.is_empty());

    let stored = gw.store.transactions.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, "new");
    assert_eq!(stored[0].transaction_id, vec![0xaa; 16]);
}

#[tokio::test]
async fn duplicate_process_is_rejected() {
    let gw = gateway();
    let body = json!({"base64tx": base64_tx(0xbb)}).to_string();

    gw.post("/v1/process", &body).await;
    let response = gw.post("/v1/process", &body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let text = body_text(response).await;
    assert_eq!(
        text,
        format!("Transaction with id {} already exists.", tx_id_hex(0xbb))
    );
}

#[tokio::test]
async fn malformed_base64_is_rejected() {
    let gw = gateway();
    let response = gw
        .post("/v1/process", &json!({"base64tx": "!!!"}).to_string())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = gw.post("/v1/process", "{}").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Missing or invalid base64tx.");
}

#[tokio::test]
async fn tx_status_reports_processed_rows() {
    let gw = gateway();
    gw.store.push_processed(validana_server::testing::processed_row(
        [0xcc; 16],
        TxStatus::Accepted,
        50_000,
    ));

    let body = json!({"txId": [tx_id_hex(0xcc), tx_id_hex(0xdd)]}).to_string();
    let response = gw.post("/v1/txstatus", &body).await;
    assert_eq!(response.status(), StatusCode::OK);

    let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
    let list = value.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], tx_id_hex(0xcc));
    assert_eq!(list[0]["status"], "accepted");
}

#[tokio::test]
async fn tx_status_verb_matches_camel_case_path() {
    let gw = gateway();
    gw.store.push_processed(validana_server::testing::processed_row(
        [0x12; 16],
        TxStatus::Accepted,
        80_000,
    ));
    // The verb is lower-cased on registration and on parse, so the camel
    // case spelling used by WebSocket clients works over HTTP too.
    let response = gw
        .get(&format!("/v1/txStatus?txId={}", tx_id_hex(0x12)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(value["status"], "accepted");
}

#[tokio::test]
async fn transaction_returns_full_rows() {
    let gw = gateway();
    gw.store.push_processed(validana_server::testing::processed_row(
        [0xee; 16],
        TxStatus::Rejected,
        60_000,
    ));

    let body = json!({"txId": tx_id_hex(0xee)}).to_string();
    let response = gw.post("/v1/transaction", &body).await;
    let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
    // A single-id request answers with the bare row.
    assert_eq!(value["id"], tx_id_hex(0xee));
    assert_eq!(value["status"], "rejected");
    assert_eq!(value["sender"], "sender-address");
}

#[tokio::test]
async fn invalid_transaction_ids_are_rejected() {
    let gw = gateway();
    let response = gw
        .post("/v1/txstatus", &json!({"txId": "zz"}).to_string())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Invalid transaction id: zz.");
}

#[tokio::test]
async fn push_is_refused_over_http() {
    let gw = gateway();
    let body = json!({"txId": tx_id_hex(1), "push": true}).to_string();
    let response = gw.post("/v1/txstatus", &body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Cannot send push requests.");
}

#[tokio::test]
async fn contracts_serves_from_cache_within_ttl() {
    let gw = gateway();
    gw.store.push_contract("transfer", "1.0");
    gw.store.push_contract("mint", "2.1");

    let response = gw.post("/v1/contracts", "{}").await;
    let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 2);

    // A store change within the TTL is not visible yet.
    gw.store.push_contract("burn", "1.0");
    let response = gw.post("/v1/contracts", "{}").await;
    let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 2);

    // Filtering by type goes through its own cache key.
    let response = gw
        .post("/v1/contracts", &json!({"type": "mint"}).to_string())
        .await;
    let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 1);
    assert_eq!(value[0]["type"], "mint");

    // A bare string body selects the type too.
    let response = gw.post("/v1/contracts", "transfer").await;
    let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(value[0]["type"], "transfer");
}

#[tokio::test]
async fn get_query_forms_reach_the_same_handler() {
    let gw = gateway();
    gw.store.push_processed(validana_server::testing::processed_row(
        [0x11; 16],
        TxStatus::Accepted,
        70_000,
    ));

    // JSON in the query string.
    let encoded = format!(
        "/v1/txstatus?%7B%22txId%22%3A%22{}%22%7D",
        tx_id_hex(0x11)
    );
    let json_response = gw.get(&encoded).await;
    assert_eq!(json_response.status(), StatusCode::OK);
    let from_json: Value = serde_json::from_str(&body_text(json_response).await).unwrap();

    // Form pairs.
    let form_response = gw
        .get(&format!("/v1/txstatus?txId={}", tx_id_hex(0x11)))
        .await;
    let from_form: Value = serde_json::from_str(&body_text(form_response).await).unwrap();

    assert_eq!(from_json, from_form);
    assert_eq!(from_json["status"], "accepted");
}

#[tokio::test]
async fn metrics_requires_the_configured_token() {
    let mut config = AppConfig::for_testing();
    config.metricsinterval = 30;
    config.metricstoken = "right".to_string();
    let gw = gateway_with(config);

    let response = gw
        .post(
            "/v1/metrics",
            &json!({"format": "prometheus", "token": "wrong"}).to_string(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_text(response).await, "Invalid token.");
}

#[tokio::test]
async fn metrics_exports_prometheus_after_a_sync() {
    let mut config = AppConfig::for_testing();
    config.metricsinterval = 30;
    config.metricstoken = "right".to_string();
    let gw = gateway_with(config);

    // Simulate one worker sync landing rows in the store.
    let totals = gw.state.metrics.totals_snapshot();
    let currents = gw.state.metrics.currents_snapshot(77, 123_456);
    gw.store.sync_metrics(0, &totals, &currents).await.unwrap();

    let response = gw
        .post(
            "/v1/metrics",
            &json!({"format": "prometheus", "token": "right"}).to_string(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=UTF-8"
    );
    let body = body_text(response).await;
    assert!(body.contains("validana_latency_bucket{le=\"+Inf\"}"));
    assert!(body.contains("validana_memory{worker=\"0\"} 77"));
}

#[tokio::test]
async fn metrics_export_fails_when_disabled() {
    let gw = gateway(); // metricsinterval = 0
    let response = gw
        .post(
            "/v1/metrics",
            &json!({"format": "json", "token": ""}).to_string(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Gathering metrics is disabled.");
}

#[tokio::test]
async fn unknown_metrics_format_is_rejected() {
    let mut config = AppConfig::for_testing();
    config.metricsinterval = 30;
    let gw = gateway_with(config);

    let response = gw
        .post(
            "/v1/metrics",
            &json!({"format": "xml", "token": ""}).to_string(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Unknown format: xml.");
}
