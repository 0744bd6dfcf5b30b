use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;

use chain_gateway_core::create_app;

use crate::common::{build_test_state, spawn_mock_rpc};

#[tokio::test]
async fn test_missing_api_key_is_rejected() {
    let (url, _hits) = spawn_mock_rpc(json!(1)).await;
    let state = build_test_state(vec![&url]).await;
    let server = TestServer::new(create_app(state)).expect("server should build");

    let response = server
        .post("/api/v1/universal/ethereum/eth_blockNumber")
        .json(&json!({ "params": [] }))
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_chain_is_rejected_with_404() {
    let (url, _hits) = spawn_mock_rpc(json!(1)).await;
    let state = build_test_state(vec![&url]).await;
    let server = TestServer::new(create_app(state)).expect("server should build");

    let response = server
        .post("/api/v1/universal/dogecoin/getblockcount")
        .add_header("x-api-key", "test-free-key")
        .json(&json!({ "params": [], "request_id": "req-1" }))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["chain"], json!("dogecoin"));
    assert_eq!(body["request_id"], json!("req-1"));
    assert_eq!(body["error"]["code"], json!("CHAIN_UNSUPPORTED"));
}

#[tokio::test]
async fn test_non_array_or_object_params_is_rejected_with_400() {
    let (url, _hits) = spawn_mock_rpc(json!(1)).await;
    let state = build_test_state(vec![&url]).await;
    let server = TestServer::new(create_app(state)).expect("server should build");

    let response = server
        .post("/api/v1/universal/ethereum/eth_blockNumber")
        .add_header("x-api-key", "test-free-key")
        .json(&json!({ "params": "not-an-array-or-object" }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));
}

#[tokio::test]
async fn test_empty_method_is_rejected_with_400() {
    let (url, _hits) = spawn_mock_rpc(json!(1)).await;
    let state = build_test_state(vec![&url]).await;
    let server = TestServer::new(create_app(state)).expect("server should build");

    let response = server
        .post("/api/v1/universal/ethereum/%20")
        .add_header("x-api-key", "test-free-key")
        .json(&json!({ "params": [] }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));
}

#[tokio::test]
async fn test_second_identical_call_is_served_from_cache() {
    let (url, hits) = spawn_mock_rpc(json!("0x10")).await;
    let state = build_test_state(vec![&url]).await;
    let server = TestServer::new(create_app(state)).expect("server should build");

    let first = server
        .post("/api/v1/universal/ethereum/eth_blockNumber")
        .add_header("x-api-key", "test-free-key")
        .json(&json!({ "params": [] }))
        .await;
    first.assert_status(StatusCode::OK);
    let first_body: serde_json::Value = first.json();
    assert_eq!(first_body["timing"]["cache_hit"], json!(false));

    let second = server
        .post("/api/v1/universal/ethereum/eth_blockNumber")
        .add_header("x-api-key", "test-free-key")
        .json(&json!({ "params": [] }))
        .await;
    second.assert_status(StatusCode::OK);
    let second_body: serde_json::Value = second.json();
    assert_eq!(second_body["timing"]["cache_hit"], json!(true));
    assert_eq!(second_body["result"], json!("0x10"));

    assert_eq!(hits.load(Ordering::SeqCst), 1, "upstream should only be hit once");
}

#[tokio::test]
async fn test_health_and_chains_endpoints_respond() {
    let (url, _hits) = spawn_mock_rpc(json!(1)).await;
    let state = build_test_state(vec![&url]).await;
    let server = TestServer::new(create_app(state)).expect("server should build");

    server.get("/health").await.assert_status(StatusCode::OK);
    server.get("/metrics").await.assert_status(StatusCode::OK);
}
