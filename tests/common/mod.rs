#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State as AxumState;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use chain_gateway_core::services::admission::{AdmissionGate, ApiKeyStore, InMemoryApiKeyStore, TierPolicy};
use chain_gateway_core::services::breaker::{BreakerPolicy, CircuitBreaker};
use chain_gateway_core::services::bus::{BlockEventBus, SubscriberQuota};
use chain_gateway_core::services::cache::PredictiveCache;
use chain_gateway_core::services::latency::LatencyController;
use chain_gateway_core::services::metrics::MetricsRegistry;
use chain_gateway_core::services::pipeline::RequestPipeline;
use chain_gateway_core::services::rate_limit::create_rate_limiter;
use chain_gateway_core::services::rpc::{ChainConfig, EndpointRegistry, RacerConfig, Racer, UpstreamEndpointConfig};
use chain_gateway_core::AppState;

/// Starts a tiny JSON-RPC server on an ephemeral loopback port that always
/// returns `response` and counts how many times it was hit. Stands in for a
/// real upstream node the way the racer's own tests never needed to, since
/// this crate's pipeline tests exercise real HTTP instead of a trait mock.
pub async fn spawn_mock_rpc(response: Value) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_state = hits.clone();

    #[derive(Clone)]
    struct MockState {
        response: Value,
        hits: Arc<AtomicUsize>,
    }

    async fn handler(AxumState(state): AxumState<MockState>) -> Json<Value> {
        state.hits.fetch_add(1, Ordering::SeqCst);
        Json(json!({ "jsonrpc": "2.0", "id": 1, "result": state.response }))
    }

    let app = Router::new()
        .route("/", post(handler))
        .with_state(MockState {
            response,
            hits: hits_for_state,
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("mock rpc listener should bind");
    let addr = listener.local_addr().expect("mock rpc listener should have a local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://{addr}"), hits)
}

/// Starts a loopback server that always answers with HTTP 500, used to
/// exercise failover and circuit-breaker paths without a live upstream.
pub async fn spawn_failing_rpc() -> String {
    async fn handler() -> axum::http::StatusCode {
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    }

    let app = Router::new().route("/", post(handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("mock rpc listener should bind");
    let addr = listener.local_addr().expect("mock rpc listener should have a local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{addr}")
}

/// Wires a minimal `AppState` pointed at a single "ethereum" endpoint list,
/// skipping `build_state`'s file-backed chain config load.
pub async fn build_test_state(endpoints: Vec<&str>) -> Arc<AppState> {
    let registry = Arc::new(EndpointRegistry::new());
    for url in &endpoints {
        registry.register("ethereum", url, None).await;
    }

    let mut chains = HashMap::new();
    chains.insert(
        "ethereum".to_string(),
        ChainConfig {
            chain: "ethereum".to_string(),
            endpoints: endpoints
                .iter()
                .map(|url| UpstreamEndpointConfig {
                    url: url.to_string(),
                    region: None,
                    timeout_ms: 2000,
                    auth: None,
                })
                .collect(),
            health_check_interval_secs: 30,
            health_cooldown_secs: 20,
        },
    );

    let racer = Arc::new(Racer::new(registry, chains, RacerConfig::default()));

    let key_store = Arc::new(InMemoryApiKeyStore::new());
    key_store.insert("test-free-key".to_string(), "free".to_string()).await;

    let mut policies = HashMap::new();
    policies.insert("free".to_string(), TierPolicy::free());

    let admission = Arc::new(AdmissionGate::new(key_store.clone() as Arc<dyn ApiKeyStore>, policies));
    let breaker = Arc::new(CircuitBreaker::new(BreakerPolicy::free()));
    breaker.register_policy("free", "ethereum", BreakerPolicy::free()).await;

    let cache = Arc::new(PredictiveCache::new(100, Duration::from_secs(1), Duration::from_secs(60)));
    let latency = Arc::new(LatencyController::new(Duration::from_secs(2), Duration::from_millis(50)));

    let pipeline = Arc::new(RequestPipeline::new(
        admission.clone(),
        breaker,
        cache.clone(),
        racer,
        latency.clone(),
    ));

    let bus = Arc::new(BlockEventBus::new());
    let quota = Arc::new(SubscriberQuota::new(1000, 20, 500));
    let metrics = MetricsRegistry::new().expect("metrics registry should construct");

    Arc::new(AppState {
        pipeline,
        admission,
        bus,
        quota,
        latency,
        cache,
        metrics,
        chains: HashMap::new(),
        key_store,
        metrics_enabled: true,
        global_rate_limiter: create_rate_limiter(1000),
    })
}
