pub mod config;
pub mod errors;
pub mod services;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use config::GatewayConfig;
use errors::GatewayError;
use services::admission::{AdmissionGate, ApiKeyStore, InMemoryApiKeyStore, TierPolicy};
use services::breaker::{BreakerPolicy, CircuitBreaker};
use services::bus::{BlockEventBus, SubscriberQuota};
use services::cache::{CacheWarmer, PredictiveCache};
use services::chain::{build_backend, ChainBackend, ChainKind};
use services::latency::LatencyController;
use services::metrics::{metrics_middleware, MetricsRegistry};
use services::pipeline::RequestPipeline;
use services::rate_limit::{create_rate_limiter, GlobalRateLimiter, RateLimitLayer};
use services::rpc::{config::load_chain_configs, ChainConfig, EndpointRegistry, RacerConfig, Racer};
use services::security::security_headers;

pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub admission: Arc<AdmissionGate>,
    pub bus: Arc<BlockEventBus>,
    pub quota: Arc<SubscriberQuota>,
    pub latency: Arc<LatencyController>,
    pub cache: Arc<PredictiveCache>,
    pub metrics: Arc<MetricsRegistry>,
    pub chains: HashMap<String, Box<dyn ChainBackend>>,
    pub key_store: Arc<InMemoryApiKeyStore>,
    pub global_rate_limiter: GlobalRateLimiter,
    pub metrics_enabled: bool,
}

/// Builds the process-wide dependency graph. Every collaborator is passed
/// to its consumer as a non-optional constructor parameter; there is no
/// two-phase "construct then wire" step and no nullable back-reference.
pub async fn build_state(gateway_config: &GatewayConfig) -> Result<Arc<AppState>, Box<dyn std::error::Error>> {
    let chain_configs: HashMap<String, ChainConfig> = load_chain_configs(&gateway_config.chain_config_path)?;

    let metrics = MetricsRegistry::new()?;

    let registry = Arc::new(EndpointRegistry::new().with_metrics(metrics.clone()));
    for config in chain_configs.values() {
        for endpoint in &config.endpoints {
            registry
                .register(&config.chain, &endpoint.url, endpoint.region.clone())
                .await;
        }
    }

    let racer_config = RacerConfig::default();
    let base_deadline = Duration::from_millis(racer_config.race_timeout_ms);
    let racer = Arc::new(Racer::new(registry.clone(), chain_configs.clone(), racer_config));

    // C1's background prober: independent of live traffic, probes every
    // configured endpoint on its chain's `health_check_interval_secs` and
    // feeds the result into the same `EndpointRegistry::record` the racer
    // itself writes through.
    tokio::spawn({
        let racer = racer.clone();
        async move { racer.run_health_prober().await }
    });

    let bus = Arc::new(BlockEventBus::new().with_metrics(metrics.clone()));

    let mut chains: HashMap<String, Box<dyn ChainBackend>> = HashMap::new();
    for chain_id in chain_configs.keys() {
        if let Some(kind) = ChainKind::from_chain_id(chain_id) {
            chains.insert(
                chain_id.clone(),
                build_backend(kind, chain_id.clone(), racer.clone(), bus.clone()),
            );
        }
    }

    let key_store = Arc::new(InMemoryApiKeyStore::new());
    key_store.insert("dev-free-key".to_string(), "free".to_string()).await;
    key_store.insert("dev-enterprise-key".to_string(), "enterprise".to_string()).await;

    let mut policies = HashMap::new();
    policies.insert("free".to_string(), TierPolicy::free());
    policies.insert("enterprise".to_string(), TierPolicy::enterprise());

    let admission = Arc::new(
        AdmissionGate::new(key_store.clone() as Arc<dyn ApiKeyStore>, policies).with_metrics(metrics.clone()),
    );

    let breaker = Arc::new(CircuitBreaker::new(BreakerPolicy::free()));
    for chain_id in chain_configs.keys() {
        breaker.register_policy("free", chain_id, BreakerPolicy::free()).await;
        breaker.register_policy("enterprise", chain_id, BreakerPolicy::enterprise()).await;
    }

    let cache = Arc::new(
        PredictiveCache::new(
            gateway_config.cache_capacity,
            gateway_config.cache_min_ttl,
            gateway_config.cache_max_ttl,
        )
        .with_metrics(metrics.clone()),
    );

    let warmer = Arc::new(CacheWarmer::new(cache.clone(), racer.clone()));
    let latency = Arc::new(
        LatencyController::new(base_deadline, Duration::from_millis(50))
            .with_warm_trigger(warmer)
            .with_metrics(metrics.clone()),
    );

    let pipeline = Arc::new(
        RequestPipeline::new(admission.clone(), breaker, cache.clone(), racer, latency.clone())
            .with_metrics(metrics.clone()),
    );

    let quota = Arc::new(SubscriberQuota::new(
        gateway_config.subscriber_quota_global,
        gateway_config.subscriber_quota_per_ip,
        gateway_config.subscriber_quota_per_chain,
    ));

    let global_rate_limiter = create_rate_limiter(gateway_config.global_rate_limit_burst);

    Ok(Arc::new(AppState {
        pipeline,
        admission,
        bus,
        quota,
        latency,
        cache,
        metrics,
        chains,
        key_store,
        global_rate_limiter,
        metrics_enabled: gateway_config.metrics_enabled,
    }))
}

/// Builds the router. The `/metrics` scrape endpoint and the per-request
/// metrics middleware are both gated on `GatewayConfig::metrics_enabled` —
/// collaborators still record into the registry either way, this only
/// controls whether the HTTP surface exposes it.
pub fn create_app(state: Arc<AppState>) -> Router {
    let metrics_for_middleware = state.metrics.clone();
    let global_rate_limiter = state.global_rate_limiter.clone();
    let metrics_enabled = state.metrics_enabled;

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/chains", get(list_chains))
        .route("/v1/latency", get(latency_snapshot))
        .route("/v1/cache", get(cache_snapshot))
        .route("/api/v1/universal/:chain/:method", post(universal_rpc))
        .route("/v1/:chain/stream", get(chain_stream));

    if metrics_enabled {
        router = router
            .route("/metrics", get(export_metrics))
            .layer(middleware::from_fn_with_state(metrics_for_middleware, metrics_middleware));
    }

    router
        .layer(middleware::from_fn(security_headers))
        .layer(RequestBodyLimitLayer::new(1024 * 100))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RateLimitLayer::new(global_rate_limiter))
        .with_state(state)
}

#[derive(Deserialize)]
struct UniversalRequestBody {
    params: Value,
    request_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<Value>,
}

fn extract_token(headers: &HeaderMap) -> Result<String, GatewayError> {
    if let Some(value) = headers.get("x-api-key") {
        return value
            .to_str()
            .map(str::to_string)
            .map_err(|_| GatewayError::Unauthorized);
    }
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        let raw = value.to_str().map_err(|_| GatewayError::Unauthorized)?;
        if let Some(token) = raw.strip_prefix("Bearer ") {
            return Ok(token.to_string());
        }
    }
    Err(GatewayError::Unauthorized)
}

/// Streams have no request body to carry a bearer token in, so a caller may
/// also pass the key as `?api_key=` / `?key=` on the upgrade URL; the header
/// forms are still tried first.
fn extract_stream_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Result<String, GatewayError> {
    if let Ok(token) = extract_token(headers) {
        return Ok(token);
    }
    query
        .get("api_key")
        .or_else(|| query.get("key"))
        .cloned()
        .ok_or(GatewayError::Unauthorized)
}

async fn universal_rpc(
    State(state): State<Arc<AppState>>,
    Path((chain, method)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<UniversalRequestBody>,
) -> Response {
    let request_id = body.request_id.clone();
    let token = match extract_token(&headers) {
        Ok(t) => t,
        Err(e) => return e.into_response_with_context(Some(chain), request_id),
    };

    if method.trim().is_empty() {
        let err = GatewayError::InvalidRequest("method must not be empty".to_string());
        return err.into_response_with_context(Some(chain), request_id);
    }
    if !body.params.is_array() && !body.params.is_object() {
        let err = GatewayError::InvalidRequest("params must be an object or array".to_string());
        return err.into_response_with_context(Some(chain), request_id);
    }

    match state
        .pipeline
        .serve(&token, &chain, &method, body.params, body.request_id)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response_with_context(Some(chain), request_id),
    }
}

/// Prefers a load balancer's `X-Forwarded-For` (first hop) over the raw
/// peer address, matching the teacher's `security_headers` precedent of
/// trusting proxy-set headers at the edge; falls back to the TCP peer IP
/// when the header is absent (direct connections, local dev).
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn chain_stream(
    State(state): State<Arc<AppState>>,
    Path(chain): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if ChainKind::from_chain_id(&chain).is_none() {
        let unsupported = chain.clone();
        return GatewayError::ChainUnsupported(unsupported).into_response_with_context(Some(chain), None);
    }

    // Admission -> Quota -> attach to the bus, same order as the RPC pipeline.
    let token = match extract_stream_token(&headers, &query) {
        Ok(t) => t,
        Err(e) => return e.into_response_with_context(Some(chain), None),
    };
    if let Err(e) = state.admission.admit(&token).await {
        return e.into_response_with_context(Some(chain), None);
    }

    let ip = client_ip(&headers, peer);
    ws.on_upgrade(move |socket| handle_stream(socket, state, chain, ip))
}

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_GRACE: Duration = Duration::from_secs(10);
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

async fn handle_stream(mut socket: WebSocket, state: Arc<AppState>, chain: String, ip: String) {
    let grant = match state.quota.try_acquire(&ip, &chain).await {
        Some(g) => g,
        None => {
            let _ = socket.close().await;
            return;
        }
    };

    let mut subscription = match state.chains.get(&chain) {
        Some(backend) => backend.stream_blocks().await,
        None => {
            let _ = socket.close().await;
            return;
        }
    };
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut liveness_interval = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
    let mut last_activity = std::time::Instant::now();
    let mut awaiting_pong_since: Option<std::time::Instant> = None;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong_since.get_or_insert_with(std::time::Instant::now);
            }
            _ = liveness_interval.tick() => {
                if let Some(since) = awaiting_pong_since {
                    if since.elapsed() > PONG_GRACE {
                        break;
                    }
                }
                if last_activity.elapsed() > READ_IDLE_TIMEOUT {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = std::time::Instant::now();
                        awaiting_pong_since = None;
                    }
                    Some(Ok(_)) => {
                        last_activity = std::time::Instant::now();
                    }
                }
            }
        }
    }

    state.bus.unsubscribe(&chain, subscription.id).await;
    drop(grant);
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: u64,
}

async fn health_check() -> Json<HealthResponse> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp,
    })
}

async fn list_chains(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.chains.keys().cloned().collect())
}

async fn latency_snapshot(State(state): State<Arc<AppState>>) -> Response {
    Json(state.latency.snapshot_all().await).into_response()
}

async fn cache_snapshot(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.cache.stats().await;
    Json(serde_json::json!({ "len": stats.len, "capacity": stats.capacity })).into_response()
}

async fn export_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.export() {
        Ok(body) => ([("content-type", "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => GatewayError::Internal(e.to_string()).into_response(),
    }
}
