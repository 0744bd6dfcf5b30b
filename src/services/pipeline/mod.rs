use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::services::admission::AdmissionGate;
use crate::services::breaker::CircuitBreaker;
use crate::services::cache::{PredictiveCache, RequestFingerprint};
use crate::services::chain::ChainKind;
use crate::services::latency::LatencyController;
use crate::services::metrics::MetricsRegistry;
use crate::services::rpc::Racer;

const DEADLINE_SAFETY_FACTOR: u32 = 2;

#[derive(Debug, Serialize)]
pub struct Timing {
    pub processing_ms: u64,
    pub cache_hit: bool,
    pub chain_latency_ms: Option<u64>,
    pub total_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct UnifiedResponse {
    pub result: Value,
    pub chain: String,
    pub method: String,
    pub request_id: String,
    pub timing: Timing,
}

/// C7 — orchestrates admission, the breaker, the cache, and the racer in
/// a fixed order: `admission -> breaker(cache.get || racer.race) -> cache.set`.
/// Constructed with every dependency as a non-optional parameter; there is
/// no two-phase "construct then wire" step.
pub struct RequestPipeline {
    admission: Arc<AdmissionGate>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<PredictiveCache>,
    racer: Arc<Racer>,
    latency: Arc<LatencyController>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RequestPipeline {
    pub fn new(
        admission: Arc<AdmissionGate>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<PredictiveCache>,
        racer: Arc<Racer>,
        latency: Arc<LatencyController>,
    ) -> Self {
        Self {
            admission,
            breaker,
            cache,
            racer,
            latency,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn serve(
        &self,
        token: &str,
        chain: &str,
        method: &str,
        params: Value,
        request_id: Option<String>,
    ) -> Result<UnifiedResponse, GatewayError> {
        let started_at = Instant::now();
        let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if ChainKind::from_chain_id(chain).is_none() {
            return Err(GatewayError::ChainUnsupported(chain.to_string()));
        }

        let admitted = match self.admission.admit(token).await {
            Ok(admitted) => admitted,
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    let reason = match &e {
                        GatewayError::Unauthorized => "unauthorized",
                        GatewayError::RateLimited { .. } => "rate_limited",
                        GatewayError::TierSaturated => "tier_saturated",
                        _ => "other",
                    };
                    metrics.admission_rejections_total.with_label_values(&["unknown", reason]).inc();
                }
                return Err(e);
            }
        };

        let adaptive_deadline = self.latency.adaptive_deadline(chain).await;
        let tier_bound = admitted.policy.latency_target * DEADLINE_SAFETY_FACTOR;
        let deadline = tier_bound.min(adaptive_deadline);

        let fingerprint = RequestFingerprint::new(chain, method, &params);

        let cache = self.cache.clone();
        let racer = self.racer.clone();
        let latency = self.latency.clone();
        let metrics = self.metrics.clone();
        let chain_owned = chain.to_string();
        let method_owned = method.to_string();

        let processing_start = Instant::now();

        let result = self
            .breaker
            .call(&admitted.tier, chain, || async move {
                if let Some(hit) = cache.get(&fingerprint).await {
                    if let Some(metrics) = &metrics {
                        metrics.cache_operations_total.with_label_values(&["get", "hit"]).inc();
                    }
                    return Ok((hit, true, None));
                }
                if let Some(metrics) = &metrics {
                    metrics.cache_operations_total.with_label_values(&["get", "miss"]).inc();
                }

                let call_started = Instant::now();
                let outcome = racer.race(&chain_owned, &method_owned, params, deadline).await;
                let elapsed = call_started.elapsed();

                if let Some(metrics) = &metrics {
                    let status = if outcome.is_ok() { "success" } else { "failure" };
                    metrics
                        .rpc_requests_total
                        .with_label_values(&[&chain_owned, &method_owned, status])
                        .inc();
                    metrics
                        .rpc_request_duration_seconds
                        .with_label_values(&[&chain_owned, &method_owned])
                        .observe(elapsed.as_secs_f64());
                }

                let value = outcome?;

                latency.record(&chain_owned, elapsed).await;
                cache.set(fingerprint, value.clone()).await;

                Ok::<(Value, bool, Option<Duration>), GatewayError>((value, false, Some(elapsed)))
            })
            .await;

        if let Some(metrics) = &self.metrics {
            if let Some(state) = self.breaker.state(&admitted.tier, chain).await {
                let code = match state {
                    crate::services::breaker::BreakerState::Closed => 0.0,
                    crate::services::breaker::BreakerState::HalfOpen => 1.0,
                    crate::services::breaker::BreakerState::Open => 2.0,
                };
                metrics
                    .rpc_circuit_breaker_state
                    .with_label_values(&[&admitted.tier, chain])
                    .set(code);
            }
        }

        let (value, cache_hit, chain_latency) = match result {
            Ok((value, cache_hit, observed)) => (value, cache_hit, observed),
            Err(e) => return Err(e),
        };

        let total = started_at.elapsed();
        let processing = processing_start.elapsed();

        Ok(UnifiedResponse {
            result: value,
            chain: chain.to_string(),
            method: method.to_string(),
            request_id,
            timing: Timing {
                processing_ms: processing.as_millis() as u64,
                cache_hit,
                chain_latency_ms: chain_latency.map(|d| d.as_millis() as u64),
                total_ms: total.as_millis() as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::admission::{ApiKey, ApiKeyStore, TierPolicy};
    use crate::services::breaker::BreakerPolicy;
    use crate::services::rpc::{EndpointRegistry, RacerConfig};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Instant as StdInstant;

    struct SingleKeyStore;

    #[async_trait]
    impl ApiKeyStore for SingleKeyStore {
        async fn resolve(&self, token: &str) -> Option<ApiKey> {
            if token == "valid" {
                Some(ApiKey {
                    token: token.to_string(),
                    tier: "free".to_string(),
                    created_at: StdInstant::now(),
                    expires_at: None,
                    request_count: 0,
                })
            } else {
                None
            }
        }
    }

    fn build_pipeline() -> RequestPipeline {
        let mut policies = HashMap::new();
        policies.insert("free".to_string(), TierPolicy::free());
        let admission = Arc::new(AdmissionGate::new(Arc::new(SingleKeyStore), policies));
        let breaker = Arc::new(CircuitBreaker::new(BreakerPolicy::free()));
        let cache = Arc::new(PredictiveCache::new(100, Duration::from_secs(1), Duration::from_secs(60)));
        let racer = Arc::new(Racer::new(Arc::new(EndpointRegistry::new()), HashMap::new(), RacerConfig::default()));
        let latency = Arc::new(LatencyController::new(Duration::from_secs(2), Duration::from_millis(100)));
        RequestPipeline::new(admission, breaker, cache, racer, latency)
    }

    #[tokio::test]
    async fn test_unauthorized_token_is_rejected_for_a_supported_chain() {
        let pipeline = build_pipeline();
        let result = pipeline
            .serve("garbage", "ethereum", "eth_blockNumber", serde_json::json!([]), None)
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_unknown_chain_is_rejected_before_admission_consumes_budget() {
        let pipeline = build_pipeline();
        let result = pipeline
            .serve("valid", "dogecoin", "getblockcount", serde_json::json!([]), None)
            .await;
        assert!(matches!(result, Err(GatewayError::ChainUnsupported(_))));
    }

    #[tokio::test]
    async fn test_no_healthy_endpoints_surfaces_upstream_failed() {
        let pipeline = build_pipeline();
        let result = pipeline
            .serve("valid", "ethereum", "eth_blockNumber", serde_json::json!([]), None)
            .await;
        assert!(matches!(result, Err(GatewayError::UpstreamFailed(_))));
    }
}
