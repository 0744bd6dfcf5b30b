use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

const FAILURE_THRESHOLD: u32 = 3;
const EWMA_ALPHA: f64 = 0.2;

/// Per-(chain,url) rolling health, matching the invariant in the data model:
/// `healthy ⇔ (consecutive_failures < threshold) OR (now - last_unhealthy_at ≥ cooldown)`.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    pub url: String,
    pub region: Option<String>,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub last_unhealthy_at: Option<Instant>,
}

impl UpstreamEndpoint {
    fn new(url: String, region: Option<String>) -> Self {
        Self {
            url,
            region,
            avg_latency_ms: 0.0,
            success_rate: 1.0,
            consecutive_failures: 0,
            healthy: true,
            last_unhealthy_at: None,
        }
    }

    fn record_success(&mut self, latency_ms: f64) {
        self.avg_latency_ms = if self.avg_latency_ms == 0.0 {
            latency_ms
        } else {
            EWMA_ALPHA * latency_ms + (1.0 - EWMA_ALPHA) * self.avg_latency_ms
        };
        self.success_rate = (0.9 * self.success_rate + 0.1).min(1.0);
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.success_rate = (0.9 * self.success_rate).max(0.0);
        self.consecutive_failures += 1;
        if self.consecutive_failures >= FAILURE_THRESHOLD {
            self.healthy = false;
            self.last_unhealthy_at = Some(Instant::now());
        }
    }

    /// Non-mutating eligibility check used while iterating a read snapshot.
    fn eligible(&self, cooldown: Duration) -> bool {
        self.healthy
            || self
                .last_unhealthy_at
                .map(|t| t.elapsed() >= cooldown)
                .unwrap_or(false)
    }
}

/// C1 — Endpoint Health Registry. Keyed by (chain, url).
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<(String, String), UpstreamEndpoint>>,
    metrics: Option<Arc<crate::services::metrics::MetricsRegistry>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<crate::services::metrics::MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn register(&self, chain: &str, url: &str, region: Option<String>) {
        let mut endpoints = self.endpoints.write().await;
        endpoints
            .entry((chain.to_string(), url.to_string()))
            .or_insert_with(|| UpstreamEndpoint::new(url.to_string(), region));
    }

    /// Returns endpoints currently eligible (healthy, or unhealthy-past-cooldown,
    /// which are optimistically re-admitted), ordered by ascending latency then
    /// descending success rate.
    pub async fn snapshot_healthy(&self, chain: &str, cooldown: Duration) -> Vec<UpstreamEndpoint> {
        let endpoints = self.endpoints.read().await;
        let mut candidates: Vec<UpstreamEndpoint> = endpoints
            .iter()
            .filter(|((c, _), _)| c == chain)
            .map(|(_, ep)| ep.clone())
            .filter(|ep| ep.eligible(cooldown))
            .collect();

        candidates.sort_by(|a, b| {
            a.avg_latency_ms
                .partial_cmp(&b.avg_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.success_rate.partial_cmp(&a.success_rate).unwrap())
        });
        candidates
    }

    /// Record the outcome of a completed call against one endpoint. Best-effort:
    /// a lost update can only misorder future selection, never produce an
    /// incorrect result.
    pub async fn record(&self, chain: &str, url: &str, success: bool, latency: Duration) {
        let success_rate = {
            let mut endpoints = self.endpoints.write().await;
            let ep = match endpoints.get_mut(&(chain.to_string(), url.to_string())) {
                Some(ep) => ep,
                None => return,
            };
            if success {
                ep.record_success(latency.as_secs_f64() * 1000.0);
                if ep.consecutive_failures == 0 {
                    ep.healthy = true;
                }
            } else {
                ep.record_failure();
            }
            ep.success_rate
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .rpc_endpoint_health_score
                .with_label_values(&[chain, url])
                .set(success_rate);
        }
    }

    pub async fn snapshot_all(&self, chain: &str) -> Vec<UpstreamEndpoint> {
        let endpoints = self.endpoints.read().await;
        endpoints
            .iter()
            .filter(|((c, _), _)| c == chain)
            .map(|(_, ep)| ep.clone())
            .collect()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_marked_unhealthy_after_threshold_failures() {
        let registry = EndpointRegistry::new();
        registry.register("ethereum", "http://a", None).await;

        for _ in 0..3 {
            registry.record("ethereum", "http://a", false, Duration::from_millis(10)).await;
        }

        let healthy = registry
            .snapshot_healthy("ethereum", Duration::from_secs(20))
            .await;
        assert!(healthy.is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_reenters_after_cooldown() {
        let registry = EndpointRegistry::new();
        registry.register("ethereum", "http://a", None).await;

        for _ in 0..3 {
            registry.record("ethereum", "http://a", false, Duration::from_millis(10)).await;
        }

        // Cooldown of zero always passes the elapsed check.
        let healthy = registry
            .snapshot_healthy("ethereum", Duration::from_secs(0))
            .await;
        assert_eq!(healthy.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_latency() {
        let registry = EndpointRegistry::new();
        registry.register("ethereum", "http://slow", None).await;
        registry.register("ethereum", "http://fast", None).await;

        registry
            .record("ethereum", "http://slow", true, Duration::from_millis(500))
            .await;
        registry
            .record("ethereum", "http://fast", true, Duration::from_millis(50))
            .await;

        let healthy = registry
            .snapshot_healthy("ethereum", Duration::from_secs(20))
            .await;
        assert_eq!(healthy[0].url, "http://fast");
        assert_eq!(healthy[1].url, "http://slow");
    }
}
