pub mod fingerprint;
pub mod predictor;

pub use fingerprint::RequestFingerprint;
pub use predictor::{AccessHistory, FrequencyWeightedPredictor, PredictionEngine};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    last_access_at: Instant,
    access_count: u64,
    prediction: f64,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

/// C3 — Predictive Cache. Fingerprint-keyed, TTL from the prediction engine,
/// prediction-weighted eviction at capacity.
pub struct PredictiveCache {
    capacity: usize,
    min_ttl: Duration,
    max_ttl: Duration,
    predictor: Arc<dyn PredictionEngine>,
    entries: RwLock<HashMap<RequestFingerprint, CacheEntry>>,
    histories: RwLock<HashMap<RequestFingerprint, AccessHistory>>,
    metrics: Option<Arc<crate::services::metrics::MetricsRegistry>>,
}

pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
}

impl PredictiveCache {
    pub fn new(capacity: usize, min_ttl: Duration, max_ttl: Duration) -> Self {
        Self::with_predictor(capacity, min_ttl, max_ttl, Arc::new(FrequencyWeightedPredictor))
    }

    pub fn with_predictor(
        capacity: usize,
        min_ttl: Duration,
        max_ttl: Duration,
        predictor: Arc<dyn PredictionEngine>,
    ) -> Self {
        Self {
            capacity,
            min_ttl,
            max_ttl,
            predictor,
            entries: RwLock::new(HashMap::new()),
            histories: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<crate::services::metrics::MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Miss if absent or past TTL. A stale read racing with an expiry write
    /// is acceptable — it is resolved by treating the entry as absent here.
    pub async fn get(&self, fingerprint: &RequestFingerprint) -> Option<Value> {
        let now = Instant::now();
        let hit_value = {
            let entries = self.entries.read().await;
            match entries.get(fingerprint) {
                Some(entry) if !entry.expired(now) => Some(entry.value.clone()),
                _ => None,
            }
        };

        if hit_value.is_some() {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(fingerprint) {
                entry.last_access_at = now;
                entry.access_count += 1;
            }
            let mut histories = self.histories.write().await;
            histories.entry(fingerprint.clone()).or_default().record_access(now);
        }

        hit_value
    }

    pub async fn set(&self, fingerprint: RequestFingerprint, value: Value) {
        let now = Instant::now();
        let history_snapshot = {
            let histories = self.histories.read().await;
            histories.get(&fingerprint).cloned().unwrap_or_default()
        };
        let ttl = self
            .predictor
            .recommend_ttl(&history_snapshot, self.min_ttl, self.max_ttl);
        let prediction = self.predictor.predict_score(&history_snapshot);

        let len = {
            let mut entries = self.entries.write().await;
            if entries.len() >= self.capacity && !entries.contains_key(&fingerprint) {
                evict_one(&mut entries);
            }

            entries.insert(
                fingerprint,
                CacheEntry {
                    value,
                    created_at: now,
                    last_access_at: now,
                    access_count: 0,
                    prediction,
                    ttl,
                },
            );
            entries.len()
        };

        if let Some(metrics) = &self.metrics {
            metrics.cache_entries_total.with_label_values(&["predictive"]).set(len as f64);
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            len: entries.len(),
            capacity: self.capacity,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Canonical hot methods warmed per chain after a P99 violation. Small and
/// fixed rather than learned: the prediction engine decides TTL and eviction
/// priority for entries already in the cache, not which keys to pre-populate.
fn hot_methods_for(chain: &str) -> &'static [&'static str] {
    match chain {
        "bitcoin" => &["getblockcount", "getblockchaininfo"],
        "ethereum" => &["eth_blockNumber", "eth_gasPrice"],
        "solana" => &["getSlot", "getLatestBlockhash"],
        _ => &[],
    }
}

/// Adapts C4's `WarmTrigger` callback to C3's cache by racing the chain's
/// hot methods through the real Racer and storing whatever comes back.
/// Per §9 Open Questions, warming never synthesizes placeholder values.
pub struct CacheWarmer {
    cache: Arc<PredictiveCache>,
    racer: Arc<crate::services::rpc::Racer>,
    warm_deadline: Duration,
}

impl CacheWarmer {
    pub fn new(cache: Arc<PredictiveCache>, racer: Arc<crate::services::rpc::Racer>) -> Self {
        Self {
            cache,
            racer,
            warm_deadline: Duration::from_secs(2),
        }
    }
}

#[async_trait::async_trait]
impl crate::services::latency::WarmTrigger for CacheWarmer {
    async fn warm(&self, chain: &str) {
        for method in hot_methods_for(chain) {
            let params = serde_json::json!([]);
            let fingerprint = RequestFingerprint::new(chain, method, &params);
            match self.racer.race(chain, method, params, self.warm_deadline).await {
                Ok(value) => self.cache.set(fingerprint, value).await,
                Err(e) => {
                    tracing::debug!(chain, method, error = %e, "cache warm attempt failed");
                }
            }
        }
    }
}

/// Evict the entry with the lowest prediction score, tie-breaking on the
/// oldest last-access timestamp.
fn evict_one(entries: &mut HashMap<RequestFingerprint, CacheEntry>) {
    let victim = entries
        .iter()
        .min_by(|(_, a), (_, b)| {
            a.prediction
                .partial_cmp(&b.prediction)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.last_access_at.cmp(&b.last_access_at))
        })
        .map(|(k, _)| k.clone());

    if let Some(victim) = victim {
        entries.remove(&victim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(method: &str) -> RequestFingerprint {
        RequestFingerprint::new("ethereum", method, &json!([]))
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let cache = PredictiveCache::new(10, Duration::from_secs(1), Duration::from_secs(60));
        cache.set(fp("eth_blockNumber"), json!("0x10")).await;
        let value = cache.get(&fp("eth_blockNumber")).await;
        assert_eq!(value, Some(json!("0x10")));
    }

    #[tokio::test]
    async fn test_miss_on_absent_key() {
        let cache = PredictiveCache::new(10, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(cache.get(&fp("missing")).await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = PredictiveCache::new(10, Duration::from_millis(1), Duration::from_millis(1));
        cache.set(fp("eth_gasPrice"), json!("0x1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&fp("eth_gasPrice")).await, None);
    }

    #[tokio::test]
    async fn test_capacity_plus_one_evicts_exactly_one() {
        let cache = PredictiveCache::new(2, Duration::from_secs(60), Duration::from_secs(60));
        cache.set(fp("a"), json!(1)).await;
        cache.set(fp("b"), json!(2)).await;
        assert_eq!(cache.len().await, 2);
        cache.set(fp("c"), json!(3)).await;
        assert_eq!(cache.len().await, 2);
    }
}
