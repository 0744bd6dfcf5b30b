use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::errors::GatewayError;

/// Token bucket rate limiter, one instance per API key.
#[derive(Debug, Clone)]
pub struct TokenBucketRateLimiter {
    tokens_available: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill_at: Instant,
}

impl TokenBucketRateLimiter {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens_available: capacity,
            capacity,
            refill_rate,
            last_refill_at: Instant::now(),
        }
    }

    pub fn allow_request(&mut self) -> bool {
        self.refill();
        if self.tokens_available >= 1.0 {
            self.tokens_available -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill_at).as_secs_f64();
        let tokens_to_add = elapsed * self.refill_rate;
        self.tokens_available = (self.tokens_available + tokens_to_add).min(self.capacity);
        self.last_refill_at = now;
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens_available
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub rps: u32,
    pub max_concurrent: u32,
    pub cache_priority: u8,
    pub latency_target: Duration,
    pub monthly_quota: u64,
}

impl TierPolicy {
    pub const fn free() -> Self {
        Self {
            rps: 5,
            max_concurrent: 10,
            cache_priority: 1,
            latency_target: Duration::from_millis(500),
            monthly_quota: 100_000,
        }
    }

    pub const fn enterprise() -> Self {
        Self {
            rps: 200,
            max_concurrent: 500,
            cache_priority: 10,
            latency_target: Duration::from_millis(150),
            monthly_quota: 100_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub token: String,
    pub tier: String,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub request_count: u64,
}

impl ApiKey {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// External collaborator: resolves an opaque key to its tier. The gateway
/// never persists keys itself — storage is owned by the caller's
/// implementation of this trait.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<ApiKey>;
}

/// Draws from the OS RNG; returns the plaintext token once, stores only
/// its sha256 hash. Mirrors the teacher's webhook secret-key generation.
pub fn generate_admin_key() -> (String, String) {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.random()).collect();
    let token = hex::encode(&bytes);
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash = hex::encode(hasher.finalize());
    (token, hash)
}

/// Minimal in-memory `ApiKeyStore` for wiring the gateway without an
/// external key service. Not a persistence layer: state is lost on restart.
pub struct InMemoryApiKeyStore {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, token: String, tier: String) {
        let key = ApiKey {
            token: token.clone(),
            tier,
            created_at: Instant::now(),
            expires_at: None,
            request_count: 0,
        };
        self.keys.write().await.insert(token, key);
    }
}

impl Default for InMemoryApiKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn resolve(&self, token: &str) -> Option<ApiKey> {
        self.keys.read().await.get(token).cloned()
    }
}

struct ConcurrencySlot {
    inflight: AtomicU32,
    tier: String,
    metrics: Option<Arc<crate::services::metrics::MetricsRegistry>>,
}

impl ConcurrencySlot {
    fn report(&self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .admission_inflight
                .with_label_values(&[&self.tier])
                .set(self.inflight.load(Ordering::SeqCst) as f64);
        }
    }
}

/// C6 — admission gate. Validates the key, consumes a rate-limit token,
/// and enforces the tier's concurrency ceiling.
pub struct AdmissionGate {
    key_store: Arc<dyn ApiKeyStore>,
    policies: HashMap<String, TierPolicy>,
    buckets: RwLock<HashMap<String, TokenBucketRateLimiter>>,
    concurrency: RwLock<HashMap<String, Arc<ConcurrencySlot>>>,
    metrics: Option<Arc<crate::services::metrics::MetricsRegistry>>,
}

pub struct Admitted {
    pub tier: String,
    pub policy: TierPolicy,
    _permit: ConcurrencyPermit,
}

pub struct ConcurrencyPermit {
    slot: Arc<ConcurrencySlot>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.slot.inflight.fetch_sub(1, Ordering::SeqCst);
        self.slot.report();
    }
}

impl AdmissionGate {
    pub fn new(key_store: Arc<dyn ApiKeyStore>, policies: HashMap<String, TierPolicy>) -> Self {
        Self {
            key_store,
            policies,
            buckets: RwLock::new(HashMap::new()),
            concurrency: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<crate::services::metrics::MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn admit(&self, token: &str) -> Result<Admitted, GatewayError> {
        let key = self
            .key_store
            .resolve(token)
            .await
            .ok_or(GatewayError::Unauthorized)?;

        if key.is_expired(Instant::now()) {
            return Err(GatewayError::Unauthorized);
        }

        let policy = self
            .policies
            .get(&key.tier)
            .copied()
            .unwrap_or_else(TierPolicy::free);

        {
            let mut buckets = self.buckets.write().await;
            let bucket = buckets
                .entry(key.token.clone())
                .or_insert_with(|| TokenBucketRateLimiter::new(policy.rps as f64, policy.rps as f64));
            if !bucket.allow_request() {
                return Err(GatewayError::RateLimited { retry_after_ms: 1000 });
            }
        }

        let slot = {
            let mut concurrency = self.concurrency.read().await.get(&key.tier).cloned();
            if concurrency.is_none() {
                let mut concurrency_w = self.concurrency.write().await;
                let metrics = self.metrics.clone();
                let tier = key.tier.clone();
                concurrency = Some(
                    concurrency_w
                        .entry(key.tier.clone())
                        .or_insert_with(|| {
                            Arc::new(ConcurrencySlot {
                                inflight: AtomicU32::new(0),
                                tier,
                                metrics,
                            })
                        })
                        .clone(),
                );
            }
            concurrency.unwrap()
        };

        let current = slot.inflight.fetch_add(1, Ordering::SeqCst);
        if current >= policy.max_concurrent {
            slot.inflight.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::TierSaturated);
        }
        slot.report();

        Ok(Admitted {
            tier: key.tier,
            policy,
            _permit: ConcurrencyPermit { slot },
        })
    }
}
