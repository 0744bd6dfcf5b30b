use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

const RING_CAPACITY: usize = 1000;
const MIN_SAMPLES_FOR_P99: usize = 10;
const DEFAULT_TARGET_P99_MS: u64 = 100;
const VIOLATION_HYSTERESIS: u32 = 5;
const ADAPTIVE_SHRINK_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerStatus {
    WarmingUp,
    Nominal,
    Degraded,
}

/// C4 — per-chain rolling P99 tracker. Drives cache warming and the
/// adaptive racer deadline.
struct LatencyTracker {
    samples: VecDeque<Duration>,
    current_p99: Option<Duration>,
    violations: u32,
    adaptations: u32,
    adaptive_deadline: Duration,
    min_deadline: Duration,
    target_p99: Duration,
}

impl LatencyTracker {
    fn new(base_deadline: Duration, min_deadline: Duration, target_p99: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(RING_CAPACITY),
            current_p99: None,
            violations: 0,
            adaptations: 0,
            adaptive_deadline: base_deadline,
            min_deadline,
            target_p99,
        }
    }

    fn record(&mut self, latency: Duration) -> bool {
        if self.samples.len() >= RING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);

        if self.samples.len() < MIN_SAMPLES_FOR_P99 {
            return false;
        }

        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = ((0.99 * sorted.len() as f64).ceil() as usize).saturating_sub(1);
        let p99 = sorted[idx.min(sorted.len() - 1)];
        self.current_p99 = Some(p99);

        if p99 > self.target_p99 {
            self.violations += 1;
        } else {
            self.violations = 0;
        }

        if self.violations > VIOLATION_HYSTERESIS {
            self.adapt();
            self.violations = 0;
            return true;
        }
        false
    }

    fn adapt(&mut self) {
        let shrunk = Duration::from_secs_f64(self.adaptive_deadline.as_secs_f64() * ADAPTIVE_SHRINK_FACTOR);
        self.adaptive_deadline = shrunk.max(self.min_deadline);
        self.adaptations += 1;
    }

    fn status(&self) -> TrackerStatus {
        if self.samples.len() < MIN_SAMPLES_FOR_P99 {
            TrackerStatus::WarmingUp
        } else if self.violations > 0 {
            TrackerStatus::Degraded
        } else {
            TrackerStatus::Nominal
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    pub chain: String,
    pub status: TrackerStatus,
    pub current_p99_ms: Option<u64>,
    pub sample_count: usize,
    pub violations: u32,
    pub adaptations: u32,
    pub adaptive_deadline_ms: u64,
}

/// Callback the controller invokes when a chain crosses the violation
/// hysteresis threshold. Wired to `PredictiveCache::warm` in the pipeline.
#[async_trait::async_trait]
pub trait WarmTrigger: Send + Sync {
    async fn warm(&self, chain: &str);
}

pub struct LatencyController {
    trackers: RwLock<HashMap<String, LatencyTracker>>,
    base_deadline: Duration,
    min_deadline: Duration,
    target_p99: Duration,
    warm_trigger: Option<Arc<dyn WarmTrigger>>,
    metrics: Option<Arc<crate::services::metrics::MetricsRegistry>>,
}

impl LatencyController {
    pub fn new(base_deadline: Duration, min_deadline: Duration) -> Self {
        Self {
            trackers: RwLock::new(HashMap::new()),
            base_deadline,
            min_deadline,
            target_p99: Duration::from_millis(DEFAULT_TARGET_P99_MS),
            warm_trigger: None,
            metrics: None,
        }
    }

    pub fn with_warm_trigger(mut self, trigger: Arc<dyn WarmTrigger>) -> Self {
        self.warm_trigger = Some(trigger);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<crate::services::metrics::MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn record(&self, chain: &str, latency: Duration) {
        let (should_warm, current_p99_ms) = {
            let mut trackers = self.trackers.write().await;
            let tracker = trackers.entry(chain.to_string()).or_insert_with(|| {
                LatencyTracker::new(self.base_deadline, self.min_deadline, self.target_p99)
            });
            let should_warm = tracker.record(latency);
            (should_warm, tracker.current_p99.map(|d| d.as_millis() as f64))
        };

        if let Some(metrics) = &self.metrics {
            if let Some(p99_ms) = current_p99_ms {
                metrics.latency_p99_ms.with_label_values(&[chain]).set(p99_ms);
            }
            if should_warm {
                metrics.latency_adaptations_total.with_label_values(&[chain]).inc();
            }
        }

        if should_warm {
            if let Some(trigger) = &self.warm_trigger {
                trigger.warm(chain).await;
            }
        }
    }

    pub async fn adaptive_deadline(&self, chain: &str) -> Duration {
        let trackers = self.trackers.read().await;
        trackers
            .get(chain)
            .map(|t| t.adaptive_deadline)
            .unwrap_or(self.base_deadline)
    }

    pub async fn snapshot(&self, chain: &str) -> Option<LatencySnapshot> {
        let trackers = self.trackers.read().await;
        trackers.get(chain).map(|t| LatencySnapshot {
            chain: chain.to_string(),
            status: t.status(),
            current_p99_ms: t.current_p99.map(|d| d.as_millis() as u64),
            sample_count: t.samples.len(),
            violations: t.violations,
            adaptations: t.adaptations,
            adaptive_deadline_ms: t.adaptive_deadline.as_millis() as u64,
        })
    }

    pub async fn snapshot_all(&self) -> Vec<LatencySnapshot> {
        let trackers = self.trackers.read().await;
        trackers
            .iter()
            .map(|(chain, t)| LatencySnapshot {
                chain: chain.clone(),
                status: t.status(),
                current_p99_ms: t.current_p99.map(|d| d.as_millis() as u64),
                sample_count: t.samples.len(),
                violations: t.violations,
                adaptations: t.adaptations,
                adaptive_deadline_ms: t.adaptive_deadline.as_millis() as u64,
            })
            .collect()
    }
}
