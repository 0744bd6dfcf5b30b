use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max: u32,
}

impl BreakerPolicy {
    pub const fn free() -> Self {
        Self {
            threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max: 2,
        }
    }

    pub const fn enterprise() -> Self {
        Self {
            threshold: 10,
            reset_timeout: Duration::from_secs(5),
            half_open_max: 8,
        }
    }
}

struct BreakerCell {
    state: BreakerState,
    failures: u32,
    tripped_at: Option<Instant>,
    half_open_inflight: u32,
    policy: BreakerPolicy,
}

impl BreakerCell {
    fn new(policy: BreakerPolicy) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            tripped_at: None,
            half_open_inflight: 0,
            policy,
        }
    }

    /// Returns true if a probe may proceed (and, for half-open, reserves a
    /// probe slot that must be released via `on_success`/`on_failure`).
    fn admit(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now.duration_since(self.tripped_at.unwrap_or(now)) >= self.policy.reset_timeout {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_inflight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.half_open_inflight < self.policy.half_open_max {
                    self.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.failures = 0;
                self.half_open_inflight = 0;
                self.tripped_at = None;
            }
            BreakerState::Closed => {
                self.failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.policy.threshold {
                    self.state = BreakerState::Open;
                    self.tripped_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.tripped_at = Some(now);
                self.half_open_inflight = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn state(&self) -> BreakerState {
        self.state
    }
}

/// C5 — one breaker cell per (tier, chain). State transitions are serialized
/// per cell behind its own lock; no two cells ever share a critical section.
pub struct CircuitBreaker {
    cells: Mutex<HashMap<(String, String), BreakerCell>>,
    default_policy: BreakerPolicy,
}

impl CircuitBreaker {
    pub fn new(default_policy: BreakerPolicy) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            default_policy,
        }
    }

    fn key(tier: &str, chain: &str) -> (String, String) {
        (tier.to_string(), chain.to_string())
    }

    pub async fn register_policy(&self, tier: &str, chain: &str, policy: BreakerPolicy) {
        let mut cells = self.cells.lock().await;
        cells.insert(Self::key(tier, chain), BreakerCell::new(policy));
    }

    /// Runs `f` if the breaker admits the call, recording success/failure
    /// against the (tier, chain) cell. Short-circuits with `BreakerOpen`
    /// without ever invoking `f` if the breaker is closed for business.
    pub async fn call<F, Fut, T>(&self, tier: &str, chain: &str, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let key = Self::key(tier, chain);
        let admitted = {
            let mut cells = self.cells.lock().await;
            let cell = cells
                .entry(key.clone())
                .or_insert_with(|| BreakerCell::new(self.default_policy));
            cell.admit(Instant::now())
        };

        if !admitted {
            return Err(GatewayError::BreakerOpen);
        }

        let result = f().await;

        let mut cells = self.cells.lock().await;
        if let Some(cell) = cells.get_mut(&key) {
            match &result {
                Ok(_) => cell.on_success(),
                Err(_) => cell.on_failure(Instant::now()),
            }
        }
        result
    }

    pub async fn state(&self, tier: &str, chain: &str) -> Option<BreakerState> {
        let cells = self.cells.lock().await;
        cells.get(&Self::key(tier, chain)).map(|c| c.state())
    }
}
