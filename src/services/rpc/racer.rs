use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use super::config::{ChainConfig, RacerConfig, RpcAuth};
use super::health::EndpointRegistry;
use crate::errors::GatewayError;

/// C2 — RPC Racer. Fans a single logical call out to the N fastest healthy
/// endpoints for a chain and returns the first successful response.
pub struct Racer {
    client: reqwest::Client,
    registry: Arc<EndpointRegistry>,
    chains: std::collections::HashMap<String, ChainConfig>,
    config: RacerConfig,
}

struct AttemptOutcome {
    url: String,
    started_at: Instant,
    result: Result<Value, String>,
}

impl Racer {
    /// Count of endpoints currently eligible for `chain` (healthy, or
    /// unhealthy-past-cooldown). Used by the chain capability layer's
    /// status surface; does not perform any network I/O.
    pub async fn healthy_count(&self, chain: &str) -> usize {
        match self.chains.get(chain) {
            Some(chain_config) => {
                let cooldown = Duration::from_secs(chain_config.health_cooldown_secs);
                self.registry.snapshot_healthy(chain, cooldown).await.len()
            }
            None => 0,
        }
    }

    /// C1's background prober. Independent of live traffic: issues a cheap
    /// chain-specific probe against every configured endpoint on a fixed
    /// interval and feeds the outcome into `EndpointRegistry::record`, the
    /// same sink the racer's own completed calls write through. Runs until
    /// the process exits; intended to be spawned once from `build_state`.
    pub async fn run_health_prober(&self) {
        if self.chains.is_empty() {
            return;
        }
        let interval = self
            .chains
            .values()
            .map(|c| c.health_check_interval_secs)
            .min()
            .unwrap_or(30);

        loop {
            for (chain, chain_config) in &self.chains {
                let method = probe_method(chain);
                for endpoint in &chain_config.endpoints {
                    let started_at = Instant::now();
                    let outcome = execute_call(
                        &self.client,
                        &endpoint.url,
                        method,
                        &json!([]),
                        endpoint.auth.as_ref(),
                        Duration::from_millis(endpoint.timeout_ms),
                        self.config.max_response_bytes,
                    )
                    .await;
                    let latency = started_at.elapsed();
                    self.registry
                        .record(chain, &endpoint.url, outcome.is_ok(), latency)
                        .await;
                }
            }

            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }

    pub fn new(
        registry: Arc<EndpointRegistry>,
        chains: std::collections::HashMap<String, ChainConfig>,
        config: RacerConfig,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            registry,
            chains,
            config,
        }
    }

    /// Execute `method(params)` against `chain`, returning the first successful
    /// upstream response or the most descriptive error if every attempt fails.
    pub async fn race(
        &self,
        chain: &str,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, GatewayError> {
        let chain_config = self
            .chains
            .get(chain)
            .ok_or_else(|| GatewayError::ChainUnsupported(chain.to_string()))?;

        let cooldown = Duration::from_secs(chain_config.health_cooldown_secs);
        let candidates = self.registry.snapshot_healthy(chain, cooldown).await;

        if candidates.is_empty() {
            return Err(GatewayError::UpstreamFailed(
                "no healthy endpoints available".to_string(),
            ));
        }

        let chosen: Vec<_> = candidates
            .into_iter()
            .take(self.config.max_concurrent_races)
            .collect();

        let mut join_set: JoinSet<AttemptOutcome> = JoinSet::new();
        for endpoint in &chosen {
            let url = endpoint.url.clone();
            let auth = chain_config
                .endpoints
                .iter()
                .find(|e| e.url == url)
                .and_then(|e| e.auth.clone());
            let timeout_ms = chain_config
                .endpoints
                .iter()
                .find(|e| e.url == url)
                .map(|e| e.timeout_ms)
                .unwrap_or(5000);

            let client = self.client.clone();
            let method = method.to_string();
            let params = params.clone();
            let retry_attempts = self.config.retry_attempts;
            let backoff_base_ms = self.config.backoff_base_ms;
            let backoff_cap_ms = self.config.backoff_cap_ms;
            let max_response_bytes = self.config.max_response_bytes;

            join_set.spawn(async move {
                let started_at = Instant::now();
                let result = attempt_with_retry(
                    &client,
                    &url,
                    &method,
                    params,
                    auth.as_ref(),
                    Duration::from_millis(timeout_ms),
                    retry_attempts,
                    backoff_base_ms,
                    backoff_cap_ms,
                    max_response_bytes,
                )
                .await;
                AttemptOutcome {
                    url,
                    started_at,
                    result,
                }
            });
        }

        let race_result = tokio::time::timeout(deadline, async {
            let mut last_err: Option<String> = None;
            while let Some(joined) = join_set.join_next().await {
                let outcome = match joined {
                    Ok(o) => o,
                    Err(_) => continue, // task panicked or was aborted
                };
                let latency = outcome.started_at.elapsed();
                match outcome.result {
                    Ok(value) => {
                        self.registry
                            .record(chain, &outcome.url, true, latency)
                            .await;
                        join_set.abort_all();
                        return Ok(value);
                    }
                    Err(e) => {
                        self.registry
                            .record(chain, &outcome.url, false, latency)
                            .await;
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| "all endpoints failed".to_string()))
        })
        .await;

        match race_result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GatewayError::UpstreamFailed(e)),
            Err(_) => {
                join_set.abort_all();
                Err(GatewayError::DeadlineExceeded)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn attempt_with_retry(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
    auth: Option<&RpcAuth>,
    timeout: Duration,
    retry_attempts: u32,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
    max_response_bytes: usize,
) -> Result<Value, String> {
    let mut last_err = String::new();
    for attempt in 0..retry_attempts.max(1) {
        match execute_call(client, url, method, &params, auth, timeout, max_response_bytes).await
        {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = e;
                if attempt + 1 < retry_attempts {
                    tokio::time::sleep(backoff(attempt, backoff_base_ms, backoff_cap_ms)).await;
                }
            }
        }
    }
    Err(last_err)
}

async fn execute_call(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: &Value,
    auth: Option<&RpcAuth>,
    timeout: Duration,
    max_response_bytes: usize,
) -> Result<Value, String> {
    let payload = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1
    });

    let mut request = client.post(url).json(&payload).timeout(timeout);
    request = match auth {
        Some(RpcAuth::ApiKey { key }) => request.header("X-API-Key", key),
        Some(RpcAuth::Bearer { token }) => request.bearer_auth(token),
        Some(RpcAuth::Basic { username, password }) => {
            request.basic_auth(username, Some(password))
        }
        None => request,
    };

    let response = request.send().await.map_err(|e| format!("transport error: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("http status {status}"));
    }

    let body = read_bounded(response, max_response_bytes).await?;
    let parsed: RpcResponse = serde_json::from_slice(&body).map_err(|e| format!("parse error: {e}"))?;

    if let Some(err) = parsed.error {
        return Err(format!("rpc error: {}", err.message));
    }
    parsed.result.ok_or_else(|| "missing result".to_string())
}

/// Read the response body, rejecting it the instant it exceeds `max_bytes`
/// (read N+1 bytes, not N+epsilon) rather than buffering the whole thing first.
async fn read_bounded(response: reqwest::Response, max_bytes: usize) -> Result<Vec<u8>, String> {
    let mut buf = Vec::with_capacity(max_bytes.min(64 * 1024));
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("transport error: {e}"))?;
        buf.extend_from_slice(&chunk);
        if buf.len() > max_bytes {
            return Err("response exceeded max_response_bytes".to_string());
        }
    }
    Ok(buf)
}

/// Cheapest call per chain family that proves liveness, matching §4.1's own
/// examples (`eth_blockNumber`, `getSlot`).
fn probe_method(chain: &str) -> &'static str {
    match chain {
        "bitcoin" => "getblockcount",
        "solana" => "getSlot",
        _ => "eth_blockNumber",
    }
}

fn backoff(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt)).min(cap_ms);
    let jitter = rand::random::<f64>() * 0.4 - 0.2; // ±20%
    let final_ms = (delay_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(final_ms)
}

#[derive(serde::Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObj>,
}

#[derive(serde::Deserialize)]
struct RpcErrorObj {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_method_per_chain_family() {
        assert_eq!(probe_method("bitcoin"), "getblockcount");
        assert_eq!(probe_method("ethereum"), "eth_blockNumber");
        assert_eq!(probe_method("solana"), "getSlot");
    }

    #[tokio::test]
    async fn test_health_prober_is_a_no_op_with_no_configured_chains() {
        let registry = Arc::new(EndpointRegistry::new());
        let racer = Racer::new(registry, std::collections::HashMap::new(), RacerConfig::default());
        // Returns immediately instead of looping forever when there is
        // nothing to probe.
        tokio::time::timeout(Duration::from_millis(100), racer.run_health_prober())
            .await
            .expect("prober should return for an empty chain map");
    }

    #[test]
    fn test_backoff_bounds() {
        for attempt in 0..6 {
            let d = backoff(attempt, 50, 750);
            assert!(d.as_millis() <= 750 + 150); // cap plus jitter headroom
        }
    }

    #[tokio::test]
    async fn test_race_with_zero_healthy_endpoints_skips_network() {
        let registry = Arc::new(EndpointRegistry::new());
        let mut chains = std::collections::HashMap::new();
        chains.insert(
            "ethereum".to_string(),
            ChainConfig {
                chain: "ethereum".to_string(),
                endpoints: vec![],
                health_check_interval_secs: 30,
                health_cooldown_secs: 20,
            },
        );
        let racer = Racer::new(registry, chains, RacerConfig::default());
        let result = racer
            .race("ethereum", "eth_blockNumber", json!([]), Duration::from_millis(500))
            .await;
        assert!(matches!(result, Err(GatewayError::UpstreamFailed(_))));
    }

    #[tokio::test]
    async fn test_race_unsupported_chain() {
        let registry = Arc::new(EndpointRegistry::new());
        let chains = std::collections::HashMap::new();
        let racer = Racer::new(registry, chains, RacerConfig::default());
        let result = racer
            .race("dogecoin", "getblockcount", json!([]), Duration::from_millis(500))
            .await;
        assert!(matches!(result, Err(GatewayError::ChainUnsupported(_))));
    }
}
