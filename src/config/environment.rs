use std::env;
use std::time::Duration;

/// Process-wide configuration sourced from the environment. The endpoint
/// map itself lives in a JSON file (see `services::rpc::config`); this
/// covers the options §6 of the gateway's requirements calls "recognized".
pub struct GatewayConfig {
    pub chain_config_path: String,
    pub bind_addr: String,
    pub subscriber_quota_global: usize,
    pub subscriber_quota_per_ip: usize,
    pub subscriber_quota_per_chain: usize,
    pub cache_capacity: usize,
    pub cache_min_ttl: Duration,
    pub cache_max_ttl: Duration,
    pub metrics_enabled: bool,
    pub global_rate_limit_burst: u32,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let chain_config_path = env::var("CHAIN_CONFIG_PATH")
            .unwrap_or_else(|_| "chains.json".to_string());

        let bind_addr = env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let subscriber_quota_global = parse_env_or("SUBSCRIBER_QUOTA_GLOBAL", 10_000)?;
        let subscriber_quota_per_ip = parse_env_or("SUBSCRIBER_QUOTA_PER_IP", 20)?;
        let subscriber_quota_per_chain = parse_env_or("SUBSCRIBER_QUOTA_PER_CHAIN", 2_000)?;

        let cache_capacity = parse_env_or("CACHE_CAPACITY", 10_000)?;
        let cache_min_ttl_secs: u64 = parse_env_or("CACHE_MIN_TTL_SECS", 1)?;
        let cache_max_ttl_secs: u64 = parse_env_or("CACHE_MAX_TTL_SECS", 600)?;

        let metrics_enabled = env::var("METRICS_ENABLED")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let global_rate_limit_burst = parse_env_or("GLOBAL_RATE_LIMIT_BURST", 500)?;

        Ok(Self {
            chain_config_path,
            bind_addr,
            subscriber_quota_global,
            subscriber_quota_per_ip,
            subscriber_quota_per_chain,
            cache_capacity,
            cache_min_ttl: Duration::from_secs(cache_min_ttl_secs),
            cache_max_ttl: Duration::from_secs(cache_max_ttl_secs),
            metrics_enabled,
            global_rate_limit_burst,
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}
