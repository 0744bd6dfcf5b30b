use serde::{Deserialize, Serialize};

/// Upstream endpoint configuration for one chain, ordered by preference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain: String,
    pub endpoints: Vec<UpstreamEndpointConfig>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_cooldown")]
    pub health_cooldown_secs: u64,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_cooldown() -> u64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEndpointConfig {
    pub url: String,
    pub region: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub auth: Option<RpcAuth>,
}

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcAuth {
    ApiKey { key: String },
    Bearer { token: String },
    Basic { username: String, password: String },
}

/// Tunables for the racer (§4.2), shared across chains unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RacerConfig {
    #[serde(default = "default_max_concurrent_races")]
    pub max_concurrent_races: usize,
    #[serde(default = "default_race_timeout_ms")]
    pub race_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_max_concurrent_races() -> usize {
    3
}
fn default_race_timeout_ms() -> u64 {
    2000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_max_response_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_backoff_base_ms() -> u64 {
    50
}
fn default_backoff_cap_ms() -> u64 {
    750
}

impl Default for RacerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_races: default_max_concurrent_races(),
            race_timeout_ms: default_race_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            max_response_bytes: default_max_response_bytes(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// Load the per-chain endpoint map from a JSON file with `${VAR}` environment
/// variable substitution, matching the teacher's config-loading idiom.
pub fn load_chain_configs(
    path: &str,
) -> Result<std::collections::HashMap<String, ChainConfig>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let content = substitute_env_vars(&content);
    let configs: std::collections::HashMap<String, ChainConfig> = serde_json::from_str(&content)?;
    Ok(configs)
}

/// Substitute `${VAR_NAME}` with environment variable values.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&format!("${{{}}}", var_name), &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("GATEWAY_TEST_VAR", "test_value");
        let input = r#"{"url": "${GATEWAY_TEST_VAR}"}"#;
        let output = substitute_env_vars(input);
        assert_eq!(output, r#"{"url": "test_value"}"#);
    }

    #[test]
    fn test_racer_config_defaults() {
        let cfg = RacerConfig::default();
        assert_eq!(cfg.max_concurrent_races, 3);
        assert_eq!(cfg.max_response_bytes, 2 * 1024 * 1024);
    }
}
