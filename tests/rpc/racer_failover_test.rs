use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use chain_gateway_core::services::rpc::{ChainConfig, EndpointRegistry, RacerConfig, Racer, UpstreamEndpointConfig};

use crate::common::{spawn_failing_rpc, spawn_mock_rpc};

fn endpoint_config(url: &str) -> UpstreamEndpointConfig {
    UpstreamEndpointConfig {
        url: url.to_string(),
        region: None,
        timeout_ms: 2000,
        auth: None,
    }
}

#[tokio::test]
async fn test_race_picks_the_healthy_endpoint_over_the_failing_one() {
    let (healthy_url, hits) = spawn_mock_rpc(json!(123)).await;
    let failing_url = spawn_failing_rpc().await;

    let registry = Arc::new(EndpointRegistry::new());
    registry.register("ethereum", &healthy_url, None).await;
    registry.register("ethereum", &failing_url, None).await;

    let mut chains = HashMap::new();
    chains.insert(
        "ethereum".to_string(),
        ChainConfig {
            chain: "ethereum".to_string(),
            endpoints: vec![endpoint_config(&healthy_url), endpoint_config(&failing_url)],
            health_check_interval_secs: 30,
            health_cooldown_secs: 20,
        },
    );

    let racer = Racer::new(registry, chains, RacerConfig::default());

    let result = racer
        .race("ethereum", "eth_blockNumber", json!([]), Duration::from_secs(2))
        .await
        .expect("race should succeed via the healthy endpoint");

    assert_eq!(result, json!(123));
    assert!(hits.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_repeated_failures_mark_an_endpoint_unhealthy() {
    let failing_url = spawn_failing_rpc().await;
    let registry = Arc::new(EndpointRegistry::new());
    registry.register("ethereum", &failing_url, None).await;

    let mut chains = HashMap::new();
    chains.insert(
        "ethereum".to_string(),
        ChainConfig {
            chain: "ethereum".to_string(),
            endpoints: vec![endpoint_config(&failing_url)],
            health_check_interval_secs: 30,
            health_cooldown_secs: 20,
        },
    );

    let racer = Racer::new(registry.clone(), chains, RacerConfig {
        retry_attempts: 1,
        ..RacerConfig::default()
    });

    for _ in 0..3 {
        let _ = racer
            .race("ethereum", "eth_blockNumber", json!([]), Duration::from_secs(2))
            .await;
    }

    assert_eq!(racer.healthy_count("ethereum").await, 0);
}
