use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::json;

use super::{subscribe, ChainBackend, ChainKind, ChainStatus};
use crate::errors::GatewayError;
use crate::services::bus::{BlockEventBus, Subscription};
use crate::services::rpc::Racer;

const CALL_DEADLINE: Duration = Duration::from_secs(5);

pub struct EthereumBackend {
    chain_id: String,
    racer: Arc<Racer>,
    bus: Arc<BlockEventBus>,
}

impl EthereumBackend {
    pub fn new(chain_id: String, racer: Arc<Racer>, bus: Arc<BlockEventBus>) -> Self {
        Self { chain_id, racer, bus }
    }

    fn parse_hex_u64(value: &serde_json::Value) -> Option<u64> {
        let hex = value.as_str()?;
        u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok()
    }
}

#[async_trait]
impl ChainBackend for EthereumBackend {
    fn kind(&self) -> ChainKind {
        ChainKind::Ethereum
    }

    async fn latest_block(&self) -> Result<u64, GatewayError> {
        let result = self
            .racer
            .race(&self.chain_id, "eth_blockNumber", json!([]), CALL_DEADLINE)
            .await?;
        Self::parse_hex_u64(&result)
            .ok_or_else(|| GatewayError::Internal("eth_blockNumber did not return hex".to_string()))
    }

    async fn mempool_size(&self) -> Result<u64, GatewayError> {
        let result = self
            .racer
            .race(&self.chain_id, "txpool_status", json!([]), CALL_DEADLINE)
            .await?;
        let pending = result.get("pending").and_then(Self::parse_hex_u64).unwrap_or(0);
        let queued = result.get("queued").and_then(Self::parse_hex_u64).unwrap_or(0);
        Ok(pending + queued)
    }

    async fn status(&self) -> Result<ChainStatus, GatewayError> {
        Ok(ChainStatus {
            chain: self.chain_id.clone(),
            native_unit: self.kind().native_unit(),
            healthy_endpoints: self.racer.healthy_count(&self.chain_id).await,
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        Address::from_str(address).is_ok()
    }

    async fn stream_blocks(&self) -> Subscription {
        subscribe(&self.bus, &self.chain_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rpc::{EndpointRegistry, RacerConfig};
    use std::collections::HashMap;

    fn backend() -> EthereumBackend {
        let racer = Arc::new(Racer::new(Arc::new(EndpointRegistry::new()), HashMap::new(), RacerConfig::default()));
        let bus = Arc::new(crate::services::bus::BlockEventBus::new());
        EthereumBackend::new("ethereum".to_string(), racer, bus)
    }

    #[test]
    fn test_validate_address_rejects_short_hex() {
        let backend = backend();
        assert!(!backend.validate_address("0x1234"));
    }

    #[test]
    fn test_validate_address_accepts_checksum_address() {
        let backend = backend();
        assert!(backend.validate_address("0x0000000000000000000000000000000000dEaD"));
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(EthereumBackend::parse_hex_u64(&json!("0x10")), Some(16));
        assert_eq!(EthereumBackend::parse_hex_u64(&json!(10)), None);
    }
}
