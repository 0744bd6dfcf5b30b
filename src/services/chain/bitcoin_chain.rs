use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Address;
use serde_json::json;

use super::{subscribe, ChainBackend, ChainKind, ChainStatus};
use crate::errors::GatewayError;
use crate::services::bus::{BlockEventBus, Subscription};
use crate::services::rpc::Racer;

const CALL_DEADLINE: Duration = Duration::from_secs(5);

pub struct BitcoinBackend {
    chain_id: String,
    racer: Arc<Racer>,
    bus: Arc<BlockEventBus>,
}

impl BitcoinBackend {
    pub fn new(chain_id: String, racer: Arc<Racer>, bus: Arc<BlockEventBus>) -> Self {
        Self { chain_id, racer, bus }
    }
}

#[async_trait]
impl ChainBackend for BitcoinBackend {
    fn kind(&self) -> ChainKind {
        ChainKind::Bitcoin
    }

    async fn latest_block(&self) -> Result<u64, GatewayError> {
        let result = self
            .racer
            .race(&self.chain_id, "getblockcount", json!([]), CALL_DEADLINE)
            .await?;
        result
            .as_u64()
            .ok_or_else(|| GatewayError::Internal("getblockcount did not return an integer".to_string()))
    }

    async fn mempool_size(&self) -> Result<u64, GatewayError> {
        let result = self
            .racer
            .race(&self.chain_id, "getmempoolinfo", json!([]), CALL_DEADLINE)
            .await?;
        result
            .get("size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| GatewayError::Internal("getmempoolinfo missing size".to_string()))
    }

    async fn status(&self) -> Result<ChainStatus, GatewayError> {
        Ok(ChainStatus {
            chain: self.chain_id.clone(),
            native_unit: self.kind().native_unit(),
            healthy_endpoints: self.racer.healthy_count(&self.chain_id).await,
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        Address::from_str(address)
            .ok()
            .and_then(|unchecked| unchecked.require_network(bitcoin::Network::Bitcoin).ok())
            .is_some()
    }

    async fn stream_blocks(&self) -> Subscription {
        subscribe(&self.bus, &self.chain_id).await
    }
}
