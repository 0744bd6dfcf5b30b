use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;

use super::{subscribe, ChainBackend, ChainKind, ChainStatus};
use crate::errors::GatewayError;
use crate::services::bus::{BlockEventBus, Subscription};
use crate::services::rpc::Racer;

const CALL_DEADLINE: Duration = Duration::from_secs(5);

pub struct SolanaBackend {
    chain_id: String,
    racer: Arc<Racer>,
    bus: Arc<BlockEventBus>,
}

impl SolanaBackend {
    pub fn new(chain_id: String, racer: Arc<Racer>, bus: Arc<BlockEventBus>) -> Self {
        Self { chain_id, racer, bus }
    }
}

#[async_trait]
impl ChainBackend for SolanaBackend {
    fn kind(&self) -> ChainKind {
        ChainKind::Solana
    }

    async fn latest_block(&self) -> Result<u64, GatewayError> {
        let result = self
            .racer
            .race(&self.chain_id, "getSlot", json!([]), CALL_DEADLINE)
            .await?;
        result
            .as_u64()
            .ok_or_else(|| GatewayError::Internal("getSlot did not return an integer".to_string()))
    }

    async fn mempool_size(&self) -> Result<u64, GatewayError> {
        // Solana has no public mempool concept exposed over JSON-RPC.
        Ok(0)
    }

    async fn status(&self) -> Result<ChainStatus, GatewayError> {
        Ok(ChainStatus {
            chain: self.chain_id.clone(),
            native_unit: self.kind().native_unit(),
            healthy_endpoints: self.racer.healthy_count(&self.chain_id).await,
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        Pubkey::from_str(address).is_ok()
    }

    async fn stream_blocks(&self) -> Subscription {
        subscribe(&self.bus, &self.chain_id).await
    }
}
