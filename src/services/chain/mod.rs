pub mod bitcoin_chain;
pub mod ethereum_chain;
pub mod solana_chain;

pub use bitcoin_chain::BitcoinBackend;
pub use ethereum_chain::EthereumBackend;
pub use solana_chain::SolanaBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::GatewayError;
use crate::services::bus::{BlockEventBus, SubscriberKind, Subscription};
use crate::services::rpc::Racer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainKind {
    Bitcoin,
    Ethereum,
    Solana,
}

impl ChainKind {
    pub fn from_chain_id(chain: &str) -> Option<Self> {
        match chain {
            "bitcoin" => Some(Self::Bitcoin),
            "ethereum" => Some(Self::Ethereum),
            "solana" => Some(Self::Solana),
            _ => None,
        }
    }

    pub fn native_unit(&self) -> &'static str {
        match self {
            Self::Bitcoin => "BTC",
            Self::Ethereum => "ETH",
            Self::Solana => "SOL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub chain: String,
    pub native_unit: &'static str,
    pub healthy_endpoints: usize,
}

/// Narrow capability surface over a chain family. Validation, metadata, and
/// the live block feed only — no consensus logic lives behind this trait.
/// The pipeline and the stream handler depend on this trait; it never
/// depends back on them (§9's one-way dependency graph).
#[async_trait]
pub trait ChainBackend: Send + Sync {
    fn kind(&self) -> ChainKind;
    async fn latest_block(&self) -> Result<u64, GatewayError>;
    async fn mempool_size(&self) -> Result<u64, GatewayError>;
    async fn status(&self) -> Result<ChainStatus, GatewayError>;
    fn validate_address(&self, address: &str) -> bool;
    async fn stream_blocks(&self) -> Subscription;
}

pub fn build_backend(
    kind: ChainKind,
    chain_id: String,
    racer: Arc<Racer>,
    bus: Arc<BlockEventBus>,
) -> Box<dyn ChainBackend> {
    match kind {
        ChainKind::Bitcoin => Box::new(BitcoinBackend::new(chain_id, racer, bus)),
        ChainKind::Ethereum => Box::new(EthereumBackend::new(chain_id, racer, bus)),
        ChainKind::Solana => Box::new(SolanaBackend::new(chain_id, racer, bus)),
    }
}

/// Shared `stream_blocks` body: every backend just attaches to its own
/// chain topic on the bus as an interactive (small-queue) subscriber.
async fn subscribe(bus: &BlockEventBus, chain_id: &str) -> Subscription {
    bus.subscribe(chain_id, SubscriberKind::Interactive).await
}
