use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};

/// C9 — three layered, non-blocking semaphores. Acquire order is always
/// global -> per-IP -> per-chain; release is the reverse. A failed inner
/// acquire releases every outer permit already taken before returning.
pub struct SubscriberQuota {
    global: Arc<Semaphore>,
    per_ip: RwLock<HashMap<String, Arc<Semaphore>>>,
    per_chain: RwLock<HashMap<String, Arc<Semaphore>>>,
    per_ip_limit: usize,
    per_chain_limit: usize,
}

pub struct QuotaGrant {
    _global: tokio::sync::OwnedSemaphorePermit,
    _ip: tokio::sync::OwnedSemaphorePermit,
    _chain: tokio::sync::OwnedSemaphorePermit,
}

impl SubscriberQuota {
    pub fn new(global_limit: usize, per_ip_limit: usize, per_chain_limit: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_limit)),
            per_ip: RwLock::new(HashMap::new()),
            per_chain: RwLock::new(HashMap::new()),
            per_ip_limit,
            per_chain_limit,
        }
    }

    async fn semaphore_for(map: &RwLock<HashMap<String, Arc<Semaphore>>>, key: &str, limit: usize) -> Arc<Semaphore> {
        if let Some(sem) = map.read().await.get(key) {
            return sem.clone();
        }
        let mut write = map.write().await;
        write
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    /// Non-blocking. Returns `None` immediately if any layer is saturated,
    /// releasing any outer permits already acquired.
    pub async fn try_acquire(&self, ip: &str, chain: &str) -> Option<QuotaGrant> {
        let global_permit = match self.global.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return None,
        };

        let ip_sem = Self::semaphore_for(&self.per_ip, ip, self.per_ip_limit).await;
        let ip_permit = match ip_sem.try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                drop(global_permit);
                return None;
            }
        };

        let chain_sem = Self::semaphore_for(&self.per_chain, chain, self.per_chain_limit).await;
        let chain_permit = match chain_sem.try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                drop(ip_permit);
                drop(global_permit);
                return None;
            }
        };

        Some(QuotaGrant {
            _global: global_permit,
            _ip: ip_permit,
            _chain: chain_permit,
        })
    }
}
