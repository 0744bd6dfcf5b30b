use chain_gateway_core::services::bus::{BlockEvent, BlockEventBus, SubscriberKind, SubscriberQuota};

fn event(chain: &str, hash: &str, height: u64) -> BlockEvent {
    BlockEvent {
        chain: chain.to_string(),
        hash: hash.to_string(),
        height,
        source_timestamp_ms: 0,
        detected_at_ms: 0,
        tier_hint: None,
    }
}

#[tokio::test]
async fn test_quota_gated_subscribers_all_receive_published_blocks() {
    let bus = BlockEventBus::new();
    let quota = SubscriberQuota::new(10, 5, 5);

    let grant_a = quota.try_acquire("1.1.1.1", "bitcoin").await.expect("quota should admit first subscriber");
    let grant_b = quota.try_acquire("2.2.2.2", "bitcoin").await.expect("quota should admit second subscriber");

    let mut sub_a = bus.subscribe("bitcoin", SubscriberKind::Interactive).await;
    let mut sub_b = bus.subscribe("bitcoin", SubscriberKind::Interactive).await;

    bus.publish(event("bitcoin", "0xblock1", 100)).await;

    let received_a = sub_a.recv().await.expect("subscriber a should receive the block");
    let received_b = sub_b.recv().await.expect("subscriber b should receive the block");
    assert_eq!(received_a.hash, "0xblock1");
    assert_eq!(received_b.hash, "0xblock1");

    assert_eq!(bus.subscriber_count("bitcoin").await, 2);

    bus.unsubscribe("bitcoin", sub_a.id).await;
    assert_eq!(bus.subscriber_count("bitcoin").await, 1);

    drop(grant_a);
    drop(grant_b);
    bus.unsubscribe("bitcoin", sub_b.id).await;
    assert_eq!(bus.subscriber_count("bitcoin").await, 0);
}

#[tokio::test]
async fn test_per_chain_quota_exhaustion_is_isolated_per_chain() {
    let quota = SubscriberQuota::new(100, 100, 1);

    let grant = quota.try_acquire("3.3.3.3", "ethereum").await;
    assert!(grant.is_some());

    let second_same_chain = quota.try_acquire("4.4.4.4", "ethereum").await;
    assert!(second_same_chain.is_none(), "per-chain quota of 1 should reject a second subscriber");

    let other_chain = quota.try_acquire("5.5.5.5", "solana").await;
    assert!(other_chain.is_some(), "a different chain's quota should be unaffected");
}
