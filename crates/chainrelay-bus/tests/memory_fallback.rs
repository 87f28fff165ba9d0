//! Without Pub/Sub settings the factory's in-memory bus still carries events
//! from the publisher to a consumer in the same process.

use std::sync::Arc;
use std::time::Duration;

use chainrelay_bus::connect_bus;
use chainrelay_core::config::PubSubConfig;
use chainrelay_core::consumer::{ConsumerConfig, MemoryEventStore, MessageConsumer, UpsertHandler};
use chainrelay_core::event::{derive_event_id, CanonicalEvent, EventStatus};
use chainrelay_core::metrics::RelayMetrics;
use chainrelay_core::publisher::EventPublisher;
use tokio_util::sync::CancellationToken;

fn event(log_index: u32) -> CanonicalEvent {
    CanonicalEvent {
        event_id: derive_event_id(1, "0xbeef", log_index),
        event_type: "Funded".into(),
        command_id: "0xc0".into(),
        workflow_id: "0xescrow".into(),
        status: EventStatus::Received,
        payer: Some("0xaa".into()),
        payee: Some("0xbb".into()),
        amount: Some("100".into()),
        chain_id: 1,
        occurred_at: None,
        block_number: 101,
        tx_hash: "0xbeef".into(),
        log_index,
    }
}

#[tokio::test]
async fn publisher_to_consumer_through_factory_bus() {
    let handle = connect_bus(&PubSubConfig::default(), Duration::from_secs(1)).unwrap();
    let metrics = Arc::new(RelayMetrics::new());
    let publisher = EventPublisher::new(handle.bus.clone(), Duration::from_secs(1), metrics.clone());

    for i in 0..3 {
        publisher.publish(&event(i)).await.unwrap();
    }
    // A replayed range re-publishes the same ids.
    publisher.publish(&event(0)).await.unwrap();

    let store = Arc::new(MemoryEventStore::new());
    let consumer = MessageConsumer::new(
        handle.subscription.clone().unwrap(),
        store.clone(),
        Arc::new(UpsertHandler),
        metrics.clone(),
        ConsumerConfig::default(),
    );
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    for _ in 0..50 {
        if metrics.snapshot().events_consumed == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(store.len(), 3);
    assert_eq!(metrics.snapshot().events_published, 4);
}
