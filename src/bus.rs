//! Message bus seam.
//!
//! The pipeline only depends on the [`BusConsumer`] trait; ordering,
//! partitioning, and redelivery are bus guarantees, not pipeline logic.
//! [`ChannelBus`] is the in-process implementation used for local runs
//! (fed by the feed fetcher task) and for tests. It records acks so the
//! ack-after-buffering ordering can be asserted; a message that is never
//! acked is a redelivery candidate for the real bus.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// One bus delivery. The payload is the JSON feed envelope published by
/// the upstream fetcher.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: u64,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait BusConsumer: Send {
    /// Waits for the next delivery; `None` means the subscription closed.
    async fn next(&mut self) -> Option<BusMessage>;

    /// Acknowledges a delivery. Unacked messages are redelivered (or
    /// dead-lettered) per the bus's own policy.
    async fn ack(&mut self, message: &BusMessage);
}

/// Creates a bounded in-process bus partition.
pub fn channel_bus(capacity: usize) -> (BusPublisher, ChannelBus) {
    let (tx, rx) = mpsc::channel(capacity);
    let acked = Arc::new(Mutex::new(Vec::new()));
    (
        BusPublisher {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        ChannelBus { rx, acked },
    )
}

#[derive(Clone)]
pub struct BusPublisher {
    tx: mpsc::Sender<BusMessage>,
    next_id: Arc<AtomicU64>,
}

impl BusPublisher {
    /// Publishes one payload; fails when the consumer side is gone.
    pub async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(BusMessage { id, payload })
            .await
            .map_err(|_| anyhow::anyhow!("bus consumer dropped"))?;
        Ok(id)
    }
}

pub struct ChannelBus {
    rx: mpsc::Receiver<BusMessage>,
    acked: Arc<Mutex<Vec<u64>>>,
}

impl ChannelBus {
    /// Shared view of acknowledged message ids, in ack order.
    pub fn ack_log(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.acked)
    }
}

#[async_trait]
impl BusConsumer for ChannelBus {
    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    async fn ack(&mut self, message: &BusMessage) {
        trace!(message_id = message.id, "Message acked");
        self.acked.lock().expect("ack log poisoned").push(message.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_consume_ack_roundtrip() {
        let (publisher, mut bus) = channel_bus(8);
        let ack_log = bus.ack_log();

        let id = publisher.publish(b"{}".to_vec()).await.unwrap();
        let msg = bus.next().await.unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.payload, b"{}");

        assert!(ack_log.lock().unwrap().is_empty());
        bus.ack(&msg).await;
        assert_eq!(*ack_log.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_next_returns_none_when_publisher_dropped() {
        let (publisher, mut bus) = channel_bus(8);
        publisher.publish(b"a".to_vec()).await.unwrap();
        drop(publisher);

        assert!(bus.next().await.is_some());
        assert!(bus.next().await.is_none());
    }
}
