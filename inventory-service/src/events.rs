use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::ReservationEvent;
use tracing::{error, info};

/// Outbound message transport.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: String) -> Result<()>;
}

pub struct KafkaSink {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn send(&self, topic: &str, key: &str, payload: String) -> Result<()> {
        let record = FutureRecord::to(topic).payload(&payload).key(key);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send message to {}: {}", topic, e))?;

        Ok(())
    }
}

/// Publishes reservation lifecycle events after their transition committed.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn MessageSink>,
    topic: String,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn MessageSink>, topic: impl Into<String>) -> Self {
        Self {
            sink,
            topic: topic.into(),
        }
    }

    /// The transition is already durable, so a failed publish is logged and
    /// not returned.
    pub async fn publish(&self, event: ReservationEvent) {
        let name = event.name();
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(event = name, reservation_id = %event.reservation_id, "Failed to serialize event: {}", e);
                return;
            }
        };

        let key = event.item_id.to_string();
        match self.sink.send(&self.topic, &key, payload).await {
            Ok(()) => info!(
                event = name,
                reservation_id = %event.reservation_id,
                item_id = %event.item_id,
                "Published reservation event"
            ),
            Err(e) => error!(
                event = name,
                reservation_id = %event.reservation_id,
                "Failed to publish reservation event: {}",
                e
            ),
        }
    }
}
