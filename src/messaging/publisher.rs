//! Best-effort event publisher
//!
//! Publishing never fails the caller. A broken connection is dropped and the
//! in-flight message with it; the next call reconnects. Callers are
//! serialized on one channel so frames are never interleaved.

use super::{Broker, BrokerChannel, EventEnvelope, PublishProperties, Topology};
use crate::errors::{BrokerError, BrokerResult};
use crate::metrics::PipelineMetrics;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The broker was unreachable or the publish failed; the event is lost
    Dropped,
}

pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    topology: Topology,
    channel: Mutex<Option<Box<dyn BrokerChannel>>>,
    metrics: Arc<PipelineMetrics>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            broker,
            topology,
            channel: Mutex::new(None),
            metrics,
        }
    }

    pub async fn publish(&self, envelope: &EventEnvelope) -> PublishOutcome {
        let routing_key = envelope.event_type.routing_key();

        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = %envelope.event_id, routing_key, error = %e, "Dropping unencodable event");
                self.metrics.record_publish_failure();
                return PublishOutcome::Dropped;
            }
        };
        let properties = PublishProperties::persistent().with_headers(envelope.headers());

        let mut slot = self.channel.lock().await;
        match self.try_publish(&mut slot, routing_key, &payload, &properties).await {
            Ok(()) => {
                self.metrics.record_published();
                debug!(event_id = %envelope.event_id, routing_key, "Event published");
                PublishOutcome::Published
            }
            Err(e) => {
                warn!(
                    event_id = %envelope.event_id,
                    routing_key,
                    error = %e,
                    "Publish failed, event dropped; will reconnect on next publish"
                );
                *slot = None;
                self.metrics.record_publish_failure();
                PublishOutcome::Dropped
            }
        }
    }

    async fn try_publish(
        &self,
        slot: &mut Option<Box<dyn BrokerChannel>>,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()> {
        if !slot.as_ref().is_some_and(|channel| channel.is_open()) {
            *slot = None;
            let channel = self.broker.connect().await?;
            self.topology.declare(channel.as_ref()).await?;
            info!(exchange = %self.topology.exchange, "Publisher connected");
            *slot = Some(channel);
        }

        let channel = slot.as_ref().ok_or(BrokerError::ChannelClosed)?;
        channel
            .publish(&self.topology.exchange, routing_key, payload, properties)
            .await
    }

    /// Whether a channel is currently cached
    pub async fn is_connected(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Close the cached channel, if any
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing publisher channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::{GameResult, Symbol};
    use crate::messaging::InMemoryBroker;
    use crate::telemetry::TraceContext;

    fn envelope() -> EventEnvelope {
        EventEnvelope::game_result(
            GameResult {
                id: Some("g1".to_string()),
                user_id: "p1".to_string(),
                bet: 1.0,
                payout: 0.0,
                symbols: [Symbol::Cherry, Symbol::Lemon, Symbol::Cherry],
                timestamp: 1.0,
            },
            TraceContext::new(),
        )
    }

    fn publisher(broker: &InMemoryBroker) -> (EventPublisher, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let publisher = EventPublisher::new(
            Arc::new(broker.clone()),
            Topology::analytics(),
            metrics.clone(),
        );
        (publisher, metrics)
    }

    #[tokio::test]
    async fn test_lazy_connect_declares_topology() {
        let broker = InMemoryBroker::new();
        let (publisher, metrics) = publisher(&broker);
        assert!(!publisher.is_connected().await);

        assert_eq!(publisher.publish(&envelope()).await, PublishOutcome::Published);
        assert!(publisher.is_connected().await);
        assert_eq!(broker.queue_depth("analytics.game_results"), 1);
        assert_eq!(metrics.snapshot().events_published, 1);
    }

    #[tokio::test]
    async fn test_publish_survives_severed_connection() {
        let broker = InMemoryBroker::new();
        let (publisher, _) = publisher(&broker);
        publisher.publish(&envelope()).await;

        broker.sever_connections();
        assert_eq!(publisher.publish(&envelope()).await, PublishOutcome::Published);
        assert_eq!(broker.queue_depth("analytics.game_results"), 2);
    }

    #[tokio::test]
    async fn test_publish_drops_when_broker_down() {
        let broker = InMemoryBroker::new();
        let (publisher, metrics) = publisher(&broker);
        publisher.publish(&envelope()).await;

        broker.set_available(false);
        assert_eq!(publisher.publish(&envelope()).await, PublishOutcome::Dropped);
        assert!(!publisher.is_connected().await);
        assert_eq!(metrics.snapshot().publish_failures, 1);

        broker.set_available(true);
        assert_eq!(publisher.publish(&envelope()).await, PublishOutcome::Published);
    }
}
