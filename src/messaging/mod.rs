//! Message broker seam
//!
//! The pipeline talks to the broker only through [`Broker`] and
//! [`BrokerChannel`]. Two implementations exist:
//!
//! - [`AmqpBroker`]: RabbitMQ over AMQP 0-9-1 (production)
//! - [`InMemoryBroker`]: in-process topic broker with the same ack/requeue
//!   semantics, used by tests and the local demo
//!
//! ```rust,no_run
//! use spinwire::messaging::{Broker, InMemoryBroker};
//! use std::sync::Arc;
//!
//! let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
//! ```

pub mod amqp;
pub mod consumer;
pub mod envelope;
pub mod memory;
pub mod publisher;
pub mod topology;

pub use amqp::AmqpBroker;
pub use consumer::{ConsumerState, EventConsumer};
pub use envelope::{EventEnvelope, EventPayload, EventType};
pub use memory::InMemoryBroker;
pub use publisher::{EventPublisher, PublishOutcome};
pub use topology::{QueueBinding, Topology};

use crate::errors::BrokerResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

/// Per-message publish options
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    /// Survive a broker restart (AMQP delivery mode 2)
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl PublishProperties {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A message handed to a consumer. Must be settled exactly once.
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Set when the broker has delivered this message before
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        routing_key: String,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            routing_key,
            payload,
            headers,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// An open channel on a broker connection.
///
/// Exchanges are always topic exchanges and queues are always durable.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()>;

    async fn declare_queue(&self, name: &str) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Cap on unacknowledged deliveries for consumers on this channel
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()>;

    /// Start consuming; the stream ends (after an error item) when the channel dies
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, BrokerResult<Delivery>>>;

    async fn close(&self) -> BrokerResult<()>;

    fn is_open(&self) -> bool;
}

/// Something that can open connections
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerChannel>>;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}
