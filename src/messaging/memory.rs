//! In-process implementation of the broker seam for tests and local runs
//!
//! Behaves like a single RabbitMQ node as far as the pipeline can observe:
//! durable topic exchanges and queues, per-channel prefetch, ack and
//! nack-with-requeue (requeued messages come back first, flagged
//! `redelivered`), and unacked messages requeued when their channel goes
//! away. Fault hooks let tests cut connections, take the broker down, fail
//! an acknowledgement, or restart the node.

use super::topology::topic_matches;
use super::{Broker, BrokerChannel, Delivery, DeliveryAcker, PublishProperties};
use crate::errors::{BrokerError, BrokerResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
    persistent: bool,
    redelivered: bool,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct ChannelSlot {
    prefetch: u16,
    in_flight: usize,
}

#[derive(Default)]
struct NodeState {
    down: bool,
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    bindings: Vec<(String, String, String)>,
    channels: HashMap<u64, ChannelSlot>,
    unacked: BTreeMap<u64, Unacked>,
    dead_letters: Vec<(String, Vec<u8>)>,
    next_channel: u64,
    next_tag: u64,
    fail_next_ack: bool,
    published: u64,
}

impl NodeState {
    /// Drop a channel and put its unacked messages back at the queue heads
    fn close_channel(&mut self, id: u64) {
        if self.channels.remove(&id).is_none() {
            return;
        }
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == id)
            .map(|(tag, _)| *tag)
            .collect();

        // Newest first so the oldest ends up at the very front
        for tag in tags.into_iter().rev() {
            if let Some(Unacked { queue, mut message, .. }) = self.unacked.remove(&tag) {
                message.redelivered = true;
                if let Some(q) = self.queues.get_mut(&queue) {
                    q.push_front(message);
                }
            }
        }
    }

    fn settle(&mut self, tag: u64) -> BrokerResult<Unacked> {
        let unacked = self.unacked.remove(&tag).ok_or(BrokerError::ChannelClosed)?;
        if let Some(slot) = self.channels.get_mut(&unacked.channel) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }
}

struct Node {
    state: Mutex<NodeState>,
    changed: Notify,
}

impl Node {
    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self) {
        self.changed.notify_waiters();
    }

    fn channel_state(&self, id: u64) -> BrokerResult<MutexGuard<'_, NodeState>> {
        let state = self.lock();
        if state.down || !state.channels.contains_key(&id) {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(state)
    }

    /// Next delivery for `queue` on channel `id`, or `None` if nothing is ready
    fn try_take(&self, id: u64, queue: &str) -> BrokerResult<Option<(u64, StoredMessage)>> {
        let mut state = self.channel_state(id)?;
        let state = &mut *state;

        let Some(slot) = state.channels.get_mut(&id) else {
            return Err(BrokerError::ChannelClosed);
        };
        if slot.prefetch > 0 && slot.in_flight >= slot.prefetch as usize {
            return Ok(None);
        }
        let Some(message) = state.queues.get_mut(queue).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };

        slot.in_flight += 1;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(
            tag,
            Unacked {
                channel: id,
                queue: queue.to_string(),
                message: message.clone(),
            },
        );
        Ok(Some((tag, message)))
    }
}

/// In-process topic broker
#[derive(Clone)]
pub struct InMemoryBroker {
    node: Arc<Node>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node {
                state: Mutex::new(NodeState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Close every open channel, as if the TCP connections dropped
    pub fn sever_connections(&self) {
        let mut state = self.node.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        drop(state);
        debug!("in-memory broker: all connections severed");
        self.node.wake();
    }

    /// Refuse (false) or accept (true) new connections; going down also
    /// severs existing ones
    pub fn set_available(&self, available: bool) {
        self.node.lock().down = !available;
        if !available {
            self.sever_connections();
        }
    }

    /// The next ack on any channel fails and takes its channel down
    pub fn fail_next_ack(&self) {
        self.node.lock().fail_next_ack = true;
    }

    /// Simulate a node restart: connections drop, transient messages are lost
    pub fn restart(&self) {
        self.sever_connections();
        let mut state = self.node.lock();
        for queue in state.queues.values_mut() {
            queue.retain(|m| m.persistent);
        }
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.node.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked_count(&self) -> usize {
        self.node.lock().unacked.len()
    }

    pub fn open_channels(&self) -> usize {
        self.node.lock().channels.len()
    }

    /// Messages nacked without requeue, as (routing key, body)
    pub fn dead_letters(&self) -> Vec<(String, Vec<u8>)> {
        self.node.lock().dead_letters.clone()
    }

    pub fn published_count(&self) -> u64 {
        self.node.lock().published
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let mut state = self.node.lock();
        if state.down {
            return Err(BrokerError::ConnectionFailed("broker unavailable".to_string()));
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(id, ChannelSlot::default());
        Ok(Box::new(MemoryChannel {
            node: self.node.clone(),
            id,
        }))
    }
}

struct MemoryChannel {
    node: Arc<Node>,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()> {
        self.node.channel_state(self.id)?.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        self.node
            .channel_state(self.id)?
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.node.channel_state(self.id)?;
        if !state.exchanges.contains(exchange) || !state.queues.contains_key(queue) {
            return Err(BrokerError::DeclareFailed(format!(
                "cannot bind {} to {}: not declared",
                queue, exchange
            )));
        }
        let binding = (exchange.to_string(), queue.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        let mut state = self.node.channel_state(self.id)?;
        if let Some(slot) = state.channels.get_mut(&self.id) {
            slot.prefetch = count;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()> {
        let mut state = self.node.channel_state(self.id)?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::PublishFailed(format!("no exchange '{}'", exchange)));
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(ex, _, pattern)| ex == exchange && topic_matches(pattern, routing_key))
            .map(|(_, queue, _)| queue.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let message = StoredMessage {
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            headers: properties.headers.clone(),
            persistent: properties.persistent,
            redelivered: false,
        };
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.push_back(message.clone());
            }
        }
        state.published += 1;
        drop(state);

        self.node.wake();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, BrokerResult<Delivery>>> {
        if !self.node.channel_state(self.id)?.queues.contains_key(queue) {
            return Err(BrokerError::ConsumeFailed(format!("no queue '{}'", queue)));
        }

        let node = self.node.clone();
        let id = self.id;
        let queue = queue.to_string();

        let deliveries = stream::unfold(false, move |finished| {
            let node = node.clone();
            let queue = queue.clone();
            async move {
                if finished {
                    return None;
                }
                loop {
                    let notified = node.changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    match node.try_take(id, &queue) {
                        Ok(Some((tag, message))) => {
                            let acker = MemoryAcker {
                                node: node.clone(),
                                tag,
                            };
                            let delivery = Delivery::new(
                                message.routing_key,
                                message.payload,
                                message.headers,
                                message.redelivered,
                                Box::new(acker),
                            );
                            return Some((Ok(delivery), false));
                        }
                        Ok(None) => notified.await,
                        Err(e) => return Some((Err(e), true)),
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.node.lock().close_channel(self.id);
        self.node.wake();
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.node.lock();
        !state.down && state.channels.contains_key(&self.id)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.node.lock().close_channel(self.id);
        self.node.wake();
    }
}

struct MemoryAcker {
    node: Arc<Node>,
    tag: u64,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        let mut state = self.node.lock();
        if state.fail_next_ack {
            state.fail_next_ack = false;
            let channel = state.unacked.get(&self.tag).map(|u| u.channel);
            if let Some(channel) = channel {
                state.close_channel(channel);
            }
            drop(state);
            self.node.wake();
            return Err(BrokerError::AckFailed("connection lost before ack".to_string()));
        }

        state.settle(self.tag)?;
        drop(state);
        self.node.wake();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        let mut state = self.node.lock();
        let Unacked { queue, mut message, .. } = state.settle(self.tag)?;
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.push_front(message);
            }
        } else {
            state.dead_letters.push((message.routing_key, message.payload));
        }
        drop(state);
        self.node.wake();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Topology;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn declared(broker: &InMemoryBroker) -> Box<dyn BrokerChannel> {
        let channel = broker.connect().await.unwrap();
        Topology::analytics().declare(channel.as_ref()).await.unwrap();
        channel
    }

    async fn next(stream: &mut BoxStream<'static, BrokerResult<Delivery>>) -> Delivery {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("delivery error")
    }

    #[tokio::test]
    async fn test_topic_routing() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker).await;
        let props = PublishProperties::persistent();

        channel.publish("gaming", "game.result", b"g", &props).await.unwrap();
        channel.publish("gaming", "payment.debit", b"p", &props).await.unwrap();
        channel.publish("gaming", "audit.log", b"x", &props).await.unwrap();

        assert_eq!(broker.queue_depth("analytics.game_results"), 1);
        assert_eq!(broker.queue_depth("analytics.payments"), 1);
        assert_eq!(broker.published_count(), 3);
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker).await;
        channel
            .publish("gaming", "game.result", b"m1", &PublishProperties::persistent())
            .await
            .unwrap();

        let mut stream = channel.consume("analytics.game_results", "t").await.unwrap();
        let first = next(&mut stream).await;
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert!(again.redelivered);
        assert_eq!(again.payload, b"m1".to_vec());
        again.ack().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("analytics.game_results"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker).await;
        channel.set_prefetch(2).await.unwrap();
        for i in 0..5u8 {
            channel
                .publish("gaming", "game.result", &[i], &PublishProperties::persistent())
                .await
                .unwrap();
        }

        let mut stream = channel.consume("analytics.game_results", "t").await.unwrap();
        let a = next(&mut stream).await;
        let _b = next(&mut stream).await;
        assert!(timeout(Duration::from_millis(50), stream.next()).await.is_err());

        a.ack().await.unwrap();
        let c = next(&mut stream).await;
        assert_eq!(c.payload, vec![2]);
    }

    #[tokio::test]
    async fn test_sever_requeues_unacked_and_ends_stream() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker).await;
        channel
            .publish("gaming", "game.result", b"m", &PublishProperties::persistent())
            .await
            .unwrap();

        let mut stream = channel.consume("analytics.game_results", "t").await.unwrap();
        let delivery = next(&mut stream).await;
        broker.sever_connections();

        let err = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(matches!(err, Some(Err(BrokerError::ChannelClosed))));
        assert!(stream.next().await.is_none());
        assert!(delivery.ack().await.is_err());
        assert!(!channel.is_open());
        assert_eq!(broker.queue_depth("analytics.game_results"), 1);
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        assert!(broker.connect().await.is_err());
        broker.set_available(true);
        assert!(broker.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_drops_transient_messages() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker).await;
        channel
            .publish("gaming", "game.result", b"keep", &PublishProperties::persistent())
            .await
            .unwrap();
        channel
            .publish("gaming", "game.result", b"lose", &PublishProperties::default())
            .await
            .unwrap();

        broker.restart();
        assert_eq!(broker.queue_depth("analytics.game_results"), 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker).await;
        channel
            .publish("gaming", "payment.credit", b"bad", &PublishProperties::persistent())
            .await
            .unwrap();

        let mut stream = channel.consume("analytics.payments", "t").await.unwrap();
        next(&mut stream).await.nack(false).await.unwrap();
        assert_eq!(broker.dead_letters(), vec![("payment.credit".to_string(), b"bad".to_vec())]);
        assert_eq!(broker.queue_depth("analytics.payments"), 0);
    }
}
