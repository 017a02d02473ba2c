//! Analytics event consumer
//!
//! Runs a background consume loop with its own broker connection:
//!
//! ```text
//! Stopped -> Connecting -> Consuming -> (error) Reconnecting -> Connecting -> ...
//!                                   \-> (stop) Stopped
//! ```
//!
//! A message is acked only after its rollup update has committed. Failures
//! are nacked with requeue until the same body has failed
//! `max_redeliveries` times, after which it is rejected without requeue.

use super::{Broker, BrokerChannel, Delivery, EventEnvelope, Topology};
use crate::analytics::Aggregator;
use crate::config::ConsumerConfig;
use crate::errors::{BrokerError, BrokerResult, GameError, SpinwireError, SpinwireResult};
use crate::metrics::PipelineMetrics;
use crate::telemetry::{TraceContext, TraceSink};
use futures::stream::{self, StreamExt};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Connecting,
    Consuming,
    Reconnecting,
}

type Fingerprint = [u8; 32];

struct Worker {
    broker: Arc<dyn Broker>,
    topology: Topology,
    aggregator: Arc<Aggregator>,
    sink: Arc<dyn TraceSink>,
    metrics: Arc<PipelineMetrics>,
    config: ConsumerConfig,
    backoff: Duration,
    failures: Mutex<LruCache<Fingerprint, u32>>,
    state: watch::Sender<ConsumerState>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct EventConsumer {
    worker: Arc<Worker>,
    state: watch::Receiver<ConsumerState>,
    running: Mutex<Option<Running>>,
    stop_timeout: Duration,
}

impl EventConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: Topology,
        aggregator: Arc<Aggregator>,
        sink: Arc<dyn TraceSink>,
        metrics: Arc<PipelineMetrics>,
        config: ConsumerConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Stopped);
        let capacity = NonZeroUsize::new(config.redelivery_tracking_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            worker: Arc::new(Worker {
                broker,
                topology,
                aggregator,
                sink,
                metrics,
                backoff: Duration::from_millis(config.reconnect_backoff_ms),
                config,
                failures: Mutex::new(LruCache::new(capacity)),
                state: state_tx,
            }),
            state: state_rx,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Launch the consume loop in the background. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = self.worker.clone();
        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
        *running = Some(Running { shutdown, handle });
        info!("Event consumer started");
    }

    /// Ask the loop to stop and wait for it (bounded by the stop timeout).
    ///
    /// A message being handled when stop is requested is settled first.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(Running { shutdown, mut handle }) = running else {
            return;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => info!("Event consumer stopped"),
            Ok(Err(e)) => error!(error = %e, "Event consumer task failed"),
            Err(_) => {
                warn!(timeout_ms = self.stop_timeout.as_millis() as u64, "Event consumer did not stop in time, aborting");
                handle.abort();
            }
        }
        self.worker.state.send_replace(ConsumerState::Stopped);
    }
}

impl Worker {
    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConsumerState::Connecting);
            match self.session(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "Consumer error, reconnecting after backoff"
                    );
                    self.metrics.record_reconnect();
                    self.set_state(ConsumerState::Reconnecting);

                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.set_state(ConsumerState::Stopped);
    }

    /// One connection's lifetime. `Ok` means a stop was requested.
    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> SpinwireResult<()> {
        let channel = self.broker.connect().await?;
        let result = self.consume_on(channel.as_ref(), shutdown).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Error closing consumer channel");
        }
        result
    }

    async fn consume_on(
        &self,
        channel: &dyn BrokerChannel,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SpinwireResult<()> {
        self.topology.declare(channel).await?;
        channel.set_prefetch(self.config.prefetch).await?;

        let mut streams = Vec::with_capacity(self.topology.bindings.len());
        for binding in &self.topology.bindings {
            let tag = format!("{}.{}", self.config.consumer_tag, binding.queue);
            streams.push(channel.consume(&binding.queue, &tag).await?);
        }
        let mut deliveries = stream::select_all(streams);

        self.set_state(ConsumerState::Consuming);
        info!(
            exchange = %self.topology.exchange,
            queues = self.topology.bindings.len(),
            prefetch = self.config.prefetch,
            "Consuming analytics events"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.handle(delivery).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(BrokerError::ChannelClosed.into()),
                },
            }
        }
    }

    /// Process and settle one delivery. Only settlement failures are returned.
    async fn handle(&self, delivery: Delivery) -> BrokerResult<()> {
        let mut fingerprint: Fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&Sha256::digest(&delivery.payload));

        match self.process(&delivery).await {
            Ok(()) => {
                delivery.ack().await?;
                self.metrics.record_ack();
                self.forget(&fingerprint);
            }
            Err(e) => {
                let attempts = self.record_failure(fingerprint);
                let limit = self.config.max_redeliveries;

                if limit > 0 && attempts >= limit {
                    error!(
                        routing_key = %delivery.routing_key,
                        attempts,
                        error = %e,
                        "Giving up on message, rejecting without requeue"
                    );
                    delivery.nack(false).await?;
                    self.metrics.record_dead_letter();
                    self.forget(&fingerprint);
                } else {
                    warn!(
                        routing_key = %delivery.routing_key,
                        attempts,
                        redelivered = delivery.redelivered,
                        error = %e,
                        "Failed to process message, requeueing"
                    );
                    delivery.nack(true).await?;
                    self.metrics.record_requeue();
                }
            }
        }
        Ok(())
    }

    async fn process(&self, delivery: &Delivery) -> SpinwireResult<()> {
        let decoded = EventEnvelope::decode(&delivery.routing_key, &delivery.payload);

        // Undecodable bodies still continue the trace carried in the headers
        let parent = match &decoded {
            Ok(envelope) => envelope.trace.clone(),
            Err(_) => delivery
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<TraceContext>(),
        };
        let mut span = self
            .sink
            .start_transaction("queue.process", &delivery.routing_key, &parent);
        span.set_data("redelivered", if delivery.redelivered { "true" } else { "false" });

        let result = match decoded {
            Ok(envelope) => {
                span.set_data("event_id", &envelope.event_id.to_string());
                let aggregator = self.aggregator.clone();
                tokio::task::spawn_blocking(move || aggregator.apply(&envelope))
                    .await
                    .map_err(|e| SpinwireError::from(GameError::TaskFailed(e.to_string())))
                    .and_then(|applied| applied)
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &result {
            span.record_exception(e);
        }
        span.finish();
        result
    }

    fn record_failure(&self, fingerprint: Fingerprint) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let count = failures.get_or_insert_mut(fingerprint, || 0);
        *count += 1;
        *count
    }

    fn forget(&self, fingerprint: &Fingerprint) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop(fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LastPlayedPolicy;
    use crate::messaging::{InMemoryBroker, PublishProperties};
    use crate::storage::OptimizedStorage;
    use crate::telemetry::{LogTraceSink, TraceSpan};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        broker: InMemoryBroker,
        consumer: EventConsumer,
        metrics: Arc<PipelineMetrics>,
    }

    fn harness(sink: Arc<dyn TraceSink>, max_redeliveries: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let config = ConsumerConfig {
            reconnect_backoff_ms: 20,
            stop_timeout_ms: 1_000,
            max_redeliveries,
            ..Default::default()
        };
        let consumer = EventConsumer::new(
            Arc::new(broker.clone()),
            Topology::analytics(),
            Arc::new(Aggregator::new(storage, LastPlayedPolicy::Latest)),
            sink,
            metrics.clone(),
            config,
        );
        Harness {
            _dir: dir,
            broker,
            consumer,
            metrics,
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<ConsumerState>, wanted: ConsumerState) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state timeout")
            .expect("state channel closed");
    }

    async fn publish_raw(broker: &InMemoryBroker, routing_key: &str, body: &[u8], headers: &[(&str, &str)]) {
        let channel = broker.connect().await.unwrap();
        Topology::analytics().declare(channel.as_ref()).await.unwrap();
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        channel
            .publish("gaming", routing_key, body, &PublishProperties::persistent().with_headers(headers))
            .await
            .unwrap();
    }

    #[derive(Default)]
    struct RecordingSink {
        parents: Mutex<Vec<TraceContext>>,
        exceptions: Arc<Mutex<u32>>,
    }

    struct RecordingSpan {
        parent: TraceContext,
        exceptions: Arc<Mutex<u32>>,
    }

    impl TraceSink for RecordingSink {
        fn start_transaction(&self, _op: &str, _name: &str, parent: &TraceContext) -> Box<dyn TraceSpan> {
            self.parents.lock().unwrap().push(parent.clone());
            Box::new(RecordingSpan {
                parent: parent.clone(),
                exceptions: self.exceptions.clone(),
            })
        }
    }

    impl TraceSpan for RecordingSpan {
        fn set_data(&mut self, _key: &str, _value: &str) {}

        fn record_exception(&mut self, _error: &dyn std::error::Error) {
            *self.exceptions.lock().unwrap() += 1;
        }

        fn propagation_context(&self) -> TraceContext {
            self.parent.clone()
        }

        fn finish(self: Box<Self>) {}
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let h = harness(Arc::new(LogTraceSink), 5);
        let mut states = h.consumer.subscribe_state();
        assert_eq!(h.consumer.state(), ConsumerState::Stopped);

        h.consumer.start();
        wait_for(&mut states, ConsumerState::Consuming).await;

        h.consumer.stop().await;
        assert_eq!(h.consumer.state(), ConsumerState::Stopped);
        assert_eq!(h.broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_poison_message_is_rejected_after_limit() {
        let sink = Arc::new(RecordingSink::default());
        let h = harness(sink.clone(), 3);
        publish_raw(&h.broker, "game.result", b"{ definitely not json", &[]).await;

        let mut states = h.consumer.subscribe_state();
        h.consumer.start();
        wait_for(&mut states, ConsumerState::Consuming).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.broker.dead_letters().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message was never dead-lettered");

        let snap = h.metrics.snapshot();
        assert_eq!(snap.messages_requeued, 2);
        assert_eq!(snap.messages_dead_lettered, 1);
        assert_eq!(*sink.exceptions.lock().unwrap(), 3);
        h.consumer.stop().await;
    }

    #[tokio::test]
    async fn test_header_trace_used_when_body_is_unreadable() {
        let sink = Arc::new(RecordingSink::default());
        let h = harness(sink.clone(), 1);
        publish_raw(&h.broker, "payment.debit", b"[]", &[("sentry-trace", "t-1")]).await;

        let mut states = h.consumer.subscribe_state();
        h.consumer.start();
        wait_for(&mut states, ConsumerState::Consuming).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.metrics.snapshot().messages_dead_lettered == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let parents = sink.parents.lock().unwrap().clone();
        assert_eq!(parents[0].get("sentry-trace"), Some("t-1"));
        h.consumer.stop().await;
    }

    /// Holds every transaction open until the test lets it through
    struct GateSink {
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl TraceSink for GateSink {
        fn start_transaction(&self, op: &str, name: &str, parent: &TraceContext) -> Box<dyn TraceSpan> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            LogTraceSink.start_transaction(op, name, parent)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_settles_in_flight_message_first() {
        use crate::games::types::{GameResult, Symbol};

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let sink = Arc::new(GateSink {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let h = harness(sink, 5);

        let result = GameResult {
            id: Some("in-flight".to_string()),
            user_id: "p1".to_string(),
            bet: 10.0,
            payout: 30.0,
            symbols: [Symbol::Lemon; 3],
            timestamp: 1_704_110_400.0,
        };
        let body = EventEnvelope::game_result(result, TraceContext::new()).encode().unwrap();
        publish_raw(&h.broker, "game.result", &body, &[]).await;

        let mut states = h.consumer.subscribe_state();
        h.consumer.start();
        wait_for(&mut states, ConsumerState::Consuming).await;
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("handler never started");

        // stop() is polled first, so shutdown is signalled while the handler is blocked
        let release = async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            release_tx.send(()).unwrap();
        };
        tokio::join!(h.consumer.stop(), release);

        assert_eq!(h.consumer.state(), ConsumerState::Stopped);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.messages_acked, 1);
        assert_eq!(snap.messages_requeued, 0);
        assert_eq!(h.broker.unacked_count(), 0);
        assert_eq!(h.broker.queue_depth("analytics.game_results"), 0);
    }
}
