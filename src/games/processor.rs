//! Synchronous request path: spin, persist, publish

use crate::errors::{GameError, SpinwireError, SpinwireResult};
use crate::game_store::ResultStore;
use crate::games::engine::SlotEngine;
use crate::games::types::{GameResult, PaymentEvent, PaymentRequest, SpinRequest, SpinResponse};
use crate::messaging::{EventEnvelope, EventPublisher, PublishOutcome};
use crate::metrics::PipelineMetrics;
use crate::telemetry::TraceSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Wall clock that never runs backwards within the process
#[derive(Debug, Default)]
struct MonotonicClock {
    last_micros: AtomicU64,
}

impl MonotonicClock {
    fn now(&self) -> f64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let previous = self.last_micros.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall) as f64 / 1e6
    }
}

/// Processes spins and payment notifications.
///
/// A spin is only reported once its record is durable. Publishing is best
/// effort and never changes the response.
pub struct GameProcessor {
    engine: SlotEngine,
    store: Arc<dyn ResultStore>,
    publisher: Arc<EventPublisher>,
    sink: Arc<dyn TraceSink>,
    metrics: Arc<PipelineMetrics>,
    clock: MonotonicClock,
}

impl GameProcessor {
    pub fn new(
        engine: SlotEngine,
        store: Arc<dyn ResultStore>,
        publisher: Arc<EventPublisher>,
        sink: Arc<dyn TraceSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            engine,
            store,
            publisher,
            sink,
            metrics,
            clock: MonotonicClock::default(),
        }
    }

    pub fn engine(&self) -> &SlotEngine {
        &self.engine
    }

    pub async fn play(&self, request: SpinRequest) -> SpinwireResult<SpinResponse> {
        validate_user(&request.user_id)?;
        if !request.bet.is_finite() || request.bet <= 0.0 {
            return Err(GameError::InvalidBet(request.bet).into());
        }

        let mut span = self.sink.start_transaction("game.play", "slot.spin", &request.trace);
        span.set_data("user_id", &request.user_id);

        let outcome = self.engine.spin(request.bet);
        let result = GameResult {
            id: None,
            user_id: request.user_id,
            bet: request.bet,
            payout: outcome.payout,
            symbols: outcome.symbols,
            timestamp: self.clock.now(),
        };

        let stored = match self.persist(result).await {
            Ok(stored) => stored,
            Err(e) => {
                span.record_exception(&e);
                span.finish();
                return Err(e);
            }
        };

        let envelope = EventEnvelope::game_result(stored.clone(), span.propagation_context());
        let published = self.publisher.publish(&envelope).await;
        self.metrics.record_spin();

        info!(
            game_id = stored.id.as_deref().unwrap_or_default(),
            user = %stored.user_id,
            bet = stored.bet,
            payout = stored.payout,
            published = matches!(published, PublishOutcome::Published),
            "Spin recorded"
        );
        span.finish();

        Ok(SpinResponse::from(&stored))
    }

    async fn persist(&self, result: GameResult) -> SpinwireResult<GameResult> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.persist(result))
            .await
            .map_err(|e| SpinwireError::from(GameError::TaskFailed(e.to_string())))?
    }

    /// Publish the balance change of a settled spin on `payment.<kind>`
    pub async fn record_payment(&self, request: PaymentRequest) -> SpinwireResult<PublishOutcome> {
        validate_user(&request.user_id)?;
        for amount in [request.bet, request.payout] {
            if !amount.is_finite() || amount < 0.0 {
                return Err(GameError::InvalidBet(amount).into());
            }
        }

        let mut span = self.sink.start_transaction("payment.record", "payment", &request.trace);
        let (kind, event) = PaymentEvent::for_spin(
            &request.user_id,
            request.bet,
            request.payout,
            request.balance_after,
        );
        span.set_data("kind", kind.as_str());

        let envelope = EventEnvelope::payment(kind, event, span.propagation_context());
        let outcome = self.publisher.publish(&envelope).await;
        debug!(user = %request.user_id, kind = %kind, ?outcome, "Payment event handled");
        span.finish();

        Ok(outcome)
    }
}

fn validate_user(user_id: &str) -> SpinwireResult<()> {
    if user_id.trim().is_empty() {
        return Err(GameError::MissingUser.into());
    }
    Ok(())
}
