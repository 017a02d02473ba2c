//! Incremental rollup maintenance
//!
//! Every update is a read-modify-write of one or two JSON documents. Writes
//! are serialized by a single lock and a game result's daily and player
//! updates land in one atomic batch, so a crash never leaves one without the
//! other.
//!
//! Counting is at-least-once: a message whose ack is lost after the batch
//! commits is counted again on redelivery. Deduplicating would need a
//! per-event ledger keyed by `event_id`.

use super::stats::{daily_key, load_json, payments_key, player_key, DailyPaymentStat, DailyStat, PlayerStat, StatsReader};
use crate::config::LastPlayedPolicy;
use crate::errors::{MessageError, SpinwireResult};
use crate::games::types::{GameResult, PaymentEvent, PaymentKind};
use crate::messaging::envelope::{EventEnvelope, EventPayload};
use crate::storage::OptimizedStorage;
use std::sync::Mutex;
use tracing::debug;

pub struct Aggregator {
    storage: OptimizedStorage,
    last_played: LastPlayedPolicy,
    write_lock: Mutex<()>,
}

impl Aggregator {
    pub fn new(storage: OptimizedStorage, last_played: LastPlayedPolicy) -> Self {
        Self {
            storage,
            last_played,
            write_lock: Mutex::new(()),
        }
    }

    pub fn reader(&self) -> StatsReader {
        StatsReader::new(self.storage.clone())
    }

    /// Dispatch on the envelope's event type
    pub fn apply(&self, envelope: &EventEnvelope) -> SpinwireResult<()> {
        match (&envelope.payload, envelope.event_type.payment_kind()) {
            (EventPayload::GameResult(result), None) => self.apply_game_result(result),
            (EventPayload::Payment(event), Some(kind)) => self.apply_payment_event(event, kind),
            _ => Err(MessageError::PayloadMismatch {
                expected: envelope.event_type.to_string(),
                reason: "payload kind does not match event type".to_string(),
            }
            .into()),
        }
    }

    pub fn apply_game_result(&self, result: &GameResult) -> SpinwireResult<()> {
        let date = result.date();
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let day_key = daily_key(date);
        let mut daily: DailyStat =
            load_json(&self.storage, &day_key)?.unwrap_or_else(|| DailyStat::new(date));
        daily.record(result);

        let user_key = player_key(&result.user_id);
        let mut player: PlayerStat =
            load_json(&self.storage, &user_key)?.unwrap_or_else(|| PlayerStat::new(&result.user_id));
        player.record(result, self.last_played);

        let items = vec![
            (day_key, serde_json::to_vec(&daily)?),
            (user_key, serde_json::to_vec(&player)?),
        ];
        self.storage.batch_write(&items)?;

        debug!(
            date = %date,
            user = %result.user_id,
            games = daily.total_games,
            "Applied game result"
        );
        Ok(())
    }

    pub fn apply_payment_event(&self, event: &PaymentEvent, kind: PaymentKind) -> SpinwireResult<()> {
        let date = event.date();
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = payments_key(date);
        let mut stat: DailyPaymentStat =
            load_json(&self.storage, &key)?.unwrap_or_else(|| DailyPaymentStat::new(date));
        stat.record(event, kind);
        self.storage.put(&key, &serde_json::to_vec(&stat)?)?;

        debug!(date = %date, kind = %kind, amount = event.amount, "Applied payment event");
        Ok(())
    }
}
