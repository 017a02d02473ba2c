//! Aggregate rollups and their read side
//!
//! Rollups are stored as JSON under:
//! - `stats:daily:<YYYY-MM-DD>`
//! - `stats:player:<user_id>`
//! - `stats:payments:<YYYY-MM-DD>`

use crate::config::LastPlayedPolicy;
use crate::errors::{SpinwireError, SpinwireResult, StorageError};
use crate::games::types::{GameResult, PaymentEvent, PaymentKind};
use crate::storage::OptimizedStorage;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub(crate) const DAILY_PREFIX: &str = "stats:daily:";
pub(crate) const PLAYER_PREFIX: &str = "stats:player:";
pub(crate) const PAYMENTS_PREFIX: &str = "stats:payments:";

pub(crate) fn daily_key(date: NaiveDate) -> Vec<u8> {
    format!("{}{}", DAILY_PREFIX, date).into_bytes()
}

pub(crate) fn player_key(user_id: &str) -> Vec<u8> {
    format!("{}{}", PLAYER_PREFIX, user_id).into_bytes()
}

pub(crate) fn payments_key(date: NaiveDate) -> Vec<u8> {
    format!("{}{}", PAYMENTS_PREFIX, date).into_bytes()
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

/// Totals for one UTC day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub total_games: u64,
    pub total_bets: f64,
    pub total_payouts: f64,
    pub total_wins: u64,
    pub unique_players: BTreeSet<String>,
}

impl DailyStat {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            total_games: 0,
            total_bets: 0.0,
            total_payouts: 0.0,
            total_wins: 0,
            unique_players: BTreeSet::new(),
        }
    }

    pub fn record(&mut self, result: &GameResult) {
        self.total_games += 1;
        self.total_bets += result.bet;
        self.total_payouts += result.payout;
        if result.win() {
            self.total_wins += 1;
        }
        self.unique_players.insert(result.user_id.clone());
    }

    /// Percentage of games won
    pub fn win_rate(&self) -> f64 {
        percent(self.total_wins as f64, self.total_games as f64)
    }

    /// Payouts as a percentage of bets
    pub fn rtp(&self) -> f64 {
        percent(self.total_payouts, self.total_bets)
    }

    pub fn house_edge(&self) -> f64 {
        percent(self.total_bets - self.total_payouts, self.total_bets)
    }

    /// Player-side result: payouts minus bets
    pub fn net_profit(&self) -> f64 {
        self.total_payouts - self.total_bets
    }

    pub fn average_bet(&self) -> f64 {
        if self.total_games == 0 {
            0.0
        } else {
            self.total_bets / self.total_games as f64
        }
    }
}

/// Lifetime totals for one player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStat {
    pub user_id: String,
    pub total_games: u64,
    pub total_bets: f64,
    pub total_payouts: f64,
    pub total_wins: u64,
    pub last_played: Option<DateTime<Utc>>,
}

impl PlayerStat {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_games: 0,
            total_bets: 0.0,
            total_payouts: 0.0,
            total_wins: 0,
            last_played: None,
        }
    }

    pub fn record(&mut self, result: &GameResult, policy: LastPlayedPolicy) {
        self.total_games += 1;
        self.total_bets += result.bet;
        self.total_payouts += result.payout;
        if result.win() {
            self.total_wins += 1;
        }

        let played_at = result.played_at();
        self.last_played = match (policy, self.last_played) {
            (LastPlayedPolicy::Latest, Some(current)) => Some(current.max(played_at)),
            _ => Some(played_at),
        };
    }

    pub fn win_rate(&self) -> f64 {
        percent(self.total_wins as f64, self.total_games as f64)
    }

    pub fn rtp(&self) -> f64 {
        percent(self.total_payouts, self.total_bets)
    }

    pub fn net_profit(&self) -> f64 {
        self.total_payouts - self.total_bets
    }
}

/// Per-day payment counters, keyed by payment kind (`credit` / `debit`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPaymentStat {
    pub date: NaiveDate,
    pub counts: BTreeMap<String, u64>,
    pub amounts: BTreeMap<String, f64>,
}

impl DailyPaymentStat {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            counts: BTreeMap::new(),
            amounts: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, event: &PaymentEvent, kind: PaymentKind) {
        *self.counts.entry(kind.as_str().to_string()).or_insert(0) += 1;
        *self.amounts.entry(kind.as_str().to_string()).or_insert(0.0) += event.amount;
    }

    pub fn count(&self, kind: PaymentKind) -> u64 {
        self.counts.get(kind.as_str()).copied().unwrap_or(0)
    }

    pub fn amount(&self, kind: PaymentKind) -> f64 {
        self.amounts.get(kind.as_str()).copied().unwrap_or(0.0)
    }

    /// Credits minus debits
    pub fn net_flow(&self) -> f64 {
        self.amount(PaymentKind::Credit) - self.amount(PaymentKind::Debit)
    }
}

pub(crate) fn load_json<T: DeserializeOwned>(
    storage: &OptimizedStorage,
    key: &[u8],
) -> SpinwireResult<Option<T>> {
    let Some(bytes) = storage.get(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        SpinwireError::Storage(StorageError::CorruptedData(format!(
            "Failed to decode {}: {}",
            String::from_utf8_lossy(key),
            e
        )))
    })
}

/// Read-only queries over the rollups
#[derive(Clone)]
pub struct StatsReader {
    storage: OptimizedStorage,
}

impl StatsReader {
    pub fn new(storage: OptimizedStorage) -> Self {
        Self { storage }
    }

    pub fn daily_stat(&self, date: NaiveDate) -> SpinwireResult<Option<DailyStat>> {
        load_json(&self.storage, &daily_key(date))
    }

    /// The most recent `days` days that have data, newest first
    pub fn recent_daily_stats(&self, days: usize) -> SpinwireResult<Vec<DailyStat>> {
        let mut stats = Vec::new();
        self.storage
            .for_each_prefix(DAILY_PREFIX.as_bytes(), |key, value| {
                let stat: DailyStat = serde_json::from_slice(value).map_err(|e| {
                    StorageError::CorruptedData(format!(
                        "Failed to decode {}: {}",
                        String::from_utf8_lossy(key),
                        e
                    ))
                })?;
                stats.push(stat);
                Ok(())
            })?;

        // ISO dates sort lexically, so keys come back oldest first
        stats.reverse();
        stats.truncate(days);
        Ok(stats)
    }

    pub fn player_stat(&self, user_id: &str) -> SpinwireResult<Option<PlayerStat>> {
        load_json(&self.storage, &player_key(user_id))
    }

    pub fn daily_payment_stat(&self, date: NaiveDate) -> SpinwireResult<Option<DailyPaymentStat>> {
        load_json(&self.storage, &payments_key(date))
    }
}
