use crate::errors::MessageError;
use crate::telemetry::TraceContext;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Reel symbols, cheapest first.
///
/// On the wire a symbol is its glyph, which is what the game frontends
/// render; the lowercase name is accepted as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    #[serde(rename = "🍒", alias = "cherry")]
    Cherry,
    #[serde(rename = "🍋", alias = "lemon")]
    Lemon,
    #[serde(rename = "🍊", alias = "orange")]
    Orange,
    #[serde(rename = "🍇", alias = "grape")]
    Grape,
    #[serde(rename = "⭐", alias = "star")]
    Star,
    #[serde(rename = "💎", alias = "diamond")]
    Diamond,
}

impl Symbol {
    pub const ALL: [Symbol; 6] = [
        Symbol::Cherry,
        Symbol::Lemon,
        Symbol::Orange,
        Symbol::Grape,
        Symbol::Star,
        Symbol::Diamond,
    ];

    pub fn glyph(&self) -> &'static str {
        match self {
            Symbol::Cherry => "🍒",
            Symbol::Lemon => "🍋",
            Symbol::Orange => "🍊",
            Symbol::Grape => "🍇",
            Symbol::Star => "⭐",
            Symbol::Diamond => "💎",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Symbol::Cherry => "cherry",
            Symbol::Lemon => "lemon",
            Symbol::Orange => "orange",
            Symbol::Grape => "grape",
            Symbol::Star => "star",
            Symbol::Diamond => "diamond",
        }
    }

    /// Payout multiplier for three of this symbol
    pub fn multiplier(&self) -> f64 {
        match self {
            Symbol::Cherry => 2.0,
            Symbol::Lemon => 3.0,
            Symbol::Orange => 4.0,
            Symbol::Grape => 5.0,
            Symbol::Star => 10.0,
            Symbol::Diamond => 20.0,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.glyph())
    }
}

/// True when all three reels show the same symbol
pub fn is_winning_line(symbols: &[Symbol; 3]) -> bool {
    symbols[0] == symbols[1] && symbols[1] == symbols[2]
}

/// A single spin, immutable once persisted.
///
/// `win` is not stored; it is always derived from `symbols`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "GameResultRecord", try_from = "GameResultRecord")]
pub struct GameResult {
    /// Assigned by the result store
    pub id: Option<String>,
    pub user_id: String,
    pub bet: f64,
    pub payout: f64,
    pub symbols: [Symbol; 3],
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl GameResult {
    pub fn win(&self) -> bool {
        is_winning_line(&self.symbols)
    }

    /// Multiplier applied to the bet; 0 for a losing line
    pub fn multiplier(&self) -> f64 {
        if self.win() {
            self.symbols[0].multiplier()
        } else {
            0.0
        }
    }

    pub fn played_at(&self) -> DateTime<Utc> {
        let secs = self.timestamp.floor();
        let nanos = ((self.timestamp - secs) * 1e9) as u32;
        DateTime::from_timestamp(secs as i64, nanos).unwrap_or_default()
    }

    /// UTC calendar day the spin counts towards
    pub fn date(&self) -> NaiveDate {
        self.played_at().date_naive()
    }

    fn check_consistency(&self) -> Result<(), MessageError> {
        if self.user_id.is_empty() {
            return Err(MessageError::InconsistentResult("empty user id".to_string()));
        }
        if !self.bet.is_finite() || self.bet < 0.0 {
            return Err(MessageError::InconsistentResult(format!("bad bet {}", self.bet)));
        }
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(MessageError::InconsistentResult(format!(
                "bad timestamp {}",
                self.timestamp
            )));
        }

        let expected = self.bet * self.multiplier();
        let tolerance = 1e-9 * self.bet.max(1.0);
        if (self.payout - expected).abs() > tolerance {
            return Err(MessageError::InconsistentResult(format!(
                "payout {} does not match {:?} at bet {} (expected {})",
                self.payout, self.symbols, self.bet, expected
            )));
        }
        Ok(())
    }
}

/// Wire and storage shape of a game result
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GameResultRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(alias = "userId")]
    user_id: String,
    bet: f64,
    win: bool,
    payout: f64,
    symbols: [Symbol; 3],
    #[serde(default)]
    timestamp: f64,
}

impl From<GameResult> for GameResultRecord {
    fn from(result: GameResult) -> Self {
        let win = result.win();
        Self {
            id: result.id,
            user_id: result.user_id,
            bet: result.bet,
            win,
            payout: result.payout,
            symbols: result.symbols,
            timestamp: result.timestamp,
        }
    }
}

impl TryFrom<GameResultRecord> for GameResult {
    type Error = MessageError;

    fn try_from(record: GameResultRecord) -> Result<Self, Self::Error> {
        let result = GameResult {
            id: record.id,
            user_id: record.user_id,
            bet: record.bet,
            payout: record.payout,
            symbols: record.symbols,
            timestamp: record.timestamp,
        };

        if record.win != result.win() {
            return Err(MessageError::InconsistentResult(format!(
                "win flag {} disagrees with symbols {:?}",
                record.win, result.symbols
            )));
        }
        result.check_consistency()?;
        Ok(result)
    }
}

/// Direction of a balance change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    Credit,
    Debit,
}

impl PaymentKind {
    /// A spin that returned at least the stake credits the player
    pub fn from_net(net: f64) -> Self {
        if net >= 0.0 {
            PaymentKind::Credit
        } else {
            PaymentKind::Debit
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Credit => "credit",
            PaymentKind::Debit => "debit",
        }
    }
}

impl fmt::Display for PaymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balance change emitted after a spin settles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    #[serde(rename = "userId", alias = "user_id")]
    pub user_id: String,
    /// Absolute value of the balance change
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bet: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<f64>,
    /// RFC 3339 only; any other value (epoch numbers included) reads as absent
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    })
}

impl PaymentEvent {
    /// Payment for a settled spin: amount is `|payout - bet|`
    pub fn for_spin(user_id: &str, bet: f64, payout: f64, balance_after: Option<f64>) -> (PaymentKind, Self) {
        let net = payout - bet;
        (
            PaymentKind::from_net(net),
            Self {
                user_id: user_id.to_string(),
                amount: net.abs(),
                bet: Some(bet),
                payout: Some(payout),
                balance_after,
                timestamp: Some(Utc::now()),
            },
        )
    }

    /// Day the payment counts towards; events without a timestamp count today
    pub fn date(&self) -> NaiveDate {
        self.timestamp.unwrap_or_else(Utc::now).date_naive()
    }
}

/// Request to spin the reels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpinRequest {
    pub user_id: String,
    pub bet: f64,
    /// Propagation context of the caller, forwarded untouched
    #[serde(default)]
    pub trace: TraceContext,
}

/// What the caller gets back once the spin is durable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpinResponse {
    pub id: String,
    pub win: bool,
    pub payout: f64,
    pub symbols: [Symbol; 3],
    pub timestamp: f64,
}

impl From<&GameResult> for SpinResponse {
    fn from(result: &GameResult) -> Self {
        Self {
            id: result.id.clone().unwrap_or_default(),
            win: result.win(),
            payout: result.payout,
            symbols: result.symbols,
            timestamp: result.timestamp,
        }
    }
}

/// Request to record a balance change for a finished spin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub user_id: String,
    pub bet: f64,
    pub payout: f64,
    #[serde(default)]
    pub balance_after: Option<f64>,
    #[serde(default)]
    pub trace: TraceContext,
}
