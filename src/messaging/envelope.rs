//! # Event Envelope
//!
//! Wire format for everything published on the `gaming` exchange:
//!
//! ```json
//! {
//!   "type": "game.result",
//!   "event_id": "5f0c…",
//!   "data": { ... },
//!   "trace": { "sentry-trace": "…", "baggage": "…" },
//!   "timestamp": "2024-01-01T12:00:00Z"
//! }
//! ```
//!
//! `type` may be missing (older game producers never sent it), in which case
//! the routing key decides. Payment producers historically sent the bare
//! `credit` / `debit` strings, which are accepted too. `timestamp` may be an
//! RFC 3339 string or epoch seconds.

use crate::errors::MessageError;
use crate::games::types::{GameResult, PaymentEvent, PaymentKind};
use crate::telemetry::TraceContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    GameResult,
    PaymentCredit,
    PaymentDebit,
}

impl EventType {
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventType::GameResult => "game.result",
            EventType::PaymentCredit => "payment.credit",
            EventType::PaymentDebit => "payment.debit",
        }
    }

    pub fn from_routing_key(key: &str) -> Option<Self> {
        match key {
            "game.result" => Some(EventType::GameResult),
            "payment.credit" => Some(EventType::PaymentCredit),
            "payment.debit" => Some(EventType::PaymentDebit),
            _ => None,
        }
    }

    /// Parse a `type` field, including the legacy short payment names
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "credit" => Some(EventType::PaymentCredit),
            "debit" => Some(EventType::PaymentDebit),
            other => Self::from_routing_key(other),
        }
    }

    pub fn payment_kind(&self) -> Option<PaymentKind> {
        match self {
            EventType::GameResult => None,
            EventType::PaymentCredit => Some(PaymentKind::Credit),
            EventType::PaymentDebit => Some(PaymentKind::Debit),
        }
    }
}

impl From<PaymentKind> for EventType {
    fn from(kind: PaymentKind) -> Self {
        match kind {
            PaymentKind::Credit => EventType::PaymentCredit,
            PaymentKind::Debit => EventType::PaymentDebit,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    GameResult(GameResult),
    Payment(PaymentEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub event_id: Uuid,
    pub payload: EventPayload,
    pub trace: TraceContext,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<Uuid>,
    data: serde_json::Value,
    #[serde(default, alias = "traceContext")]
    trace: TraceContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<serde_json::Value>,
}

impl EventEnvelope {
    pub fn game_result(result: GameResult, trace: TraceContext) -> Self {
        Self {
            event_type: EventType::GameResult,
            event_id: Uuid::new_v4(),
            payload: EventPayload::GameResult(result),
            trace,
            timestamp: Utc::now(),
        }
    }

    pub fn payment(kind: PaymentKind, event: PaymentEvent, trace: TraceContext) -> Self {
        Self {
            event_type: kind.into(),
            event_id: Uuid::new_v4(),
            payload: EventPayload::Payment(event),
            trace,
            timestamp: Utc::now(),
        }
    }

    /// Trace context mirrored as message headers
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.trace
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let data = match &self.payload {
            EventPayload::GameResult(result) => serde_json::to_value(result),
            EventPayload::Payment(event) => serde_json::to_value(event),
        }
        .map_err(|e| MessageError::Malformed(e.to_string()))?;

        let wire = WireEnvelope {
            event_type: Some(self.event_type.routing_key().to_string()),
            event_id: Some(self.event_id),
            data,
            trace: self.trace.clone(),
            timestamp: Some(serde_json::Value::String(self.timestamp.to_rfc3339())),
        };
        serde_json::to_vec(&wire).map_err(|e| MessageError::Malformed(e.to_string()))
    }

    /// Decode a message body received on `routing_key`
    pub fn decode(routing_key: &str, bytes: &[u8]) -> Result<Self, MessageError> {
        let wire: WireEnvelope =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Malformed(e.to_string()))?;

        let event_type = match wire.event_type.as_deref() {
            Some(declared) => EventType::parse(declared)
                .ok_or_else(|| MessageError::UnknownEventType(declared.to_string()))?,
            None => EventType::from_routing_key(routing_key)
                .ok_or_else(|| MessageError::UnknownEventType(routing_key.to_string()))?,
        };

        let payload = match event_type {
            EventType::GameResult => serde_json::from_value(wire.data)
                .map(EventPayload::GameResult)
                .map_err(|e| MessageError::PayloadMismatch {
                    expected: event_type.to_string(),
                    reason: e.to_string(),
                })?,
            EventType::PaymentCredit | EventType::PaymentDebit => serde_json::from_value(wire.data)
                .map(EventPayload::Payment)
                .map_err(|e| MessageError::PayloadMismatch {
                    expected: event_type.to_string(),
                    reason: e.to_string(),
                })?,
        };

        Ok(Self {
            event_type,
            event_id: wire.event_id.unwrap_or_else(Uuid::new_v4),
            payload,
            trace: wire.trace,
            timestamp: wire.timestamp.as_ref().and_then(parse_timestamp).unwrap_or_else(Utc::now),
        })
    }
}

const MILLIS_THRESHOLD: f64 = 1e11;

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let raw = n.as_f64()?;
            // Epoch seconds stay below 1e11 until the year 5138; larger values are milliseconds
            let secs = if raw.abs() >= MILLIS_THRESHOLD { raw / 1e3 } else { raw };
            DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
        }
        _ => None,
    }
}
