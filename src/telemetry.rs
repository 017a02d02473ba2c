//! Logging setup and the observability seam
//!
//! Trace context travels with every event as an opaque string map. Nothing in
//! this crate looks inside it: it is handed to a [`TraceSink`] when a
//! transaction starts and read back from the span when publishing.

use crate::config::MonitoringConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info_span, Span};
use tracing_subscriber::EnvFilter;

/// Opaque propagation metadata (e.g. `sentry-trace`, `baggage`, `traceparent`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceContext(BTreeMap<String, String>);

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, String>> for TraceContext {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for TraceContext {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An open transaction in the observability backend
pub trait TraceSpan: Send {
    fn set_data(&mut self, key: &str, value: &str);

    fn record_exception(&mut self, error: &dyn std::error::Error);

    /// Context to attach to messages emitted inside this span
    fn propagation_context(&self) -> TraceContext;

    fn finish(self: Box<Self>);
}

/// Observability backend: starts transactions continuing a remote parent
pub trait TraceSink: Send + Sync {
    fn start_transaction(&self, op: &str, name: &str, parent: &TraceContext) -> Box<dyn TraceSpan>;
}

/// Sink that records transactions as `tracing` spans
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTraceSink;

struct LogSpan {
    span: Span,
    parent: TraceContext,
    started: Instant,
    failed: bool,
}

impl TraceSink for LogTraceSink {
    fn start_transaction(&self, op: &str, name: &str, parent: &TraceContext) -> Box<dyn TraceSpan> {
        let span = info_span!("transaction", op = %op, name = %name, continued = !parent.is_empty());
        Box::new(LogSpan {
            span,
            parent: parent.clone(),
            started: Instant::now(),
            failed: false,
        })
    }
}

impl TraceSpan for LogSpan {
    fn set_data(&mut self, key: &str, value: &str) {
        let _enter = self.span.enter();
        debug!(key, value, "span data");
    }

    fn record_exception(&mut self, err: &dyn std::error::Error) {
        let _enter = self.span.enter();
        self.failed = true;
        error!(error = %err, "transaction failed");
    }

    fn propagation_context(&self) -> TraceContext {
        self.parent.clone()
    }

    fn finish(self: Box<Self>) {
        let _enter = self.span.enter();
        debug!(
            elapsed_us = self.started.elapsed().as_micros() as u64,
            ok = !self.failed,
            "transaction finished"
        );
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level. Safe to call more than once;
/// later calls are no-ops.
pub fn init_logging(config: &MonitoringConfig) {
    if !config.enable_logging {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("spinwire={},lapin=warn", config.log_level.as_str())));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
