//! Spinwire - event-driven slot results pipeline
//!
//! A spin is computed, persisted to RocksDB and published onto a durable
//! topic exchange. A separate consumer drains the analytics queues and keeps
//! daily, per-player and payment rollups up to date.

pub mod analytics;
pub mod config;
pub mod errors;
pub mod game_store;
pub mod games;
pub mod messaging;
pub mod metrics;
pub mod storage;
pub mod telemetry;

pub use analytics::{Aggregator, DailyPaymentStat, DailyStat, PlayerStat, StatsReader};
pub use config::{ConfigLoader, SpinwireConfig};
pub use errors::{SpinwireError, SpinwireResult};
pub use game_store::{ResultStore, RocksResultStore};
pub use games::{GameProcessor, SlotEngine};
pub use messaging::{
    AmqpBroker, Broker, ConsumerState, EventConsumer, EventEnvelope, EventPublisher, InMemoryBroker,
    Topology,
};
pub use metrics::PipelineMetrics;
pub use storage::OptimizedStorage;
pub use telemetry::{LogTraceSink, TraceContext, TraceSink};
