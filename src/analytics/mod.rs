//! Real-time analytics rollups fed by the event consumer

pub mod aggregator;
pub mod stats;

pub use aggregator::Aggregator;
pub use stats::{DailyPaymentStat, DailyStat, PlayerStat, StatsReader};
