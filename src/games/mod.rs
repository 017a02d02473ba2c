pub mod engine;
pub mod processor;
pub mod types;

pub use engine::{Paytable, SlotEngine, SpinOutcome};
pub use processor::GameProcessor;
pub use types::*;
