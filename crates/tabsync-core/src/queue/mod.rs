//! Queue module: persisted task records, retry timing, the runner and the engine.

mod engine;
mod record;
mod retry;
mod runner;

pub use engine::{EngineConfig, StepOutcome, TxQueue};
pub use record::QueuedTask;
pub use retry::{Backoff, RetryPolicy};
pub use runner::{RunOutcome, TaskRunner};
