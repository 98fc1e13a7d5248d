pub mod apply;
pub mod config;
mod coordinator;
mod device;
pub mod diff;
pub mod engine;
pub mod error;
pub mod io;
pub mod readiness;
pub mod retry;
pub mod store;
pub mod types;

pub use engine::{Engine, EngineSettings, RecoveryReport, RunAck, SignalReceipt};
pub use error::{Result, RolloutError};
