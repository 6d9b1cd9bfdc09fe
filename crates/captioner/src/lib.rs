pub mod config;
pub mod item;
pub mod scan;
pub mod ffprobe;
pub mod downscale;
pub mod history;
pub mod risk;
pub mod worker;
pub mod process_worker;
pub mod executor;
pub mod controller;
pub mod lifecycle;
pub mod sink;
pub mod quarantine;
pub mod driver;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CaptionConfig;
pub use item::{ItemAttributes, Variant};
pub use controller::{RetryController, RetryPolicy, Terminal};
pub use driver::{Cadence, Disposition, QueueDriver, RunSummary};
pub use executor::Outcome;
pub use lifecycle::{ReloadPolicy, WorkerLifecycle};
pub use risk::{RiskAssessment, RiskPredictor};
pub use worker::{InferenceWorker, WorkerError, WorkerFactory};
