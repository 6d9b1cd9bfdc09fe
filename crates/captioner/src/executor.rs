//! One bounded attempt of the worker call.
//!
//! The watchdog is the timer owned by `tokio::time::timeout`: armed when the attempt
//! starts awaiting the worker and dropped with it on every exit path, so a stale timer
//! can never fire against a later call. When it fires the in-flight worker future is
//! dropped at its next await point and the worker is told to cancel the request, so the
//! next call does not queue behind it. The worker itself stays loaded.

use std::fmt;
use std::path::Path;
use std::time::Duration;
use log::{debug, warn};
use crate::ffprobe::ResourceProber;
use crate::worker::{InferenceOptions, InferenceWorker, WorkerError};

/// Fewer frames than this cannot be captioned
pub const MIN_FRAMES: u64 = 2;

/// Classified result of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(String),
    Timeout,
    ResourceExhausted(String),
    OtherFailure(String),
    /// Structurally unprocessable; the worker was never called
    PermanentSkip(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Timeout => "timeout",
            Outcome::ResourceExhausted(_) => "out of memory",
            Outcome::OtherFailure(_) => "failure",
            Outcome::PermanentSkip(_) => "unprocessable",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(_) | Outcome::Timeout => f.write_str(self.label()),
            Outcome::ResourceExhausted(detail)
            | Outcome::OtherFailure(detail)
            | Outcome::PermanentSkip(detail) => write!(f, "{}: {}", self.label(), detail),
        }
    }
}

/// Map a worker error onto an attempt outcome by kind
pub fn classify(err: WorkerError) -> Outcome {
    match err {
        WorkerError::ResourceExhausted(detail) => Outcome::ResourceExhausted(detail),
        other => Outcome::OtherFailure(other.to_string()),
    }
}

/// Run one attempt of `worker` on `variant`, bounded by `timeout`.
///
/// Resource reclamation runs after every attempt that reached the worker.
pub async fn attempt(
    prober: &dyn ResourceProber,
    worker: &mut dyn InferenceWorker,
    variant: &Path,
    options: &InferenceOptions,
    timeout: Duration,
) -> Outcome {
    match prober.count_frames(variant).await {
        Ok(frames) if frames >= MIN_FRAMES => {
            debug!("{} has {} frames", variant.display(), frames);
        }
        Ok(frames) => {
            return Outcome::PermanentSkip(format!("only {} frame(s)", frames));
        }
        Err(e) => {
            warn!("Could not count frames of {}: {:#}", variant.display(), e);
            return Outcome::PermanentSkip("frame count unavailable".to_string());
        }
    }

    debug!("⏱️  Watchdog armed for {}s on {}", timeout.as_secs_f64(), variant.display());
    let result = tokio::time::timeout(timeout, worker.infer(variant, options)).await;
    debug!("⏱️  Watchdog disarmed for {}", variant.display());

    let outcome = match result {
        Ok(Ok(caption)) => Outcome::Success(caption.trim().to_string()),
        Ok(Err(e)) => classify(e),
        Err(_elapsed) => {
            if let Err(e) = worker.cancel().await {
                warn!("Cancelling the timed-out request failed: {}", e);
            }
            Outcome::Timeout
        }
    };

    if let Err(e) = worker.reclaim().await {
        warn!("Reclamation after attempt failed: {}", e);
    }

    outcome
}
