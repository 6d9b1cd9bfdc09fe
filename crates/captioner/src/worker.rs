//! Inference worker boundary.
//!
//! The worker holds exclusive accelerator state, so exactly one handle exists at a time
//! and it is passed around by `&mut`. Out-of-memory is reported as its own error kind so
//! the attempt executor never has to inspect error text.

use std::path::Path;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use crate::config::CaptionConfig;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The accelerator ran out of memory during the call
    #[error("accelerator out of memory: {0}")]
    ResourceExhausted(String),

    #[error("inference failed: {0}")]
    Failed(String),

    #[error("worker failed to load: {0}")]
    Load(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("no worker is loaded")]
    NotLoaded,

    #[error("worker IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, WorkerError::ResourceExhausted(_))
    }
}

/// Per-call settings forwarded to the worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pixels: Option<u64>,
    pub max_new_tokens: u32,
    pub prompt: String,
}

impl InferenceOptions {
    pub fn from_config(cfg: &CaptionConfig) -> Self {
        Self {
            fps: cfg.fps,
            max_pixels: cfg.max_pixels,
            max_new_tokens: cfg.max_new_tokens,
            prompt: cfg.prompt.clone(),
        }
    }
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self::from_config(&CaptionConfig::default_config())
    }
}

/// A loaded, stateful inference worker
#[async_trait]
pub trait InferenceWorker: Send {
    /// Caption one variant. Dropping the returned future abandons the call; the worker
    /// must stay usable for the next request.
    async fn infer(&mut self, variant: &Path, options: &InferenceOptions) -> WorkerResult<String>;

    /// Abort the request abandoned by the watchdog so the next call is not queued behind
    /// it. A worker that cannot confirm the abort must report `is_alive() == false`.
    async fn cancel(&mut self) -> WorkerResult<()> {
        Ok(())
    }

    /// Release intermediate buffers and flush device caches
    async fn reclaim(&mut self) -> WorkerResult<()>;

    /// Release the accelerator and stop the worker
    async fn shutdown(self: Box<Self>) -> WorkerResult<()>;

    /// False once the worker can no longer serve requests (e.g. its process exited)
    fn is_alive(&mut self) -> bool {
        true
    }
}

/// Constructs workers; the lifecycle manager owns the single live handle
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn load(&self, device: &str) -> WorkerResult<Box<dyn InferenceWorker>>;
}
