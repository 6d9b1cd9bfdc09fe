//! In-crate fakes for the prober, downscaler and worker.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::Result;
use async_trait::async_trait;
use crate::downscale::{variant_path, Downscaler};
use crate::ffprobe::ResourceProber;
use crate::item::ItemAttributes;
use crate::worker::{InferenceOptions, InferenceWorker, WorkerError, WorkerFactory, WorkerResult};

/// Source file name of an item or of any variant derived from it
pub fn item_key(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_prefix("scaled_").and_then(|rest| rest.split_once("pct_")) {
        Some((_, source)) => source.to_string(),
        None => name,
    }
}

/// Scale encoded in a variant name; 1.0 for originals
pub fn variant_scale(path: &Path) -> f64 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_prefix("scaled_")
        .and_then(|rest| rest.split_once("pct_"))
        .and_then(|(pct, _)| pct.parse::<f64>().ok())
        .map_or(1.0, |pct| pct / 100.0)
}

pub fn small_attributes() -> ItemAttributes {
    ItemAttributes {
        size_bytes: 1_000_000,
        width: 640,
        height: 360,
        frame_count: Some(100),
        duration_secs: Some(4.0),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Caption(String),
    Oom,
    Fail,
    Hang,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub invocations: AtomicUsize,
    pub loads: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub reclaims: AtomicUsize,
    pub cancels: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub calls: Mutex<Vec<PathBuf>>,
}

impl WorkerStats {
    /// Scales seen by the worker for one item, in call order
    pub fn scales_for(&self, key: &str) -> Vec<f64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| item_key(p) == key)
            .map(|p| variant_scale(p))
            .collect()
    }
}

type Scripts = Arc<Mutex<HashMap<String, VecDeque<Reply>>>>;

/// Worker factory whose workers answer from per-item scripts.
///
/// The last reply of a script repeats; unscripted items get a caption.
pub struct ScriptedFactory {
    scripts: Scripts,
    stats: Arc<WorkerStats>,
    fail_loads: bool,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(WorkerStats::default()),
            fail_loads: false,
        }
    }

    pub fn script(self, key: &str, replies: Vec<Reply>) -> Self {
        self.scripts.lock().unwrap().insert(key.to_string(), replies.into());
        self
    }

    pub fn failing_loads(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl WorkerFactory for ScriptedFactory {
    async fn load(&self, _device: &str) -> WorkerResult<Box<dyn InferenceWorker>> {
        if self.fail_loads {
            return Err(WorkerError::Load("scripted load failure".to_string()));
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedWorker {
            scripts: self.scripts.clone(),
            stats: self.stats.clone(),
        }) as Box<dyn InferenceWorker>)
    }
}

struct ScriptedWorker {
    scripts: Scripts,
    stats: Arc<WorkerStats>,
}

impl ScriptedWorker {
    fn next_reply(&self, key: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Fail),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Fail),
            None => Reply::Caption(format!("caption of {}", key)),
        }
    }
}

#[async_trait]
impl InferenceWorker for ScriptedWorker {
    async fn infer(&mut self, variant: &Path, _options: &InferenceOptions) -> WorkerResult<String> {
        self.stats.invocations.fetch_add(1, Ordering::SeqCst);
        self.stats.calls.lock().unwrap().push(variant.to_path_buf());

        match self.next_reply(&item_key(variant)) {
            Reply::Caption(text) => Ok(text),
            Reply::Oom => Err(WorkerError::ResourceExhausted("CUDA out of memory".to_string())),
            Reply::Fail => Err(WorkerError::Failed("scripted failure".to_string())),
            Reply::Hang => Ok(std::future::pending::<String>().await),
        }
    }

    async fn cancel(&mut self) -> WorkerResult<()> {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reclaim(&mut self) -> WorkerResult<()> {
        self.stats.reclaims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(self: Box<Self>) -> WorkerResult<()> {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Prober answering from in-memory tables keyed by item file name
pub struct FakeProber {
    attributes: HashMap<String, ItemAttributes>,
    frames: HashMap<String, u64>,
    probes: Arc<AtomicUsize>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self {
            attributes: HashMap::new(),
            frames: HashMap::new(),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with(mut self, key: &str, attributes: ItemAttributes) -> Self {
        self.attributes.insert(key.to_string(), attributes);
        self
    }

    pub fn frames(mut self, key: &str, frames: u64) -> Self {
        self.frames.insert(key.to_string(), frames);
        self
    }

    pub fn probe_counter(&self) -> Arc<AtomicUsize> {
        self.probes.clone()
    }
}

#[async_trait]
impl ResourceProber for FakeProber {
    async fn probe(&self, item: &Path) -> Result<ItemAttributes> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .attributes
            .get(&item_key(item))
            .cloned()
            .unwrap_or_else(small_attributes))
    }

    async fn count_frames(&self, item: &Path) -> Result<u64> {
        let key = item_key(item);
        if let Some(frames) = self.frames.get(&key) {
            return Ok(*frames);
        }
        Ok(self
            .attributes
            .get(&key)
            .and_then(|a| a.frame_count)
            .unwrap_or(100))
    }
}

/// Downscaler that writes a placeholder file at the real variant path
#[derive(Default)]
pub struct FakeDownscaler {
    pub calls: Arc<Mutex<Vec<f64>>>,
}

#[async_trait]
impl Downscaler for FakeDownscaler {
    async fn downscale(&self, item: &Path, scale: f64, work_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(work_dir)?;
        let path = variant_path(item, scale, work_dir);
        fs::write(&path, b"scaled")?;
        self.calls.lock().unwrap().push(scale);
        Ok(path)
    }
}

/// Downscaler that always fails
pub struct BrokenDownscaler;

#[async_trait]
impl Downscaler for BrokenDownscaler {
    async fn downscale(&self, item: &Path, _scale: f64, _work_dir: &Path) -> Result<PathBuf> {
        anyhow::bail!("ffmpeg refused {}", item.display())
    }
}
