use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use crate::sink::OutputFormat;

/// Thresholds used by the risk predictor when no failure history carries an attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultThresholds {
    pub size_bytes: f64,
    pub width: f64,
    pub height: f64,
    pub frame_count: f64,
    pub duration_secs: f64,
    pub total_pixels: f64,
}

impl Default for DefaultThresholds {
    fn default() -> Self {
        Self {
            size_bytes: 1024.0 * 1024.0 * 1024.0, // 1 GiB
            width: 3840.0,
            height: 2160.0,
            frame_count: 9000.0,  // 5 minutes at 30 fps
            duration_secs: 300.0,
            total_pixels: 1920.0 * 1080.0 * 9000.0,
        }
    }
}

/// Configuration for the captioning run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    /// Root of the quarantine tree (timeout and failure subdirectories live below it)
    pub skip_dir: PathBuf,
    /// JSON file holding past out-of-memory failures
    pub history_path: PathBuf,
    /// Where downscaled variants are written; a per-run temp dir when unset
    pub work_dir: Option<PathBuf>,
    /// Output sink format
    pub output_format: OutputFormat,
    /// Accelerator device handed to the worker on load
    pub device: String,
    /// Frame sampling rate forwarded to the worker (raw video when unset)
    pub fps: Option<f64>,
    /// Pixel budget forwarded to the worker
    pub max_pixels: Option<u64>,
    pub max_new_tokens: u32,
    pub prompt: String,
    /// Wall-clock bound on one worker call
    pub timeout_secs: u64,
    /// Scale decrement applied after each out-of-memory failure
    pub scale_step: f64,
    /// Smallest scale worth attempting
    pub min_scale: f64,
    /// Pause after an out-of-memory failure before the downscaled retry
    pub oom_backoff_ms: u64,
    /// Reload the worker every K timeouts
    pub reload_every_timeouts: u32,
    /// Reload the worker every N successfully captioned items
    pub reload_every_successes: u32,
    /// Run a reclamation pass every M successfully captioned items
    pub cleanup_every_successes: u32,
    /// Pause between unloading and loading the worker
    pub reload_pause_ms: u64,
    /// Multiplier applied to the smallest failing value of each attribute (< 1.0)
    pub safety_margin: f64,
    pub default_thresholds: DefaultThresholds,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Worker subprocess command line (program followed by its arguments)
    pub worker_command: Vec<String>,
    /// Bound on how long the worker may take to load its model
    pub worker_load_timeout_secs: u64,
    /// How long a timed-out request may take to acknowledge a cancel
    pub cancel_grace_ms: u64,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl CaptionConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            skip_dir: PathBuf::from("skipped_videos"),
            history_path: PathBuf::from("oom_history.json"),
            work_dir: None,
            output_format: OutputFormat::Jsonl,
            device: "cuda".to_string(),
            fps: None,
            max_pixels: None,
            max_new_tokens: 128,
            prompt: "Describe this video.".to_string(),
            timeout_secs: 30,
            scale_step: 0.1,
            min_scale: 0.25,
            oom_backoff_ms: 1000,
            reload_every_timeouts: 3,
            reload_every_successes: 300,
            cleanup_every_successes: 50,
            reload_pause_ms: 2000,
            safety_margin: 0.8,
            default_thresholds: DefaultThresholds::default(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            worker_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "magix_worker".to_string(),
            ],
            worker_load_timeout_secs: 600,
            cancel_grace_ms: 5000,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject policy values that would break the retry bound or the risk model
    pub fn validate(&self) -> Result<()> {
        if !(self.scale_step > 0.0 && self.scale_step < 1.0) {
            bail!("scale_step must be in (0, 1), got {}", self.scale_step);
        }
        if !(self.min_scale > 0.0 && self.min_scale <= 1.0) {
            bail!("min_scale must be in (0, 1], got {}", self.min_scale);
        }
        if !(self.safety_margin > 0.0 && self.safety_margin < 1.0) {
            bail!("safety_margin must be in (0, 1), got {}", self.safety_margin);
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be positive");
        }
        if self.reload_every_timeouts == 0
            || self.reload_every_successes == 0
            || self.cleanup_every_successes == 0
        {
            bail!("reload and cleanup cadences must be positive");
        }
        if self.worker_command.is_empty() {
            bail!("worker_command must name a program");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn timeout_dir(&self) -> PathBuf {
        self.skip_dir.join("timeout_failures")
    }

    pub fn failure_dir(&self) -> PathBuf {
        self.skip_dir.join("bad_frames")
    }
}
