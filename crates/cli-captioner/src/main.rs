use anyhow::{Context, Result};
use clap::Parser;
use captioner::{
    config::CaptionConfig,
    controller::{RetryController, RetryPolicy},
    downscale::FfmpegDownscaler,
    driver::{Cadence, QueueDriver},
    ffprobe::FfprobeProber,
    history::FailureHistoryStore,
    lifecycle::WorkerLifecycle,
    process_worker::ProcessWorkerFactory,
    quarantine::Quarantine,
    risk::RiskPredictor,
    scan,
    sink::{OutputFormat, OutputSink},
    worker::InferenceOptions,
};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use log::{info, warn, error};
use uuid::Uuid;

/// Caption every video; leave already-captioned ones untouched, handle OOM with downscaling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory of videos to caption
    input: PathBuf,

    /// Caption file (jsonl) or caption directory (txt)
    output: PathBuf,

    /// Output format: jsonl or txt
    #[arg(long)]
    format: Option<String>,

    /// Frame-sampling FPS (the worker reads the raw video if omitted)
    #[arg(long)]
    fps: Option<f64>,

    /// Upper bound on pixels per frame passed to the worker
    #[arg(long)]
    max_pixels: Option<u64>,

    /// Device the worker loads onto
    #[arg(long)]
    device: Option<String>,

    /// Root of the quarantine directories
    #[arg(long)]
    skip_dir: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker program and arguments (must come last)
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    worker_cmd: Option<Vec<String>>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = build_config(&args)?;

    info!("🎬 Video captioner starting");
    info!("Configuration loaded:");
    info!("  Input: {}", args.input.display());
    info!("  Output: {} ({:?})", args.output.display(), cfg.output_format);
    info!("  Device: {}", cfg.device);
    info!("  Skip dir: {}", cfg.skip_dir.display());
    info!("  History: {}", cfg.history_path.display());
    info!("  Timeout: {}s, scale step {}, minimum scale {}", cfg.timeout_secs, cfg.scale_step, cfg.min_scale);

    fs::create_dir_all(&cfg.skip_dir)
        .with_context(|| format!("Failed to create skip directory: {}", cfg.skip_dir.display()))?;

    let work_dir = cfg
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("scaled_videos_{}", Uuid::new_v4())));
    fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create work directory: {}", work_dir.display()))?;

    let result = run(&args, &cfg, &work_dir).await;

    if let Err(e) = fs::remove_dir_all(&work_dir) {
        warn!("Could not remove work directory {}: {}", work_dir.display(), e);
    }

    result
}

fn build_config(args: &Args) -> Result<CaptionConfig> {
    let mut cfg = CaptionConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(format) = &args.format {
        cfg.output_format = format.parse::<OutputFormat>()?;
    }
    if args.fps.is_some() {
        cfg.fps = args.fps;
    }
    if args.max_pixels.is_some() {
        cfg.max_pixels = args.max_pixels;
    }
    if let Some(device) = &args.device {
        cfg.device = device.clone();
    }
    if let Some(skip_dir) = &args.skip_dir {
        cfg.skip_dir = skip_dir.clone();
    }
    if let Some(command) = &args.worker_cmd {
        cfg.worker_command = command.clone();
    }

    cfg.validate().context("Invalid configuration")?;
    Ok(cfg)
}

async fn run(args: &Args, cfg: &CaptionConfig, work_dir: &Path) -> Result<()> {
    let input = fs::canonicalize(&args.input)
        .with_context(|| format!("Input directory does not exist: {}", args.input.display()))?;
    let exclude = [absolute(&cfg.skip_dir), absolute(work_dir)];

    let items = scan::list_items(&input, &exclude).context("Failed to scan input directory")?;
    if items.is_empty() {
        warn!("⚠️  No videos found in {}", input.display());
        return Ok(());
    }
    info!("🎬 Found {} video(s)", items.len());

    // Acquiring the output location is the one fatal precondition
    let sink = OutputSink::open(cfg.output_format, &args.output)
        .with_context(|| format!("Cannot use output location: {}", args.output.display()))?;

    let predictor = match FailureHistoryStore::load(&cfg.history_path) {
        Ok(store) => RiskPredictor::new(store, cfg),
        Err(e) => {
            error!("❌ {}; predicting from defaults without learning", e);
            RiskPredictor::new(FailureHistoryStore::empty(&cfg.history_path), cfg).into_degraded()
        }
    };

    let controller = RetryController::new(
        Box::new(FfprobeProber::new(cfg.ffprobe_bin.clone())),
        Box::new(FfmpegDownscaler::new(cfg.ffmpeg_bin.clone())),
        predictor,
        RetryPolicy::from_config(cfg),
        InferenceOptions::from_config(cfg),
        work_dir.to_path_buf(),
    );
    let quarantine = Quarantine::new(cfg.timeout_dir(), cfg.failure_dir());
    let mut driver = QueueDriver::new(controller, sink, quarantine, Cadence::from_config(cfg));

    let factory = ProcessWorkerFactory::new(
        cfg.worker_command.clone(),
        Duration::from_secs(cfg.worker_load_timeout_secs),
    )
    .with_cancel_grace(Duration::from_millis(cfg.cancel_grace_ms));
    let mut lifecycle = WorkerLifecycle::new(
        Box::new(factory),
        cfg.device.clone(),
        Duration::from_millis(cfg.reload_pause_ms),
    );

    info!("🔮 Loading worker on {}...", cfg.device);
    lifecycle.load().await.context("Failed to load worker")?;

    let result = driver.run(&items, &mut lifecycle).await;
    lifecycle.unload().await;

    let summary = result?;
    println!("\n{}", summary);
    Ok(())
}

/// Absolute form of a possibly relative path, for prefix comparisons during the scan
fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}
