//! Sequential backlog loop: idempotence, quarantine and worker cadence.

use std::fmt;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use crate::config::CaptionConfig;
use crate::controller::{RetryController, Terminal};
use crate::lifecycle::{ReloadPolicy, WorkerLifecycle};
use crate::quarantine::{Quarantine, QuarantineKind};
use crate::sink::OutputSink;

/// What happened to one item in one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    TimedOut,
    Unprocessable,
    /// Already captioned by an earlier run
    Skipped,
}

/// Worker maintenance schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub reload: ReloadPolicy,
    /// Non-reload reclamation pass every M successes
    pub cleanup_every_successes: u32,
}

impl Cadence {
    pub fn from_config(cfg: &CaptionConfig) -> Self {
        Self {
            reload: ReloadPolicy {
                every_timeouts: cfg.reload_every_timeouts,
                every_successes: cfg.reload_every_successes,
            },
            cleanup_every_successes: cfg.cleanup_every_successes,
        }
    }

    fn cleanup_due(&self, successes: u32) -> bool {
        self.cleanup_every_successes > 0 && successes > 0 && successes % self.cleanup_every_successes == 0
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            reload: ReloadPolicy::default(),
            cleanup_every_successes: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub failed: usize,
    pub worker_reloads: u32,
    pub worker_invocations: usize,
    pub output: PathBuf,
    pub timeout_dir: PathBuf,
    pub failure_dir: PathBuf,
    pub dispositions: Vec<(PathBuf, Disposition)>,
}

impl RunSummary {
    pub fn disposition(&self, item: &Path) -> Option<Disposition> {
        self.dispositions
            .iter()
            .find(|(path, _)| path == item)
            .map(|(_, d)| *d)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "✅  {} captioned, {} already done, {} timed out, {} unprocessable",
            self.succeeded, self.skipped, self.timed_out, self.failed
        )?;
        writeln!(
            f,
            "🧠  {} worker invocation(s), {} reload(s)",
            self.worker_invocations, self.worker_reloads
        )?;
        writeln!(f, "📝  Captions stored at → {}", self.output.display())?;
        if self.failed > 0 {
            writeln!(f, "⚠️   Uncaptionable videos moved to → {}", self.failure_dir.display())?;
        }
        if self.timed_out > 0 {
            writeln!(f, "⏰  Timed-out videos moved to → {}", self.timeout_dir.display())?;
        }
        Ok(())
    }
}

pub struct QueueDriver {
    controller: RetryController,
    sink: OutputSink,
    quarantine: Quarantine,
    cadence: Cadence,
}

impl QueueDriver {
    pub fn new(controller: RetryController, sink: OutputSink, quarantine: Quarantine, cadence: Cadence) -> Self {
        Self {
            controller,
            sink,
            quarantine,
            cadence,
        }
    }

    pub fn controller(&self) -> &RetryController {
        &self.controller
    }

    /// Process `items` in order, one at a time.
    ///
    /// Only sink writes and worker (re)loads can fail the run; every per-item failure
    /// ends in a disposition.
    pub async fn run(&mut self, items: &[PathBuf], lifecycle: &mut WorkerLifecycle) -> Result<RunSummary> {
        let mut summary = RunSummary {
            output: self.sink.location().to_path_buf(),
            timeout_dir: self.quarantine.dir(QuarantineKind::Timeout).to_path_buf(),
            failure_dir: self.quarantine.dir(QuarantineKind::Failure).to_path_buf(),
            ..RunSummary::default()
        };

        let mut timeouts = 0u32;
        let mut successes = 0u32;
        let mut successes_since_load = 0u32;

        for (n, item) in items.iter().enumerate() {
            if self.sink.is_done(item) {
                debug!("Already captioned, leaving {} alone", item.display());
                summary.skipped += 1;
                summary.dispositions.push((item.clone(), Disposition::Skipped));
                continue;
            }

            if !lifecycle.is_loaded() {
                lifecycle.load().await.context("Failed to load worker")?;
            } else if !lifecycle.is_healthy() {
                warn!("Worker is no longer alive");
                lifecycle.reload("worker exited").await.context("Failed to reload worker")?;
                summary.worker_reloads += 1;
                successes_since_load = 0;
            }

            info!("🎬 [{}/{}] {}", n + 1, items.len(), item.display());
            let worker = lifecycle.worker()?;
            let report = self.controller.process(item, worker).await;
            summary.worker_invocations += report.worker_invocations();

            let disposition = match report.terminal {
                Terminal::Succeeded(caption) => {
                    if let Err(e) = self.sink.write(item, &caption) {
                        error!("❌ Could not store caption for {}: {:#}", item.display(), e);
                        error!("Stopping early; results so far:\n{}", summary);
                        return Err(e).with_context(|| {
                            format!("Run stopped at item {} of {} ({})", n + 1, items.len(), item.display())
                        });
                    }
                    successes += 1;
                    successes_since_load += 1;

                    if self.cadence.reload.after_success(successes_since_load) {
                        lifecycle
                            .reload(&format!("{} successes", successes_since_load))
                            .await
                            .context("Failed to reload worker")?;
                        summary.worker_reloads += 1;
                        successes_since_load = 0;
                    } else if self.cadence.cleanup_due(successes) {
                        info!("🧹 Periodic cleanup after {} videos", successes);
                        lifecycle.reclaim().await;
                    }
                    Disposition::Succeeded
                }
                Terminal::TimedOut => {
                    let reason = format!(
                        "no caption within {}s",
                        self.controller.policy().timeout.as_secs_f64()
                    );
                    self.quarantine_item(item, QuarantineKind::Timeout, &reason);
                    timeouts += 1;

                    if self.cadence.reload.after_timeout(timeouts) {
                        lifecycle
                            .reload(&format!("{} timeouts", timeouts))
                            .await
                            .context("Failed to reload worker")?;
                        summary.worker_reloads += 1;
                        successes_since_load = 0;
                    }
                    Disposition::TimedOut
                }
                Terminal::GivingUp(reason) => {
                    self.quarantine_item(item, QuarantineKind::Failure, &reason);
                    Disposition::Unprocessable
                }
            };

            match disposition {
                Disposition::Succeeded => summary.succeeded += 1,
                Disposition::TimedOut => summary.timed_out += 1,
                Disposition::Unprocessable => summary.failed += 1,
                Disposition::Skipped => summary.skipped += 1,
            }
            summary.dispositions.push((item.clone(), disposition));
        }

        info!(
            "Run complete: {} succeeded, {} skipped, {} timed out, {} unprocessable",
            summary.succeeded, summary.skipped, summary.timed_out, summary.failed
        );
        Ok(summary)
    }

    /// A failed move leaves the item where it is; the next run sees it again
    fn quarantine_item(&self, item: &Path, kind: QuarantineKind, reason: &str) {
        if let Err(e) = self.quarantine.move_item(item, kind, reason) {
            error!("❌ Could not quarantine {}: {:#}", item.display(), e);
        }
    }
}
