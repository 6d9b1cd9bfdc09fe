//! Per-item retry state machine: Start → Scaling(scale) → {Succeeded, TimedOut, GivingUp}.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use crate::config::CaptionConfig;
use crate::downscale::Downscaler;
use crate::executor::{self, Outcome};
use crate::ffprobe::ResourceProber;
use crate::item::{ItemAttributes, Percent, Variant};
use crate::risk::{RiskAssessment, RiskPredictor};
use crate::worker::{InferenceOptions, InferenceWorker};

/// Scales are kept on a micro grid so repeated subtraction cannot drift past the floor
const SCALE_GRID: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub scale_step: f64,
    pub min_scale: f64,
    /// Pause after an exhaustion before the downscaled retry
    pub oom_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &CaptionConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
            scale_step: cfg.scale_step,
            min_scale: cfg.min_scale,
            oom_backoff: Duration::from_millis(cfg.oom_backoff_ms),
        }
    }

    /// Next scale after an exhaustion at `scale`, or None when it would fall below the floor
    pub fn next_scale(&self, scale: f64) -> Option<f64> {
        let next = ((scale - self.scale_step) * SCALE_GRID).round() / SCALE_GRID;
        (next > 0.0 && next >= self.min_scale - 1.0 / SCALE_GRID).then_some(next)
    }
}

/// Terminal state of one item
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Succeeded(String),
    TimedOut,
    GivingUp(String),
}

/// One executed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleAttempt {
    pub scale: f64,
    pub outcome: Outcome,
}

/// Everything the driver needs to dispose of an item
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub item: PathBuf,
    pub terminal: Terminal,
    pub attempts: Vec<ScaleAttempt>,
    pub assessment: Option<RiskAssessment>,
}

impl ItemReport {
    /// Attempts that actually reached the worker
    pub fn worker_invocations(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| !matches!(a.outcome, Outcome::PermanentSkip(_)))
            .count()
    }
}

pub struct RetryController {
    prober: Box<dyn ResourceProber>,
    downscaler: Box<dyn Downscaler>,
    predictor: RiskPredictor,
    policy: RetryPolicy,
    options: InferenceOptions,
    work_dir: PathBuf,
}

impl RetryController {
    pub fn new(
        prober: Box<dyn ResourceProber>,
        downscaler: Box<dyn Downscaler>,
        predictor: RiskPredictor,
        policy: RetryPolicy,
        options: InferenceOptions,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            prober,
            downscaler,
            predictor,
            policy,
            options,
            work_dir,
        }
    }

    pub fn predictor(&self) -> &RiskPredictor {
        &self.predictor
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive one item to a terminal state. No variant outlives this call.
    pub async fn process(&mut self, item: &Path, worker: &mut dyn InferenceWorker) -> ItemReport {
        let mut attempts = Vec::new();

        let attributes = match self.prober.probe(item).await {
            Ok(attrs) => {
                debug!(
                    "Probed {}: {}, {}x{}, {} frames",
                    item.display(),
                    format_size(attrs.size_bytes, DECIMAL),
                    attrs.width,
                    attrs.height,
                    attrs.frame_count.map_or_else(|| "?".to_string(), |n| n.to_string())
                );
                Some(attrs)
            }
            Err(e) => {
                warn!("Could not probe {}, starting at full scale: {:#}", item.display(), e);
                None
            }
        };

        let assessment = attributes.as_ref().map(|attrs| self.predictor.assess_risk(attrs));
        let eager_scale = match &assessment {
            // a floor of 1.0 clamps every suggestion back to the original
            Some(risk) if risk.is_risky && risk.suggested_scale < 1.0 => {
                info!(
                    "⚠️  {} looks risky ({}), starting at {}",
                    item.display(),
                    risk.reason,
                    Percent(risk.suggested_scale)
                );
                Some(risk.suggested_scale)
            }
            _ => None,
        };
        let mut variant = match eager_scale {
            Some(scale) => match self.materialize(item, scale).await {
                Ok(v) => v,
                Err(reason) => return report(item, Terminal::GivingUp(reason), attempts, assessment),
            },
            None => Variant::Original(item.to_path_buf()),
        };

        loop {
            let scale = scale_of(&variant);
            debug!("Attempting {} at {}", item.display(), Percent(scale));

            let outcome = executor::attempt(
                self.prober.as_ref(),
                worker,
                variant.path(),
                &self.options,
                self.policy.timeout,
            )
            .await;
            debug!("{} at {}: {}", item.display(), Percent(scale), outcome);
            attempts.push(ScaleAttempt { scale, outcome: outcome.clone() });

            let terminal = match outcome {
                Outcome::Success(caption) => {
                    info!("✅ Captioned {} at {}", item.display(), Percent(scale));
                    Terminal::Succeeded(caption)
                }
                Outcome::Timeout => {
                    warn!("⏱️  {} timed out at {} after {}s", item.display(), Percent(scale), self.policy.timeout.as_secs_f64());
                    Terminal::TimedOut
                }
                Outcome::PermanentSkip(detail) => {
                    warn!("🚫 {} is unprocessable: {}", item.display(), detail);
                    Terminal::GivingUp(detail)
                }
                Outcome::OtherFailure(detail) => {
                    warn!("❌ {} failed at {}: {}", item.display(), Percent(scale), detail);
                    Terminal::GivingUp(detail)
                }
                Outcome::ResourceExhausted(detail) => {
                    warn!("💥 {} ran out of memory at {}: {}", item.display(), Percent(scale), detail);
                    if scale >= 1.0 {
                        self.learn(item, attributes.as_ref());
                    }

                    match self.policy.next_scale(scale) {
                        None => Terminal::GivingUp(format!(
                            "out of memory down to {} (minimum {})",
                            Percent(scale),
                            Percent(self.policy.min_scale)
                        )),
                        Some(next) => {
                            discard(&variant);
                            if !self.policy.oom_backoff.is_zero() {
                                tokio::time::sleep(self.policy.oom_backoff).await;
                            }
                            match self.materialize(item, next).await {
                                Ok(v) => {
                                    variant = v;
                                    continue;
                                }
                                Err(reason) => {
                                    return report(item, Terminal::GivingUp(reason), attempts, assessment);
                                }
                            }
                        }
                    }
                }
            };

            discard(&variant);
            return report(item, terminal, attempts, assessment);
        }
    }

    fn learn(&mut self, item: &Path, attributes: Option<&ItemAttributes>) {
        let Some(attrs) = attributes else {
            warn!("No attributes for {}, failure not recorded", item.display());
            return;
        };
        if let Err(e) = self.predictor.record_failure(item, attrs) {
            warn!("Failure for {} not persisted: {}", item.display(), e);
        }
    }

    async fn materialize(&self, item: &Path, scale: f64) -> Result<Variant, String> {
        match self.downscaler.downscale(item, scale, &self.work_dir).await {
            Ok(path) => {
                debug!("Downscaled {} to {} at {}", item.display(), Percent(scale), path.display());
                Ok(Variant::Downscaled { path, scale })
            }
            Err(e) => {
                warn!("❌ Could not downscale {} to {}: {:#}", item.display(), Percent(scale), e);
                Err(format!("downscale to {} failed: {:#}", Percent(scale), e))
            }
        }
    }
}

fn scale_of(variant: &Variant) -> f64 {
    match variant {
        Variant::Original(_) => 1.0,
        Variant::Downscaled { scale, .. } => *scale,
    }
}

/// Delete a downscaled variant; originals are never touched
fn discard(variant: &Variant) {
    if let Variant::Downscaled { path, .. } = variant {
        if let Err(e) = fs::remove_file(path) {
            debug!("Could not remove variant {}: {}", path.display(), e);
        }
    }
}

fn report(item: &Path, terminal: Terminal, attempts: Vec<ScaleAttempt>, assessment: Option<RiskAssessment>) -> ItemReport {
    ItemReport {
        item: item.to_path_buf(),
        terminal,
        attempts,
        assessment,
    }
}
