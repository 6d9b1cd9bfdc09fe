//! Out-of-memory risk prediction from past failures.
//!
//! Thresholds are recomputed from the history on every assessment: for each attribute,
//! the smallest value that ever ran out of memory at full scale, times a safety margin.
//! An item exceeding any threshold starts at a reduced scale picked from the worst
//! excess ratio among its attributes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use log::{error, info, warn};
use crate::config::{CaptionConfig, DefaultThresholds};
use crate::history::{FailureHistoryStore, FailureRecord, HistoryError};
use crate::item::ItemAttributes;

/// Attributes the predictor compares against failure history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attribute {
    SizeBytes,
    Width,
    Height,
    FrameCount,
    DurationSecs,
    TotalPixels,
}

impl Attribute {
    pub const ALL: [Attribute; 6] = [
        Attribute::SizeBytes,
        Attribute::Width,
        Attribute::Height,
        Attribute::FrameCount,
        Attribute::DurationSecs,
        Attribute::TotalPixels,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Attribute::SizeBytes => "size_bytes",
            Attribute::Width => "width",
            Attribute::Height => "height",
            Attribute::FrameCount => "frame_count",
            Attribute::DurationSecs => "duration_secs",
            Attribute::TotalPixels => "total_pixels",
        }
    }

    /// Value of this attribute on an item; zero and unknown values are treated as absent
    pub fn value(&self, attrs: &ItemAttributes) -> Option<f64> {
        let v = match self {
            Attribute::SizeBytes => Some(attrs.size_bytes as f64),
            Attribute::Width => Some(attrs.width as f64),
            Attribute::Height => Some(attrs.height as f64),
            Attribute::FrameCount => attrs.frame_count.map(|f| f as f64),
            Attribute::DurationSecs => attrs.duration_secs,
            Attribute::TotalPixels => attrs.total_pixels().map(|p| p as f64),
        };
        v.filter(|v| v.is_finite() && *v > 0.0)
    }

    fn default_threshold(&self, defaults: &DefaultThresholds) -> f64 {
        match self {
            Attribute::SizeBytes => defaults.size_bytes,
            Attribute::Width => defaults.width,
            Attribute::Height => defaults.height,
            Attribute::FrameCount => defaults.frame_count,
            Attribute::DurationSecs => defaults.duration_secs,
            Attribute::TotalPixels => defaults.total_pixels,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-attribute safety thresholds derived from the failure history
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet {
    thresholds: BTreeMap<Attribute, f64>,
}

impl ThresholdSet {
    pub fn derive(records: &[FailureRecord], safety_margin: f64, defaults: &DefaultThresholds) -> Self {
        let thresholds = Attribute::ALL
            .iter()
            .map(|attr| {
                let smallest_failure = records
                    .iter()
                    .filter_map(|r| attr.value(&r.attributes))
                    .fold(None, |min: Option<f64>, v| Some(min.map_or(v, |m| m.min(v))));
                let threshold = match smallest_failure {
                    Some(v) => v * safety_margin,
                    None => attr.default_threshold(defaults),
                };
                (*attr, threshold)
            })
            .collect();
        Self { thresholds }
    }

    pub fn get(&self, attr: Attribute) -> f64 {
        self.thresholds.get(&attr).copied().unwrap_or(f64::INFINITY)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Attribute, f64)> + '_ {
        self.thresholds.iter().map(|(a, t)| (*a, *t))
    }
}

/// Result of scoring one item
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub is_risky: bool,
    pub suggested_scale: f64,
    pub reason: String,
    /// Attribute with the largest excess ratio, when risky
    pub dominant: Option<(Attribute, f64)>,
}

/// Map the dominant excess ratio to an initial scale
pub fn scale_for_ratio(ratio: f64) -> f64 {
    if ratio > 2.0 {
        0.5
    } else if ratio > 1.5 {
        0.7
    } else {
        0.9
    }
}

pub struct RiskPredictor {
    store: FailureHistoryStore,
    safety_margin: f64,
    defaults: DefaultThresholds,
    min_scale: f64,
    degraded: bool,
}

impl RiskPredictor {
    pub fn new(store: FailureHistoryStore, cfg: &CaptionConfig) -> Self {
        Self {
            store,
            safety_margin: cfg.safety_margin,
            defaults: cfg.default_thresholds.clone(),
            min_scale: cfg.min_scale,
            degraded: false,
        }
    }

    /// Predict from `store` but never write to it, e.g. when the history file is unreadable
    pub fn into_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    pub fn history(&self) -> &FailureHistoryStore {
        &self.store
    }

    /// True once a history write has failed; no further failures are recorded
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn thresholds(&self) -> ThresholdSet {
        ThresholdSet::derive(self.store.records(), self.safety_margin, &self.defaults)
    }

    pub fn assess_risk(&self, attrs: &ItemAttributes) -> RiskAssessment {
        let thresholds = self.thresholds();

        let mut dominant: Option<(Attribute, f64)> = None;
        for (attr, threshold) in thresholds.iter() {
            let Some(value) = attr.value(attrs) else { continue };
            if threshold <= 0.0 || value <= threshold {
                continue;
            }
            let ratio = value / threshold;
            // strict comparison keeps the first attribute on ties
            if dominant.map_or(true, |(_, best)| ratio > best) {
                dominant = Some((attr, ratio));
            }
        }

        match dominant {
            None => RiskAssessment {
                is_risky: false,
                suggested_scale: 1.0,
                reason: "all attributes within thresholds".to_string(),
                dominant: None,
            },
            Some((attr, ratio)) => {
                let suggested_scale = scale_for_ratio(ratio).max(self.min_scale);
                RiskAssessment {
                    is_risky: true,
                    suggested_scale,
                    reason: format!(
                        "{} is {:.2}x its threshold of {:.0}",
                        attr, ratio, thresholds.get(attr)
                    ),
                    dominant: Some((attr, ratio)),
                }
            }
        }
    }

    /// Append a full-scale failure to the history, persisting it before returning.
    ///
    /// A write failure switches the predictor to degraded mode: the error is returned
    /// once and later failures are dropped with a warning.
    pub fn record_failure(&mut self, item: &Path, attrs: &ItemAttributes) -> Result<(), HistoryError> {
        if self.degraded {
            warn!("Failure history unavailable, not recording {}", item.display());
            return Ok(());
        }

        match self.store.append(FailureRecord::new(item, attrs)) {
            Ok(()) => {
                info!(
                    "📝 Recorded OOM failure for {} ({} record(s) in {})",
                    item.display(),
                    self.store.len(),
                    self.store.path().display()
                );
                Ok(())
            }
            Err(e) => {
                error!("❌ Failed to persist failure history, continuing without learning: {}", e);
                self.degraded = true;
                Err(e)
            }
        }
    }
}
