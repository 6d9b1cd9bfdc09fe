use std::fmt;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Resource attributes of a media item, as reported by the prober.
///
/// Attributes are advisory inputs to risk scoring: the frame count in particular
/// may be an estimate when the container does not carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAttributes {
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub frame_count: Option<u64>,
    pub duration_secs: Option<f64>,
}

impl ItemAttributes {
    /// Total pixel volume (width × height × frames), if the frame count is known
    pub fn total_pixels(&self) -> Option<u64> {
        self.frame_count
            .map(|frames| self.width as u64 * self.height as u64 * frames)
    }
}

/// The media actually handed to the worker for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    /// The untouched source file
    Original(PathBuf),
    /// A downscaled derivative living in the work directory (owned by the caller)
    Downscaled { path: PathBuf, scale: f64 },
}

impl Variant {
    pub fn path(&self) -> &Path {
        match self {
            Variant::Original(path) => path,
            Variant::Downscaled { path, .. } => path,
        }
    }
}

/// Render a scale factor as a whole percentage ("70%")
pub struct Percent(pub f64);

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.0 * 100.0)
    }
}
