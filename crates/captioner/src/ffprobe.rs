use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;
use crate::item::ItemAttributes;

/// Source of resource attributes for media items
#[async_trait]
pub trait ResourceProber: Send + Sync {
    /// Size, dimensions, frame count and duration of an item
    async fn probe(&self, item: &Path) -> Result<ItemAttributes>;

    /// Exact number of decodable video frames (slow: reads every packet)
    async fn count_frames(&self, item: &Path) -> Result<u64>;
}

/// ffprobe JSON output, limited to the first video stream
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub duration: Option<String>,
    pub size: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub codec_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub nb_frames: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub duration: Option<String>,
}

/// Frame count as reported or estimated from the container
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameCount {
    Reported(u64),
    Estimated(u64),
    Unknown,
}

impl FFProbeData {
    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Duration from the video stream, falling back to the container
    pub fn duration_secs(&self) -> Option<f64> {
        self.video_stream()
            .and_then(|s| s.duration.as_deref())
            .or_else(|| self.format.as_ref().and_then(|f| f.duration.as_deref()))
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
    }

    /// Frame count from `nb_frames`, else duration × average frame rate
    pub fn frame_count(&self) -> FrameCount {
        let Some(stream) = self.video_stream() else {
            return FrameCount::Unknown;
        };
        if let Some(n) = stream.nb_frames.as_deref().and_then(|n| n.parse::<u64>().ok()) {
            return FrameCount::Reported(n);
        }
        match (self.duration_secs(), stream.avg_frame_rate.as_deref().and_then(parse_frame_rate)) {
            (Some(duration), Some(fps)) => FrameCount::Estimated((duration * fps).round() as u64),
            _ => FrameCount::Unknown,
        }
    }
}

/// Parse ffprobe rationals like "30000/1001" or plain numbers
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse::<f64>().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Prober backed by the ffprobe binary
pub struct FfprobeProber {
    ffprobe_bin: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe_bin: PathBuf) -> Self {
        Self { ffprobe_bin }
    }

    async fn run(&self, args: &[&str], file_path: &Path) -> Result<String> {
        if !file_path.exists() {
            anyhow::bail!("File does not exist: {}", file_path.display());
        }

        let output = Command::new(&self.ffprobe_bin)
            .args(args)
            .arg(file_path)
            .output()
            .await
            .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "ffprobe failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                file_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")
    }

    /// Run ffprobe and parse the JSON description of the first video stream
    pub async fn probe_file(&self, file_path: &Path) -> Result<FFProbeData> {
        let json_str = self
            .run(
                &["-v", "error", "-select_streams", "v:0", "-print_format", "json", "-show_streams", "-show_format"],
                file_path,
            )
            .await?;

        serde_json::from_str(&json_str)
            .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))
    }
}

#[async_trait]
impl ResourceProber for FfprobeProber {
    async fn probe(&self, item: &Path) -> Result<ItemAttributes> {
        let data = self.probe_file(item).await?;
        let stream = data
            .video_stream()
            .with_context(|| format!("No video stream in {}", item.display()))?;

        let frame_count = match data.frame_count() {
            FrameCount::Reported(n) | FrameCount::Estimated(n) => Some(n),
            FrameCount::Unknown => {
                debug!("No frame count in container for {}, counting packets", item.display());
                self.count_frames(item).await.ok()
            }
        };

        let size_bytes = match data.format.as_ref().and_then(|f| f.size.as_deref()).and_then(|s| s.parse().ok()) {
            Some(size) => size,
            None => std::fs::metadata(item)
                .with_context(|| format!("Failed to stat file: {}", item.display()))?
                .len(),
        };

        Ok(ItemAttributes {
            size_bytes,
            width: stream.width.unwrap_or(0),
            height: stream.height.unwrap_or(0),
            frame_count,
            duration_secs: data.duration_secs(),
        })
    }

    async fn count_frames(&self, item: &Path) -> Result<u64> {
        let out = self
            .run(
                &["-v", "error", "-select_streams", "v:0", "-count_packets", "-show_entries", "stream=nb_read_packets", "-of", "csv=p=0"],
                item,
            )
            .await?;

        // some containers print a trailing separator
        let first = out.trim().split([',', '\n']).next().unwrap_or("").trim();
        first
            .parse::<u64>()
            .with_context(|| format!("Unexpected packet count {:?} for {}", out.trim(), item.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> FFProbeData {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn reported_frame_count_wins() {
        let data = parse(r#"{
            "streams": [{"codec_type": "video", "width": 1920, "height": 1080,
                         "nb_frames": "1440", "avg_frame_rate": "24/1", "duration": "60.0"}],
            "format": {"duration": "60.5", "size": "123456"}
        }"#);
        assert_eq!(data.frame_count(), FrameCount::Reported(1440));
        assert_eq!(data.duration_secs(), Some(60.0));
    }

    #[test]
    fn frame_count_is_estimated_from_duration() {
        let data = parse(r#"{
            "streams": [{"codec_type": "video", "width": 1280, "height": 720,
                         "avg_frame_rate": "30000/1001"}],
            "format": {"duration": "10.010"}
        }"#);
        assert_eq!(data.frame_count(), FrameCount::Estimated(300));
    }

    #[test]
    fn missing_video_stream_is_unknown() {
        let data = parse(r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "3.0"}}"#);
        assert!(data.video_stream().is_none());
        assert_eq!(data.frame_count(), FrameCount::Unknown);
    }

    #[test]
    fn frame_rates() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }
}
