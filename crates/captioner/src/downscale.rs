use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

/// Produces reduced-resource variants of an item. The caller owns the returned file.
#[async_trait]
pub trait Downscaler: Send + Sync {
    async fn downscale(&self, item: &Path, scale: f64, work_dir: &Path) -> Result<PathBuf>;
}

/// Deterministic variant location: `<work_dir>/scaled_<pct>pct_<name>`
pub fn variant_path(item: &Path, scale: f64, work_dir: &Path) -> PathBuf {
    let name = item
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "item".to_string());
    work_dir.join(format!("scaled_{:.0}pct_{}", scale * 100.0, name))
}

/// ffmpeg scale filter keeping both dimensions even (required by libx264)
pub fn scale_filter(scale: f64) -> String {
    format!("scale=trunc(iw*{s}/2)*2:trunc(ih*{s}/2)*2", s = scale)
}

/// Downscaler backed by the ffmpeg binary
pub struct FfmpegDownscaler {
    ffmpeg_bin: PathBuf,
}

impl FfmpegDownscaler {
    pub fn new(ffmpeg_bin: PathBuf) -> Self {
        Self { ffmpeg_bin }
    }
}

#[async_trait]
impl Downscaler for FfmpegDownscaler {
    async fn downscale(&self, item: &Path, scale: f64, work_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create work directory: {}", work_dir.display()))?;
        let output_path = variant_path(item, scale, work_dir);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(item)
            .arg("-vf")
            .arg(scale_filter(scale))
            .args(["-c:v", "libx264", "-preset", "fast", "-crf", "23"])
            .args(["-avoid_negative_ts", "make_zero"])
            .arg(&output_path);

        debug!("ffmpeg downscale: {} → {} ({})", item.display(), output_path.display(), scale_filter(scale));

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute ffmpeg for: {}", item.display()))?;

        if !output.status.success() {
            // don't leave a truncated variant behind
            let _ = fs::remove_file(&output_path);
            anyhow::bail!(
                "ffmpeg downscale failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                item.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_encode_scale_and_source() {
        let work = Path::new("/tmp/work");
        assert_eq!(
            variant_path(Path::new("/videos/beach.mp4"), 0.7, work),
            PathBuf::from("/tmp/work/scaled_70pct_beach.mp4")
        );
        assert_eq!(
            variant_path(Path::new("/videos/beach.mp4"), 0.7, work),
            variant_path(Path::new("/other/beach.mp4"), 0.7, work)
        );
        assert_ne!(
            variant_path(Path::new("/videos/beach.mp4"), 0.5, work),
            variant_path(Path::new("/videos/beach.mp4"), 0.6, work)
        );
    }

    #[test]
    fn filter_keeps_even_dimensions() {
        assert_eq!(scale_filter(0.5), "scale=trunc(iw*0.5/2)*2:trunc(ih*0.5/2)*2");
    }
}
