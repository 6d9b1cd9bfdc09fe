use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};

/// Which holding area an item is moved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineKind {
    /// The worker did not answer within the timeout
    Timeout,
    /// The item could not be captioned (too few frames, persistent OOM, worker error)
    Failure,
}

/// Holding areas for items that could not be captioned
#[derive(Debug, Clone)]
pub struct Quarantine {
    timeout_dir: PathBuf,
    failure_dir: PathBuf,
}

impl Quarantine {
    pub fn new(timeout_dir: PathBuf, failure_dir: PathBuf) -> Self {
        Self { timeout_dir, failure_dir }
    }

    pub fn dir(&self, kind: QuarantineKind) -> &Path {
        match kind {
            QuarantineKind::Timeout => &self.timeout_dir,
            QuarantineKind::Failure => &self.failure_dir,
        }
    }

    /// Move `item` into the holding area and leave a `.why.txt` next to it.
    ///
    /// Returns the new location. An existing file of the same name is never overwritten.
    pub fn move_item(&self, item: &Path, kind: QuarantineKind, reason: &str) -> Result<PathBuf> {
        let dir = self.dir(kind);
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create quarantine directory: {}", dir.display()))?;

        let file_name = item
            .file_name()
            .with_context(|| format!("Item has no file name: {}", item.display()))?;
        let dest = unique_destination(dir, Path::new(file_name));

        move_file(item, &dest)?;
        // the item has already moved; a missing reason file must not undo that
        if let Err(e) = write_why_txt(&dest, reason) {
            warn!("Moved {} without a reason file: {:#}", dest.display(), e);
        }

        info!("📦 Moved {} → {} ({})", item.display(), dest.display(), reason);
        Ok(dest)
    }
}

/// Get the path to the why.txt file for a given media file
pub fn why_txt_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file explaining why a file was quarantined
pub fn write_why_txt(file_path: &Path, reason: &str) -> Result<()> {
    let why_path = why_txt_path(file_path);
    fs::write(&why_path, format!("{}\n", reason))
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}

fn unique_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = file_name.file_stem().and_then(|s| s.to_str()).unwrap_or("item");
    let ext = file_name.extension().and_then(|s| s.to_str());
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{}-{}.{}", stem, n, ext)),
            None => dir.join(format!("{}-{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

const EXDEV: i32 = 18;

/// Rename, falling back to copy + delete across filesystems
fn move_file(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            debug!("Cross-device move for {}, copying instead", from.display());
            fs::copy(from, to)
                .with_context(|| format!("Failed to copy {} → {}", from.display(), to.display()))?;
            fs::remove_file(from)
                .with_context(|| format!("Failed to remove {} after copy", from.display()))?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to move {} → {}", from.display(), to.display())),
    }
}
