use std::path::{Path, PathBuf};
use anyhow::Result;
use walkdir::WalkDir;
use log::{debug, info, warn};

/// Video file extensions considered for captioning
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "flv", "m4v"];

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .map_or(false, |ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// List media files under `root`, sorted by path.
///
/// Anything below one of the `exclude` directories (quarantine, work dir) is left out.
pub fn list_items(root: &Path, exclude: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        anyhow::bail!("Input directory does not exist: {}", root.display());
    }

    info!("Scanning directory: {}", root.display());

    let mut items = Vec::new();
    let mut entry_count = 0;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !exclude.iter().any(|dir| e.path().starts_with(dir)));

    for entry in walker {
        entry_count += 1;
        if entry_count % 1000 == 0 {
            info!("Scanned {} entries so far in {}...", entry_count, root.display());
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !entry.file_type().is_file() || !is_media_file(path) {
            continue;
        }

        debug!("Found media file: {}", path.display());
        items.push(path.to_path_buf());
    }

    items.sort();
    info!("Scan complete: {} entries, {} media files", entry_count, items.len());
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn extensions_are_case_insensitive() {
        assert!(is_media_file(Path::new("a/B.MP4")));
        assert!(is_media_file(Path::new("clip.flv")));
        assert!(!is_media_file(Path::new("notes.txt")));
        assert!(!is_media_file(Path::new("noext")));
    }

    #[test]
    fn lists_sorted_and_skips_excluded_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("skipped_videos/bad_frames")).unwrap();
        fs::write(root.join("b.mp4"), b"x").unwrap();
        fs::write(root.join("sub/a.mkv"), b"x").unwrap();
        fs::write(root.join("readme.md"), b"x").unwrap();
        fs::write(root.join("skipped_videos/bad_frames/c.mp4"), b"x").unwrap();

        let items = list_items(root, &[root.join("skipped_videos")]).unwrap();

        assert_eq!(items, vec![root.join("b.mp4"), root.join("sub/a.mkv")]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(list_items(&tmp.path().join("nope"), &[]).is_err());
    }
}
