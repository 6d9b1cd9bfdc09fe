use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// How captions are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One `{"path", "caption"}` record per line in a single file
    Jsonl,
    /// One `<stem>.txt` per item in an output directory
    Txt,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" => Ok(OutputFormat::Jsonl),
            "txt" => Ok(OutputFormat::Txt),
            other => anyhow::bail!("unknown output format: {}", other),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CaptionRecord {
    path: String,
    caption: String,
}

/// Append-only caption store; doubles as the record of completed items
pub struct OutputSink {
    location: PathBuf,
    kind: SinkKind,
}

enum SinkKind {
    Jsonl { file: File, done: HashSet<String> },
    Txt,
}

impl OutputSink {
    /// Acquire the output location. Failure here is fatal for the run.
    pub fn open(format: OutputFormat, location: &Path) -> Result<Self> {
        let kind = match format {
            OutputFormat::Txt => {
                fs::create_dir_all(location)
                    .with_context(|| format!("Failed to create caption directory: {}", location.display()))?;
                SinkKind::Txt
            }
            OutputFormat::Jsonl => {
                if let Some(parent) = location.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
                }
                let done = read_done_set(location)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(location)
                    .with_context(|| format!("Failed to open caption file: {}", location.display()))?;
                info!("Caption file {} already holds {} item(s)", location.display(), done.len());
                SinkKind::Jsonl { file, done }
            }
        };

        Ok(Self { location: location.to_path_buf(), kind })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Whether a caption for this item is already stored
    pub fn is_done(&self, item: &Path) -> bool {
        match &self.kind {
            SinkKind::Jsonl { done, .. } => done.contains(&key(item)),
            SinkKind::Txt => self.txt_path(item).exists(),
        }
    }

    /// Durably store a caption. Items already present are left untouched.
    pub fn write(&mut self, item: &Path, caption: &str) -> Result<()> {
        if self.is_done(item) {
            debug!("Caption for {} already stored, not writing again", item.display());
            return Ok(());
        }

        let txt_path = self.txt_path(item);
        match &mut self.kind {
            SinkKind::Jsonl { file, done } => {
                let record = CaptionRecord { path: key(item), caption: caption.to_string() };
                let mut line = serde_json::to_string(&record)?;
                line.push('\n');
                file.write_all(line.as_bytes())
                    .with_context(|| format!("Failed to append caption to {}", self.location.display()))?;
                file.sync_data()
                    .with_context(|| format!("Failed to sync caption file {}", self.location.display()))?;
                done.insert(record.path);
            }
            SinkKind::Txt => {
                fs::write(&txt_path, format!("{}\n", caption))
                    .with_context(|| format!("Failed to write caption file: {}", txt_path.display()))?;
            }
        }
        Ok(())
    }

    fn txt_path(&self, item: &Path) -> PathBuf {
        let stem = item.file_stem().unwrap_or(item.as_os_str());
        let mut name = stem.to_os_string();
        name.push(".txt");
        self.location.join(name)
    }
}

fn key(item: &Path) -> String {
    item.to_string_lossy().into_owned()
}

fn read_done_set(path: &Path) -> Result<HashSet<String>> {
    let mut done = HashSet::new();
    if !path.exists() {
        return Ok(done);
    }

    let file = File::open(path)
        .with_context(|| format!("Failed to read caption file: {}", path.display()))?;
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read caption file: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CaptionRecord>(&line) {
            Ok(record) => {
                done.insert(record.path);
            }
            Err(e) => warn!("Ignoring malformed line {} in {}: {}", n + 1, path.display(), e),
        }
    }
    Ok(done)
}
