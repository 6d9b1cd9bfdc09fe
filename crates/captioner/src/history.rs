//! Durable log of out-of-memory failures.
//!
//! The whole history is one JSON array, read once at startup and rewritten in full on
//! every append. Appends are synchronous: the file is written to a sibling temp file,
//! synced, and renamed over the old one before `append` returns.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::item::ItemAttributes;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to read failure history {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse failure history {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist failure history {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode failure history: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Attributes of an item at the moment it ran out of memory at full scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item: PathBuf,
    #[serde(flatten)]
    pub attributes: ItemAttributes,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(item: &Path, attributes: &ItemAttributes) -> Self {
        Self {
            item: item.to_path_buf(),
            attributes: attributes.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct FailureHistoryStore {
    path: PathBuf,
    records: Vec<FailureRecord>,
}

impl FailureHistoryStore {
    /// Load the history at `path`; a missing file is an empty history
    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        if !path.exists() {
            debug!("No failure history at {}, starting empty", path.display());
            return Ok(Self::empty(path));
        }

        let content = fs::read_to_string(path).map_err(|source| HistoryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let records: Vec<FailureRecord> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&content).map_err(|source| HistoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };

        info!("Loaded {} failure record(s) from {}", records.len(), path.display());
        Ok(Self { path: path.to_path_buf(), records })
    }

    pub fn empty(path: &Path) -> Self {
        Self { path: path.to_path_buf(), records: Vec::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record and persist the full history before returning.
    ///
    /// On a write failure the in-memory history is left unchanged.
    pub fn append(&mut self, record: FailureRecord) -> Result<(), HistoryError> {
        self.records.push(record);
        if let Err(e) = self.persist() {
            self.records.pop();
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), HistoryError> {
        let json = serde_json::to_string_pretty(&self.records)?;
        let write_err = |source: std::io::Error| HistoryError::Write { path: self.path.clone(), source };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = File::create(&tmp_path).map_err(write_err)?;
        file.write_all(json.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        fs::rename(&tmp_path, &self.path).map_err(write_err)?;

        debug!("Persisted {} failure record(s) to {}", self.records.len(), self.path.display());
        Ok(())
    }
}
