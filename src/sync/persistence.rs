//! Debounced persistence of document text to the project directory.
//!
//! A burst of content mutations arms a single deadline; when it passes the
//! document writes its full text to disk and touches the project metadata.
//! The scheduler only tracks timing and the last error. The owning document
//! actor performs the flush, so flushing is serialized with every other
//! mutation of that document.

use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors that can occur while persisting a document
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to read text of the document: {0}")]
    Snapshot(String),

    #[error("Failed to update metadata {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },
}

/// Per-document debounce state
#[derive(Debug)]
pub struct PersistenceScheduler {
    debounce: Duration,
    deadline: Option<Instant>,
    /// Mutations not yet written successfully
    unsaved: bool,
    last_error: Option<String>,
}

impl PersistenceScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            deadline: None,
            unsaved: false,
            last_error: None,
        }
    }

    /// Arm the flush deadline unless one is already pending
    pub fn on_mutation(&mut self) {
        self.unsaved = true;
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.debounce);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn has_unsaved(&self) -> bool {
        self.unsaved
    }

    /// The text written covered every mutation so far
    pub fn mark_saved(&mut self) {
        self.unsaved = false;
    }

    /// Resolves when the armed deadline passes; never resolves when disarmed
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn record_error(&mut self, error: impl ToString) {
        self.last_error = Some(error.to_string());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}

/// Outcome of a flush whose content write succeeded
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Metadata could not be updated; content is still on disk
    pub metadata_error: Option<PersistError>,
}

/// Write `text` to `path`, then best-effort bump `updatedAt` in `metadata_path`
pub async fn write_snapshot(
    path: &Path,
    metadata_path: Option<&Path>,
    text: &str,
) -> Result<FlushReport, PersistError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| PersistError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    tokio::fs::write(path, text.as_bytes())
        .await
        .map_err(|source| PersistError::Write {
            path: path.to_path_buf(),
            source,
        })?;

    let metadata_error = match metadata_path {
        Some(meta) => touch_metadata(meta).await.err(),
        None => None,
    };

    Ok(FlushReport { metadata_error })
}

/// Set `updatedAt` in a JSON metadata file, preserving all other fields
pub async fn touch_metadata(path: &Path) -> Result<(), PersistError> {
    let metadata_err = |reason: String| PersistError::Metadata {
        path: path.to_path_buf(),
        reason,
    };

    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        // Projects without a metadata file have nothing to touch
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(metadata_err(e.to_string())),
    };
    let mut meta: Value = serde_json::from_slice(&raw).map_err(|e| metadata_err(e.to_string()))?;

    let object = meta
        .as_object_mut()
        .ok_or_else(|| metadata_err("not a JSON object".to_string()))?;
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    object.insert("updatedAt".to_string(), Value::String(now));

    let encoded = serde_json::to_vec_pretty(&meta).map_err(|e| metadata_err(e.to_string()))?;
    tokio::fs::write(path, encoded)
        .await
        .map_err(|e| metadata_err(e.to_string()))
}
