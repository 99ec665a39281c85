//! On-disk checkpoint storage.
//!
//! Writes go through a per-task advisory lock and a temp-file rename, so a
//! reader only ever sees the previous complete document or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::Checkpoint;
use crate::errors::CheckpointError;
use crate::machine::TaskPhase;

const ARCHIVE_DIR: &str = "archive";

/// One line of `cadence list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub task_id: String,
    pub phase: TaskPhase,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub awaiting_decision: bool,
}

/// Directory of `<task_id>.json` checkpoint documents.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

/// Held while writing; the advisory lock is released when the file closes.
struct WriteLock {
    _file: File,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_task_id(task_id)?;
        Ok(self.dir.join(format!("{}.json", task_id)))
    }

    fn tmp_path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!(".{}.json.tmp", task_id))
    }

    fn lock(&self, task_id: &str) -> Result<WriteLock, CheckpointError> {
        let path = self.dir.join(format!("{}.lock", task_id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CheckpointError::io(&path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(WriteLock { _file: file }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CheckpointError::Locked(task_id.to_string())),
            Err(e) => Err(CheckpointError::io(&path, e)),
        }
    }

    /// Persist a checkpoint atomically.
    ///
    /// Refuses a sequence that is not strictly greater than the one already
    /// on disk.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let task_id = checkpoint.task_id();
        let path = self.path_for(task_id)?;
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))?;

        let _lock = self.lock(task_id)?;

        if let Some(current) = self.persisted_sequence(&path)
            && checkpoint.sequence <= current
        {
            return Err(CheckpointError::StaleSequence {
                task_id: task_id.to_string(),
                attempted: checkpoint.sequence,
                current,
            });
        }

        let json = checkpoint.to_json()?;
        let tmp = self.tmp_path_for(task_id);
        write_synced(&tmp, json.as_bytes())?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::io(&path, e));
        }
        sync_dir(&self.dir);

        debug!(
            task_id,
            sequence = checkpoint.sequence,
            phase = %checkpoint.body.phase,
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(path)
    }

    /// Sequence of the document on disk. An unreadable document counts as
    /// absent so a fresh, valid checkpoint can replace it.
    fn persisted_sequence(&self, path: &Path) -> Option<u64> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read existing checkpoint");
                return None;
            }
        };
        match serde_json::from_str::<serde_json::Value>(&content)
            .ok()
            .and_then(|v| v.get("sequence").and_then(|s| s.as_u64()))
        {
            Some(sequence) => Some(sequence),
            None => {
                warn!(path = %path.display(), "existing checkpoint has no readable sequence");
                None
            }
        }
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.path_for(task_id).map(|p| p.exists()).unwrap_or(false)
    }

    /// Raw document text, for restoration.
    pub fn load_raw(&self, task_id: &str) -> Result<String, CheckpointError> {
        let path = self.path_for(task_id)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CheckpointError::NotFound(task_id.to_string())),
            Err(e) => Err(CheckpointError::io(&path, e)),
        }
    }

    pub fn latest_sequence(&self, task_id: &str) -> Result<Option<u64>, CheckpointError> {
        let path = self.path_for(task_id)?;
        Ok(self.persisted_sequence(&path))
    }

    /// Every readable checkpoint in the store, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.dir, e)),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| CheckpointError::io(&self.dir, e))?.path();
            let is_document = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_document {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<Checkpoint>(&content).ok());
            match parsed {
                Some(checkpoint) => summaries.push(CheckpointSummary {
                    task_id: checkpoint.body.task_id.clone(),
                    phase: checkpoint.body.phase,
                    sequence: checkpoint.sequence,
                    timestamp: checkpoint.timestamp,
                    awaiting_decision: checkpoint.body.pending_decision.is_some(),
                }),
                None => warn!(path = %path.display(), "skipping unreadable checkpoint"),
            }
        }
        summaries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(summaries)
    }

    /// Move a finished task's checkpoint under `archive/`.
    pub fn archive(&self, task_id: &str) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(task_id)?;
        if !path.exists() {
            return Err(CheckpointError::NotFound(task_id.to_string()));
        }
        let _lock = self.lock(task_id)?;

        let archive_dir = self.dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir).map_err(|e| CheckpointError::io(&archive_dir, e))?;
        let target = archive_dir.join(format!(
            "{}-{}.json",
            task_id,
            Utc::now().format("%Y%m%dT%H%M%SZ")
        ));
        fs::rename(&path, &target).map_err(|e| CheckpointError::io(&target, e))?;
        sync_dir(&self.dir);

        info!(task_id, path = %target.display(), "checkpoint archived");
        Ok(target)
    }
}

/// Task ids become file names, so they are restricted to a safe alphabet.
pub(crate) fn validate_task_id(task_id: &str) -> Result<(), CheckpointError> {
    let valid = !task_id.is_empty()
        && task_id.len() <= 128
        && !task_id.starts_with('.')
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidTaskId(task_id.to_string()))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let mut file = File::create(path).map_err(|e| CheckpointError::io(path, e))?;
    file.write_all(bytes).map_err(|e| CheckpointError::io(path, e))?;
    file.sync_all().map_err(|e| CheckpointError::io(path, e))
}

/// Best effort; not every platform can open a directory for syncing.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
