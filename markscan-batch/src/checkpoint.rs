//! Checkpoint store
//!
//! One directory per batch under `<data_dir>/batches/`, holding the durable
//! complement to the volatile ledger:
//!
//! - `checkpoint.json` — remaining work items plus running counters; its
//!   presence at startup is the sole signal that a batch must be resumed
//! - `staged/<name>` — raw payload bytes for uploaded file items
//! - `summary.json` — status and final counts for the status endpoint
//! - `results.csv` — one final record per item, appended as items complete
//!
//! Checkpoint writes go through a tmp-file + rename so a crash mid-write
//! leaves the previous record intact. Items within a chunk complete
//! concurrently, so each batch's record mutation is serialized behind a
//! per-batch lock; one process owns the directory, so no cross-process
//! locking is needed.

use crate::detector::{ItemResult, WorkItem};
use chrono::{DateTime, Utc};
use markscan_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const SUMMARY_FILE: &str = "summary.json";
const RESULTS_FILE: &str = "results.csv";
const STAGED_DIR: &str = "staged";
const RESULTS_HEADER: &str = "item,valid,confidence,detector,region,error\n";

/// Durable record of a batch's remaining work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub batch_id: Uuid,
    pub subscriber_id: Option<String>,
    pub chunk_size: usize,
    pub total: usize,
    pub processed: usize,
    pub valid: usize,
    pub invalid: usize,
    pub remaining: Vec<WorkItem>,
}

/// Batch lifecycle status as reported by the status endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Registered,
    Processing,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counts {
    pub valid: usize,
    pub invalid: usize,
    pub total: usize,
}

/// Per-batch summary record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub counts: Counts,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// On-disk store of batch checkpoints, staged payloads and results
pub struct CheckpointStore {
    root: PathBuf,
    /// Serializes read-modify-write of each batch's checkpoint record;
    /// items inside a chunk complete concurrently
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join("batches");
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn batch_lock(&self, batch_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(batch_id).or_default())
    }

    pub fn batch_dir(&self, batch_id: Uuid) -> PathBuf {
        self.root.join(batch_id.to_string())
    }

    fn checkpoint_path(&self, batch_id: Uuid) -> PathBuf {
        self.batch_dir(batch_id).join(CHECKPOINT_FILE)
    }

    fn summary_path(&self, batch_id: Uuid) -> PathBuf {
        self.batch_dir(batch_id).join(SUMMARY_FILE)
    }

    /// Create the batch directory and its initial summary record
    pub fn create_summary(&self, batch_id: Uuid, total: usize) -> Result<BatchSummary> {
        let summary = BatchSummary {
            batch_id,
            status: BatchStatus::Registered,
            counts: Counts {
                valid: 0,
                invalid: 0,
                total,
            },
            created_at: Utc::now(),
            completed_at: None,
        };
        fs::create_dir_all(self.batch_dir(batch_id))?;
        write_json_atomic(&self.summary_path(batch_id), &summary)?;
        Ok(summary)
    }

    pub fn load_summary(&self, batch_id: Uuid) -> Result<BatchSummary> {
        let path = self.summary_path(batch_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("batch not found: {}", batch_id)));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn mark_processing(&self, batch_id: Uuid) -> Result<()> {
        let mut summary = self.load_summary(batch_id)?;
        summary.status = BatchStatus::Processing;
        write_json_atomic(&self.summary_path(batch_id), &summary)
    }

    /// Durably record the final counts and completion timestamp
    pub fn finalize_summary(
        &self,
        batch_id: Uuid,
        valid: usize,
        invalid: usize,
        total: usize,
    ) -> Result<()> {
        let mut summary = self.load_summary(batch_id)?;
        summary.status = BatchStatus::Completed;
        summary.counts = Counts {
            valid,
            invalid,
            total,
        };
        summary.completed_at = Some(Utc::now());
        write_json_atomic(&self.summary_path(batch_id), &summary)
    }

    /// Stage uploaded payload bytes so recovery can re-read them after a crash
    pub fn stage_payload(&self, batch_id: Uuid, name: &str, data: &[u8]) -> Result<()> {
        let dir = self.batch_dir(batch_id).join(STAGED_DIR);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(sanitize_name(name)), data)?;
        Ok(())
    }

    pub fn load_staged(&self, batch_id: Uuid, name: &str) -> Result<Vec<u8>> {
        let path = self
            .batch_dir(batch_id)
            .join(STAGED_DIR)
            .join(sanitize_name(name));
        if !path.exists() {
            return Err(Error::NotFound(format!("staged payload missing: {}", name)));
        }
        Ok(fs::read(path)?)
    }

    /// Write the full remaining-item list with zeroed counters
    pub fn save_initial(&self, record: &CheckpointRecord) -> Result<()> {
        fs::create_dir_all(self.batch_dir(record.batch_id))?;
        write_json_atomic(&self.checkpoint_path(record.batch_id), record)
    }

    pub fn load(&self, batch_id: Uuid) -> Result<Option<CheckpointRecord>> {
        let path = self.checkpoint_path(batch_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Drop one completed item from the remaining list and bump the stored
    /// counters; also deletes the item's staged payload, if any
    pub fn remove_item(&self, batch_id: Uuid, item: &WorkItem, is_valid: bool) -> Result<()> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock().unwrap();

        let mut record = self.load(batch_id)?.ok_or_else(|| {
            Error::NotFound(format!("checkpoint not found for batch: {}", batch_id))
        })?;

        let before = record.remaining.len();
        if let Some(pos) = record.remaining.iter().position(|r| r == item) {
            record.remaining.remove(pos);
        }
        if record.remaining.len() < before {
            record.processed += 1;
            if is_valid {
                record.valid += 1;
            } else {
                record.invalid += 1;
            }
        }
        write_json_atomic(&self.checkpoint_path(batch_id), &record)?;

        if let WorkItem::File { name } = item {
            let staged = self
                .batch_dir(batch_id)
                .join(STAGED_DIR)
                .join(sanitize_name(name));
            if staged.exists() {
                let _ = fs::remove_file(staged);
            }
        }
        Ok(())
    }

    /// Append one final result record, writing the header on first use
    pub fn append_result(&self, batch_id: Uuid, result: &ItemResult) -> Result<()> {
        use std::io::Write;

        let dir = self.batch_dir(batch_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(RESULTS_FILE);
        let fresh = !path.exists();
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        if fresh {
            file.write_all(RESULTS_HEADER.as_bytes())?;
        }

        let region = result
            .region
            .map(|r| format!("{};{};{};{}", r.x1, r.y1, r.x2, r.y2))
            .unwrap_or_default();
        let confidence = result
            .confidence
            .map(|c| format!("{:.4}", c))
            .unwrap_or_default();
        let line = format!(
            "{},{},{},{},{},{}\n",
            csv_field(&result.item),
            result.valid,
            confidence,
            csv_field(result.detector.as_deref().unwrap_or("")),
            region,
            csv_field(result.error.as_deref().unwrap_or("")),
        );
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Enumerate every still-pending checkpoint record on disk.
    ///
    /// Called once at startup, before the service accepts registrations, so
    /// recovery re-registrations cannot race fresh ones. Unreadable records
    /// are logged and skipped rather than blocking startup.
    pub fn load_all(&self) -> Result<Vec<CheckpointRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path().join(CHECKPOINT_FILE);
            if !path.is_file() {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|content| serde_json::from_str(&content).map_err(Error::from))
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable checkpoint record"
                    );
                }
            }
        }
        Ok(records)
    }

    /// Delete the checkpoint record and any staged payloads; the summary and
    /// results files stay behind for the status endpoint until swept
    pub fn clear(&self, batch_id: Uuid) -> Result<()> {
        let checkpoint = self.checkpoint_path(batch_id);
        if checkpoint.exists() {
            fs::remove_file(checkpoint)?;
        }
        let staged = self.batch_dir(batch_id).join(STAGED_DIR);
        if staged.exists() {
            fs::remove_dir_all(staged)?;
        }
        self.locks.lock().unwrap().remove(&batch_id);
        Ok(())
    }

    /// Remove old batch directories.
    ///
    /// Directories that still hold a checkpoint are preserved for recovery
    /// until the longer `pending_max_age_hours` bound, then dropped so
    /// abandoned batches cannot accumulate forever.
    pub fn sweep(&self, max_age_hours: u64, pending_max_age_hours: u64) -> usize {
        let mut removed = 0;
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Checkpoint sweep could not read batch root");
                return 0;
            }
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let age_hours = match dir_age_hours(&dir) {
                Some(age) => age,
                None => continue,
            };

            let pending = dir.join(CHECKPOINT_FILE).exists();
            let bound = if pending {
                pending_max_age_hours
            } else {
                max_age_hours
            };
            if age_hours <= bound as f64 {
                continue;
            }

            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(
                        path = %dir.display(),
                        pending,
                        age_hours = format!("{:.1}", age_hours),
                        "Swept old batch directory"
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to sweep batch directory");
                }
            }
        }
        removed
    }
}

fn dir_age_hours(dir: &Path) -> Option<f64> {
    let modified = fs::metadata(dir).ok()?.modified().ok()?;
    let age = modified.elapsed().ok()?;
    Some(age.as_secs_f64() / 3600.0)
}

/// Keep staged filenames inside the staged directory
fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
