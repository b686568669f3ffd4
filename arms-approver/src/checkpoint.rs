//! Persisted run progress.
//!
//! The checkpoint is a small JSON document overwritten in place after every
//! record. Writes go to a temporary file in the same directory which is then
//! renamed over the target, so a crash mid-write leaves the previous
//! checkpoint intact.
//!
//! `last_completed_index` is a watermark: every record at or below it is
//! Confirmed. Records confirmed past a Failed gap are tracked individually in
//! `completed_keys` so the gap is retried on the next run without repeating
//! the records after it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ApproverError;
use crate::records::AccountRecord;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Resume cursor inside a record that was interrupted mid-way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgress {
    pub row: usize,
    pub link_index: usize,
    pub approver_index: usize,
    pub updated_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub row: usize,
    pub ou_id: String,
    pub account_name: String,
    pub error: String,
    pub time: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub version: u32,
    pub last_completed_index: usize,
    pub completed_keys: BTreeSet<String>,
    pub failed: BTreeSet<usize>,
    pub in_progress: BTreeMap<String, InProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Local>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            last_completed_index: 0,
            completed_keys: BTreeSet::new(),
            failed: BTreeSet::new(),
            in_progress: BTreeMap::new(),
            last_error: None,
            updated_at: None,
        }
    }
}

impl Checkpoint {
    /// Whether a record needs no further work.
    pub fn is_done(&self, record: &AccountRecord) -> bool {
        record.index <= self.last_completed_index || self.completed_keys.contains(&record.key())
    }

    /// Keep the watermark inside the current record sequence.
    pub fn clamp_to(&mut self, record_count: usize) {
        if self.last_completed_index > record_count {
            warn!(
                checkpoint = self.last_completed_index,
                record_count, "Checkpoint points past the end of the input; clamping"
            );
            self.last_completed_index = record_count;
        }
    }

    /// Record a Confirmed outcome and advance the watermark over every
    /// contiguous completed record.
    pub fn mark_confirmed(&mut self, record: &AccountRecord, records: &[AccountRecord]) {
        let key = record.key();
        self.in_progress.remove(&key);
        self.failed.remove(&record.index);
        self.completed_keys.insert(key);

        while let Some(next) = records.get(self.last_completed_index) {
            if !self.completed_keys.contains(&next.key()) {
                break;
            }
            self.last_completed_index = next.index;
        }
        self.updated_at = Some(Local::now());
    }

    pub fn mark_failed(&mut self, record: &AccountRecord, error: &str) {
        self.failed.insert(record.index);
        self.last_error = Some(LastError {
            row: record.row,
            ou_id: record.ou_id.clone(),
            account_name: record.account_name.clone(),
            error: error.to_string(),
            time: Local::now(),
        });
        self.updated_at = Some(Local::now());
    }

    pub fn set_in_progress(&mut self, record: &AccountRecord, link_index: usize, approver_index: usize) {
        self.in_progress.insert(
            record.key(),
            InProgress {
                row: record.row,
                link_index,
                approver_index,
                updated_at: Local::now(),
            },
        );
        self.updated_at = Some(Local::now());
    }

    pub fn resume_cursor(&self, record: &AccountRecord) -> Option<(usize, usize)> {
        self.in_progress
            .get(&record.key())
            .map(|p| (p.link_index, p.approver_index))
    }
}

/// File-backed owner of the checkpoint.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint. Missing, unreadable or corrupt state resumes from
    /// the start.
    pub fn load(&self) -> Checkpoint {
        match self.try_load() {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                debug!(path = %self.path.display(), "No checkpoint found, starting fresh");
                Checkpoint::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unusable checkpoint, starting from the first record");
                Checkpoint::default()
            }
        }
    }

    /// Strict variant of [`load`](Self::load) that reports corruption.
    pub fn try_load(&self) -> Result<Option<Checkpoint>, ApproverError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ApproverError::CheckpointCorrupt(e.to_string())),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&text)
            .map_err(|e| ApproverError::CheckpointCorrupt(e.to_string()))?;
        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(ApproverError::CheckpointCorrupt(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Atomically replace the persisted checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), ApproverError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| ApproverError::Io(std::io::Error::other(e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| ApproverError::Io(e.error))?;

        debug!(
            path = %self.path.display(),
            last_completed_index = checkpoint.last_completed_index,
            "Checkpoint saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordStatus;

    fn record(index: usize, ou: &str) -> AccountRecord {
        AccountRecord {
            index,
            row: index + 1,
            ou_id: ou.to_string(),
            account_name: format!("Acct{index}"),
            status: RecordStatus::Pending,
        }
    }

    #[test]
    fn watermark_stops_at_failed_gap() {
        let records = vec![record(1, "A1"), record(2, "A2"), record(3, "A3")];
        let mut cp = Checkpoint::default();

        cp.mark_failed(&records[0], "boom");
        cp.mark_confirmed(&records[1], &records);
        assert_eq!(cp.last_completed_index, 0);
        assert!(!cp.is_done(&records[0]));
        assert!(cp.is_done(&records[1]));

        cp.mark_confirmed(&records[0], &records);
        assert_eq!(cp.last_completed_index, 2);
        assert!(cp.failed.is_empty());
    }

    #[test]
    fn clamp_keeps_watermark_in_range() {
        let mut cp = Checkpoint {
            last_completed_index: 9,
            ..Default::default()
        };
        cp.clamp_to(2);
        assert_eq!(cp.last_completed_index, 2);
    }

    #[test]
    fn in_progress_cleared_on_confirm() {
        let records = vec![record(1, "A1")];
        let mut cp = Checkpoint::default();
        cp.set_in_progress(&records[0], 1, 2);
        assert_eq!(cp.resume_cursor(&records[0]), Some((1, 2)));
        cp.mark_confirmed(&records[0], &records);
        assert_eq!(cp.resume_cursor(&records[0]), None);
    }

    #[test]
    fn saving_twice_gives_same_resume_point() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("state").join("progress.json"));
        let records = vec![record(1, "A1"), record(2, "A2")];
        let mut cp = Checkpoint::default();
        cp.mark_confirmed(&records[0], &records);

        store.save(&cp).unwrap();
        let first = store.load();
        store.save(&cp).unwrap();
        let second = store.load();

        assert_eq!(first, second);
        assert_eq!(second.last_completed_index, 1);
        // Only the checkpoint itself is left behind.
        let entries = fs::read_dir(dir.path().join("state")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn missing_or_corrupt_file_resumes_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        assert!(store.try_load().unwrap().is_none());
        assert_eq!(store.load(), Checkpoint::default());

        fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.try_load(), Err(ApproverError::CheckpointCorrupt(_))));
        assert_eq!(store.load().last_completed_index, 0);
    }
}
