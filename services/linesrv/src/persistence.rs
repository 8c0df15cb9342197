//! Durable history of scans, validations and programming results
//!
//! The workflow only appends. Failures are reported to the caller, which
//! logs them without reversing any transition.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{LineSrvError, Result};
use crate::model::{wire_time, DeviceResult, ScanRecord, Timestamp, ValidationOutcome};

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_scan(&self, record: &ScanRecord) -> Result<()>;

    async fn save_validation(&self, outcome: &ValidationOutcome) -> Result<()>;

    async fn save_program_result(
        &self,
        batch_id: &str,
        result: &DeviceResult,
        time: Timestamp,
    ) -> Result<()>;
}

/// One persisted history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Scan {
        record: ScanRecord,
    },
    Validation {
        outcome: ValidationOutcome,
    },
    ProgramResult {
        batch_id: String,
        result: DeviceResult,
        #[serde(with = "wire_time")]
        time: Timestamp,
    },
}

/// Append-only JSON-lines journal on local disk
pub struct JournalPersistence {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JournalPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    LineSrvError::persistence(format!("create {}: {}", parent.display(), e))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    LineSrvError::persistence(format!("open {}: {}", self.path.display(), e))
                })?;
            debug!("Journal opened at {}", self.path.display());
            *guard = Some(file);
        }

        let Some(file) = guard.as_mut() else {
            return Err(LineSrvError::persistence("journal not open"));
        };
        let written = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            // Reopen on the next append
            *guard = None;
            return Err(LineSrvError::persistence(format!(
                "write {}: {}",
                self.path.display(),
                e
            )));
        }
        Ok(())
    }

    /// Read every entry back, skipping lines that fail to parse
    pub async fn load(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LineSrvError::persistence(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            },
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl Persistence for JournalPersistence {
    async fn save_scan(&self, record: &ScanRecord) -> Result<()> {
        self.append(&JournalEntry::Scan {
            record: record.clone(),
        })
        .await
    }

    async fn save_validation(&self, outcome: &ValidationOutcome) -> Result<()> {
        self.append(&JournalEntry::Validation {
            outcome: outcome.clone(),
        })
        .await
    }

    async fn save_program_result(
        &self,
        batch_id: &str,
        result: &DeviceResult,
        time: Timestamp,
    ) -> Result<()> {
        self.append(&JournalEntry::ProgramResult {
            batch_id: batch_id.to_string(),
            result: result.clone(),
            time,
        })
        .await
    }
}

/// In-process history, for tests and journal-less runs
#[derive(Default)]
pub struct MemoryPersistence {
    entries: Mutex<Vec<JournalEntry>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Make every subsequent save fail
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn push(&self, entry: JournalEntry) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LineSrvError::persistence("store unavailable"));
        }
        self.entries.lock().push(entry);
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_scan(&self, record: &ScanRecord) -> Result<()> {
        self.push(JournalEntry::Scan {
            record: record.clone(),
        })
    }

    async fn save_validation(&self, outcome: &ValidationOutcome) -> Result<()> {
        self.push(JournalEntry::Validation {
            outcome: outcome.clone(),
        })
    }

    async fn save_program_result(
        &self,
        batch_id: &str,
        result: &DeviceResult,
        time: Timestamp,
    ) -> Result<()> {
        self.push(JournalEntry::ProgramResult {
            batch_id: batch_id.to_string(),
            result: result.clone(),
            time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_journal_appends_and_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("journal.jsonl");
        let journal = JournalPersistence::new(&path);

        let scan = ScanRecord::new("D1", "A1", "COM3");
        journal.save_scan(&scan).await.unwrap();
        journal
            .save_validation(&ValidationOutcome::evaluate(1, 1))
            .await
            .unwrap();
        journal
            .save_program_result(
                "B1",
                &DeviceResult {
                    device_id: "D1".to_string(),
                    barcode: "A1".to_string(),
                    success: false,
                    error_message: Some("timeout".to_string()),
                },
                now(),
            )
            .await
            .unwrap();

        let entries = JournalPersistence::load(&path).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], JournalEntry::Scan { record: scan });
        assert!(matches!(
            &entries[2],
            JournalEntry::ProgramResult { batch_id, result, .. }
                if batch_id == "B1" && result.error_message.as_deref() == Some("timeout")
        ));
    }

    #[tokio::test]
    async fn test_load_missing_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        let entries = JournalPersistence::load(dir.path().join("none.jsonl"))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_memory_failure_toggle() {
        let store = MemoryPersistence::new();
        let scan = ScanRecord::new("D1", "A1", "COM3");

        store.set_failing(true);
        assert!(store.save_scan(&scan).await.is_err());
        assert!(store.is_empty());

        store.set_failing(false);
        store.save_scan(&scan).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
