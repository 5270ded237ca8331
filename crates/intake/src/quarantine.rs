//! Quarantine: isolation of suspicious submissions.
//!
//! A quarantined file is kept byte-for-byte next to a JSON sidecar that
//! records why it was isolated. Each analysis produces at most one record.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::collab::BoxFuture;
use crate::error::{IntakeError, IntakeResult};
use crate::state::AnalysisId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub analysis_id: AnalysisId,
    pub filename: String,
    pub sha256: String,
    pub size: u64,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

pub trait QuarantineStore: Send + Sync {
    fn quarantine<'a>(&'a self, record: &'a QuarantineRecord, content: &'a [u8]) -> BoxFuture<'a, IntakeResult<()>>;

    fn list(&self) -> BoxFuture<'_, IntakeResult<Vec<QuarantineRecord>>>;
}

/// Filesystem quarantine: `<dir>/<id>.bin` plus `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FsQuarantine {
    dir: PathBuf,
}

impl FsQuarantine {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn payload_path(&self, id: AnalysisId) -> PathBuf {
        self.dir.join(format!("{}.bin", id))
    }

    pub fn sidecar_path(&self, id: AnalysisId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write_new(path: &Path, bytes: &[u8]) -> IntakeResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    IntakeError::AlreadyQuarantined(path.display().to_string())
                } else {
                    IntakeError::quarantine_io(path, e)
                }
            })?;
        file.write_all(bytes).await.map_err(|e| IntakeError::quarantine_io(path, e))?;
        file.flush().await.map_err(|e| IntakeError::quarantine_io(path, e))
    }
}

impl QuarantineStore for FsQuarantine {
    fn quarantine<'a>(&'a self, record: &'a QuarantineRecord, content: &'a [u8]) -> BoxFuture<'a, IntakeResult<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| IntakeError::quarantine_io(&self.dir, e))?;

            // payload first: a sidecar is only listed once its payload exists
            let sidecar = serde_json::to_vec_pretty(record)?;
            let payload_path = self.payload_path(record.analysis_id);
            Self::write_new(&payload_path, content).await?;
            if let Err(e) = Self::write_new(&self.sidecar_path(record.analysis_id), &sidecar).await {
                if let Err(cleanup) = tokio::fs::remove_file(&payload_path).await {
                    warn!(path = %payload_path.display(), error = %cleanup, "Failed to remove orphaned quarantine payload");
                }
                return Err(e);
            }

            info!(
                analysis_id = %record.analysis_id,
                file = %record.filename,
                reason = %record.reason,
                "File quarantined"
            );
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, IntakeResult<Vec<QuarantineRecord>>> {
        Box::pin(async move {
            let mut records = Vec::new();
            let mut dir = match tokio::fs::read_dir(&self.dir).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
                Err(e) => return Err(IntakeError::quarantine_io(&self.dir, e)),
            };
            while let Some(entry) = dir.next_entry().await.map_err(|e| IntakeError::quarantine_io(&self.dir, e))? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await.map_err(|e| IntakeError::quarantine_io(&path, e))?;
                match serde_json::from_slice::<QuarantineRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable quarantine sidecar"),
                }
            }
            records.sort_by_key(|r| r.quarantined_at);
            Ok(records)
        })
    }
}

/// In-memory quarantine for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryQuarantine {
    entries: DashMap<AnalysisId, (QuarantineRecord, Vec<u8>)>,
}

impl MemoryQuarantine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn payload(&self, id: AnalysisId) -> Option<Vec<u8>> {
        self.entries.get(&id).map(|e| e.1.clone())
    }
}

impl QuarantineStore for MemoryQuarantine {
    fn quarantine<'a>(&'a self, record: &'a QuarantineRecord, content: &'a [u8]) -> BoxFuture<'a, IntakeResult<()>> {
        let result = match self.entries.entry(record.analysis_id) {
            Entry::Occupied(_) => Err(IntakeError::AlreadyQuarantined(record.analysis_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert((record.clone(), content.to_vec()));
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn list(&self) -> BoxFuture<'_, IntakeResult<Vec<QuarantineRecord>>> {
        let mut records: Vec<QuarantineRecord> = self.entries.iter().map(|e| e.0.clone()).collect();
        records.sort_by_key(|r| r.quarantined_at);
        Box::pin(async move { Ok(records) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reason: &str) -> QuarantineRecord {
        QuarantineRecord {
            analysis_id: AnalysisId::new(),
            filename: "Security.evtx".into(),
            sha256: "00".repeat(32),
            size: 7,
            reason: reason.into(),
            quarantined_at: Utc::now(),
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("intake-quarantine-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_fs_quarantine_writes_payload_and_sidecar() {
        let dir = scratch_dir();
        let store = FsQuarantine::new(&dir);
        let record = record("file format signature mismatch");

        store.quarantine(&record, b"<Event>").await.unwrap();

        let payload = tokio::fs::read(store.payload_path(record.analysis_id)).await.unwrap();
        assert_eq!(payload, b"<Event>");
        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![record.clone()]);

        let again = store.quarantine(&record, b"<Event>").await;
        assert!(matches!(again, Err(IntakeError::AlreadyQuarantined(_))));
        assert_eq!(store.list().await.unwrap().len(), 1);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_payload_failure_leaves_no_sidecar() {
        let dir = scratch_dir();
        let store = FsQuarantine::new(&dir);
        let record = record("file format signature mismatch");

        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(store.payload_path(record.analysis_id), b"stale").await.unwrap();

        let result = store.quarantine(&record, b"<Event>").await;
        assert!(matches!(result, Err(IntakeError::AlreadyQuarantined(_))));
        assert!(!store.sidecar_path(record.analysis_id).exists());
        assert!(store.list().await.unwrap().is_empty());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_sidecar_failure_removes_payload() {
        let dir = scratch_dir();
        let store = FsQuarantine::new(&dir);
        let record = record("file format signature mismatch");

        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(store.sidecar_path(record.analysis_id), b"{}").await.unwrap();

        assert!(store.quarantine(&record, b"<Event>").await.is_err());
        assert!(!store.payload_path(record.analysis_id).exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_list_of_missing_dir_is_empty() {
        let store = FsQuarantine::new(scratch_dir());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_quarantine_one_record_per_analysis() {
        let store = MemoryQuarantine::new();
        let record = record("malware signature matched: EICAR-Test-File");
        store.quarantine(&record, b"x").await.unwrap();
        assert!(store.quarantine(&record, b"x").await.is_err());
        assert_eq!(store.len(), 1);
        assert_eq!(store.payload(record.analysis_id), Some(b"x".to_vec()));
    }
}
