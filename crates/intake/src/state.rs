use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use engine::parser::{LogEvent, ParseStatus};

use crate::collab::{Indicator, TechniqueMatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisId(Uuid);

impl AnalysisId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl Default for AnalysisId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of one submitted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Queued,
    Validating,
    Quarantined,
    Rejected,
    Selecting,
    Parsing,
    Extracting,
    Mapping,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Quarantined
                | AnalysisStatus::Rejected
                | AnalysisStatus::Completed
                | AnalysisStatus::Failed
                | AnalysisStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::Validating => "validating",
            AnalysisStatus::Quarantined => "quarantined",
            AnalysisStatus::Rejected => "rejected",
            AnalysisStatus::Selecting => "selecting",
            AnalysisStatus::Parsing => "parsing",
            AnalysisStatus::Extracting => "extracting",
            AnalysisStatus::Mapping => "mapping",
            AnalysisStatus::Summarizing => "summarizing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Cancelled => "cancelled",
        }
    }
}

/// Downstream stage whose failure leaves a partial analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Map,
    Summarize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Map => "map",
            Stage::Summarize => "summarize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Direct,
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: AnalysisId,
    pub filename: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub status: AnalysisStatus,
    /// 0 - 100, never decreases
    pub progress: u8,
    pub mode: Option<ProcessingMode>,
    pub parser: Option<String>,
    pub parse_status: Option<ParseStatus>,
    pub event_count: usize,
    pub events: Vec<LogEvent>,
    pub parse_metadata: BTreeMap<String, String>,
    pub indicators: Vec<Indicator>,
    pub techniques: Vec<TechniqueMatch>,
    pub summary: Option<String>,
    pub warnings: Vec<String>,
    pub missing_stages: Vec<Stage>,
    pub partial: bool,
    /// Rejection, quarantine or failure reason
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisRecord {
    pub fn new(id: AnalysisId, filename: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            filename: filename.into(),
            size,
            sha256: None,
            status: AnalysisStatus::Queued,
            progress: 0,
            mode: None,
            parser: None,
            parse_status: None,
            event_count: 0,
            events: Vec::new(),
            parse_metadata: BTreeMap::new(),
            indicators: Vec::new(),
            techniques: Vec::new(),
            summary: None,
            warnings: Vec::new(),
            missing_stages: Vec::new(),
            partial: false,
            reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Raise progress; lower values are ignored.
    pub fn advance(&mut self, percent: u8) {
        self.progress = self.progress.max(percent.min(100));
    }

    pub fn stage_failed(&mut self, stage: Stage, message: impl Into<String>) {
        self.missing_stages.push(stage);
        self.partial = true;
        self.warnings.push(message.into());
    }
}

struct Tracked {
    record: AnalysisRecord,
    cancel: CancellationToken,
}

/// Live analyses keyed by id. Each entry is locked independently.
#[derive(Default)]
pub struct AnalysisTable {
    entries: DashMap<AnalysisId, Tracked>,
}

impl AnalysisTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new record; returns its cancellation token.
    pub fn insert(&self, record: AnalysisRecord) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.entries.insert(record.id, Tracked { record, cancel: cancel.clone() });
        cancel
    }

    pub fn update<R>(&self, id: AnalysisId, f: impl FnOnce(&mut AnalysisRecord) -> R) -> Option<R> {
        self.entries.get_mut(&id).map(|mut tracked| {
            let out = f(&mut tracked.record);
            tracked.record.updated_at = Utc::now();
            out
        })
    }

    pub fn snapshot(&self, id: AnalysisId) -> Option<AnalysisRecord> {
        self.entries.get(&id).map(|t| t.record.clone())
    }

    pub fn status(&self, id: AnalysisId) -> Option<AnalysisStatus> {
        self.entries.get(&id).map(|t| t.record.status)
    }

    /// Trigger cancellation. False if unknown or already finished.
    pub fn cancel(&self, id: AnalysisId) -> bool {
        match self.entries.get(&id) {
            Some(tracked) if !tracked.record.status.is_terminal() => {
                tracked.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: AnalysisId) -> Option<AnalysisRecord> {
        self.entries.remove(&id).map(|(_, t)| t.record)
    }

    /// Drop the parsed events of a finished analysis, keeping its summary fields.
    pub fn release_events(&self, id: AnalysisId) {
        if let Some(mut tracked) = self.entries.get_mut(&id) {
            if tracked.record.status.is_terminal() {
                tracked.record.events = Vec::new();
            }
        }
    }

    /// Evict the oldest finished analyses so at most `keep` remain.
    /// Live analyses are never evicted. Returns how many were removed.
    pub fn prune_finished(&self, keep: usize) -> usize {
        let mut finished: Vec<(DateTime<Utc>, AnalysisId)> = self
            .entries
            .iter()
            .filter(|e| e.record.status.is_terminal())
            .map(|e| (e.record.finished_at.unwrap_or(e.record.updated_at), *e.key()))
            .collect();
        if finished.len() <= keep {
            return 0;
        }
        finished.sort();
        let excess = finished.len() - keep;
        finished
            .into_iter()
            .take(excess)
            .filter(|(_, id)| self.entries.remove_if(id, |_, t| t.record.status.is_terminal()).is_some())
            .count()
    }

    pub fn ids(&self) -> Vec<AnalysisId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
