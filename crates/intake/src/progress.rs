use std::sync::Arc;
use tracing::debug;

use crate::collab::{Notification, Notifier};
use crate::state::{AnalysisId, AnalysisStatus, AnalysisTable};

// Direct-mode progress weights
pub const VALIDATED: u8 = 10;
pub const PARSE_START: u8 = 20;
pub const PARSED: u8 = 50;
pub const EXTRACTED: u8 = 70;
pub const MAPPED: u8 = 90;
pub const DONE: u8 = 100;

/// Percentage of `total` bytes covered by `processed`, capped below 100
/// until the analysis finalizes.
pub fn bytes_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((processed.min(total) as u128 * 100 / total as u128) as u8).min(DONE - 1)
}

/// Writes status and progress to the analysis table and mirrors them as
/// notifications.
#[derive(Clone)]
pub struct ProgressReporter {
    id: AnalysisId,
    table: Arc<AnalysisTable>,
    notifier: Arc<dyn Notifier>,
}

impl ProgressReporter {
    pub fn new(id: AnalysisId, table: Arc<AnalysisTable>, notifier: Arc<dyn Notifier>) -> Self {
        Self { id, table, notifier }
    }

    pub fn id(&self) -> AnalysisId {
        self.id
    }

    /// Move to `status` at `percent` (progress never moves backwards).
    pub async fn enter(&self, status: AnalysisStatus, percent: u8) {
        let progress = self.table.update(self.id, |r| {
            r.status = status;
            r.advance(percent);
            r.progress
        });
        if let Some(percent) = progress {
            self.send(Notification::Progress { status, percent }).await;
        }
    }

    /// Raise progress within the current status.
    pub async fn advance(&self, percent: u8) {
        let changed = self.table.update(self.id, |r| {
            let before = r.progress;
            r.advance(percent);
            (r.progress != before).then_some((r.status, r.progress))
        });
        if let Some(Some((status, percent))) = changed {
            self.send(Notification::Progress { status, percent }).await;
        }
    }

    pub async fn send(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(self.id, notification).await {
            debug!(analysis_id = %self.id, error = %e, "Notification dropped");
        }
    }
}
