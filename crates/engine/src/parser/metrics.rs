use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

use super::model::{LogFormat, ParseResult, ParseStatus};

/// Failure categories for metrics recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricErrorType {
    /// Parser returned a `Failed` result
    Failed,
    /// Parse exceeded its wall-clock budget
    Timeout,
    /// Parser panicked (caught via catch_unwind)
    Panic,
}

/// A wrapper that forces the wrapped data onto its own cache line(s).
///
/// Concurrent analyses update different groups at the same time; keeping
/// each group on a separate 64-byte line avoids false sharing.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T>(pub T);

/// Registry selection outcomes
#[derive(Debug, Default)]
pub struct SelectionMetrics {
    pub attempts: AtomicU64,
    pub found: AtomicU64,
    pub not_found: AtomicU64,
    pub preferred: AtomicU64,
}

/// Completed parses per format
#[derive(Debug, Default)]
pub struct FormatMetrics {
    pub csv: AtomicU64,
    pub json: AtomicU64,
    pub syslog: AtomicU64,
    pub windows_event: AtomicU64,
    pub text: AtomicU64,
    pub custom: AtomicU64,
}

/// Aggregate timing and volume
#[derive(Debug, Default)]
pub struct TotalMetrics {
    pub parses: AtomicU64,
    pub events: AtomicU64,
    pub time_nanos: AtomicU64,
}

/// Non-successful outcomes by type
#[derive(Debug, Default)]
pub struct ErrorMetrics {
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub timeout: AtomicU64,
    pub panic: AtomicU64,
}

/// Metrics for selection and parsing.
///
/// All operations use `Ordering::Relaxed`; `snapshot()` reads are not
/// transactional across fields.
#[derive(Debug, Default)]
pub struct ParsingMetrics {
    pub selection: CacheAligned<SelectionMetrics>,
    pub formats: CacheAligned<FormatMetrics>,
    pub totals: CacheAligned<TotalMetrics>,
    pub errors: CacheAligned<ErrorMetrics>,
}

impl ParsingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registry selection attempt
    #[inline]
    pub fn record_selection(&self, found: bool, via_preference: bool) {
        self.selection.0.attempts.fetch_add(1, Ordering::Relaxed);
        if found {
            self.selection.0.found.fetch_add(1, Ordering::Relaxed);
            if via_preference {
                self.selection.0.preferred.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.selection.0.not_found.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a completed parse
    #[inline]
    pub fn record_parse(&self, format: LogFormat, events: u64, time_nanos: u64) {
        self.totals.0.parses.fetch_add(1, Ordering::Relaxed);
        self.totals.0.events.fetch_add(events, Ordering::Relaxed);
        self.totals.0.time_nanos.fetch_add(time_nanos, Ordering::Relaxed);

        let counter = match format {
            LogFormat::Csv => &self.formats.0.csv,
            LogFormat::Json => &self.formats.0.json,
            LogFormat::Syslog => &self.formats.0.syslog,
            LogFormat::WindowsEvent => &self.formats.0.windows_event,
            LogFormat::Text => &self.formats.0.text,
            LogFormat::Custom => &self.formats.0.custom,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self, error_type: MetricErrorType) {
        let counter = match error_type {
            MetricErrorType::Failed => &self.errors.0.failed,
            MetricErrorType::Timeout => &self.errors.0.timeout,
            MetricErrorType::Panic => &self.errors.0.panic,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cancelled(&self) {
        self.errors.0.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a parse result in one call.
    pub fn record_result(&self, format: LogFormat, result: &ParseResult) {
        match result.status {
            ParseStatus::Completed => self.record_parse(
                format,
                result.event_count as u64,
                result.elapsed.as_nanos().min(u64::MAX as u128) as u64,
            ),
            ParseStatus::Cancelled => self.record_cancelled(),
            ParseStatus::Failed => {
                let panicked = result
                    .error_message
                    .as_deref()
                    .is_some_and(|m| m.starts_with("Parser panic"));
                self.record_error(if panicked { MetricErrorType::Panic } else { MetricErrorType::Failed });
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let parses = self.totals.0.parses.load(Ordering::Relaxed);
        let time_ns = self.totals.0.time_nanos.load(Ordering::Relaxed);
        let failures = self.errors.0.failed.load(Ordering::Relaxed)
            + self.errors.0.timeout.load(Ordering::Relaxed)
            + self.errors.0.panic.load(Ordering::Relaxed);
        let attempts = parses + failures;

        MetricsSnapshot {
            selection_attempts: self.selection.0.attempts.load(Ordering::Relaxed),
            selection_found: self.selection.0.found.load(Ordering::Relaxed),
            selection_not_found: self.selection.0.not_found.load(Ordering::Relaxed),
            selection_preferred: self.selection.0.preferred.load(Ordering::Relaxed),

            csv_parsed: self.formats.0.csv.load(Ordering::Relaxed),
            json_parsed: self.formats.0.json.load(Ordering::Relaxed),
            syslog_parsed: self.formats.0.syslog.load(Ordering::Relaxed),
            windows_event_parsed: self.formats.0.windows_event.load(Ordering::Relaxed),
            text_parsed: self.formats.0.text.load(Ordering::Relaxed),
            custom_parsed: self.formats.0.custom.load(Ordering::Relaxed),

            total_parses: parses,
            total_events: self.totals.0.events.load(Ordering::Relaxed),
            avg_parse_time_us: if parses > 0 {
                (time_ns as f64 / parses as f64) / 1000.0
            } else {
                0.0
            },

            parse_failures: self.errors.0.failed.load(Ordering::Relaxed),
            parse_cancellations: self.errors.0.cancelled.load(Ordering::Relaxed),
            parse_timeouts: self.errors.0.timeout.load(Ordering::Relaxed),
            parse_panics: self.errors.0.panic.load(Ordering::Relaxed),
            success_rate: if attempts > 0 {
                parses as f64 / attempts as f64
            } else {
                1.0
            },
        }
    }
}

/// A read-only snapshot of parsing metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub selection_attempts: u64,
    pub selection_found: u64,
    pub selection_not_found: u64,
    pub selection_preferred: u64,

    pub csv_parsed: u64,
    pub json_parsed: u64,
    pub syslog_parsed: u64,
    pub windows_event_parsed: u64,
    pub text_parsed: u64,
    pub custom_parsed: u64,

    pub total_parses: u64,
    pub total_events: u64,
    pub avg_parse_time_us: f64,

    pub parse_failures: u64,
    pub parse_cancellations: u64,
    pub parse_timeouts: u64,
    pub parse_panics: u64,
    /// Cancellations are excluded: they are not failures
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::model::ParseError;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_new_metrics_are_empty() {
        let snap = ParsingMetrics::new().snapshot();
        assert_eq!(snap.total_parses, 0);
        assert_eq!(snap.avg_parse_time_us, 0.0);
        assert_eq!(snap.success_rate, 1.0);
    }

    #[test]
    fn test_record_selection() {
        let metrics = ParsingMetrics::new();
        metrics.record_selection(true, false);
        metrics.record_selection(true, true);
        metrics.record_selection(false, false);

        let snap = metrics.snapshot();
        assert_eq!(snap.selection_attempts, 3);
        assert_eq!(snap.selection_found, 2);
        assert_eq!(snap.selection_preferred, 1);
        assert_eq!(snap.selection_not_found, 1);
    }

    #[test]
    fn test_record_parse_counts_and_times() {
        let metrics = ParsingMetrics::new();
        metrics.record_parse(LogFormat::Json, 10, 1000);
        metrics.record_parse(LogFormat::Csv, 5, 2000);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_parses, 2);
        assert_eq!(snap.total_events, 15);
        assert_eq!(snap.json_parsed, 1);
        assert_eq!(snap.csv_parsed, 1);
        assert!((snap.avg_parse_time_us - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cancellation_is_not_a_failure() {
        let metrics = ParsingMetrics::new();
        metrics.record_parse(LogFormat::Syslog, 1, 100);
        metrics.record_result(LogFormat::Syslog, &ParseResult::cancelled("syslog", Duration::ZERO));

        let snap = metrics.snapshot();
        assert_eq!(snap.parse_cancellations, 1);
        assert_eq!(snap.parse_failures, 0);
        assert_eq!(snap.success_rate, 1.0);
    }

    #[test]
    fn test_record_result_classifies_panics() {
        let metrics = ParsingMetrics::new();
        metrics.record_result(
            LogFormat::Custom,
            &ParseResult::failed("custom", ParseError::ParserPanic("boom".into()), Duration::ZERO),
        );
        metrics.record_result(
            LogFormat::Custom,
            &ParseResult::failed("custom", ParseError::ParseFailed("bad".into()), Duration::ZERO),
        );
        metrics.record_result(
            LogFormat::Custom,
            &ParseResult::completed("custom", Vec::new(), Duration::from_nanos(50), BTreeMap::new()),
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.parse_panics, 1);
        assert_eq!(snap.parse_failures, 1);
        assert_eq!(snap.custom_parsed, 1);
        assert!((snap.success_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
