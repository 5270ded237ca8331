//! Pipeline: drives one submitted file from validation to a finished analysis.
//!
//! ```text
//! Validating -> (Quarantined | Rejected | Selecting) -> Parsing -> Extracting
//!            -> Mapping -> Summarizing -> Completed
//! ```
//!
//! `Failed` and `Cancelled` are reachable from every non-terminal stage.
//! Analyses are independent: per-analysis state lives in a `DashMap` and
//! nothing here takes a pipeline-wide lock.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use engine::parser::metrics::MetricErrorType;
use engine::parser::{guarded_parse, FormatDetector, LogParser, ParseResult, ParseStatus, DETECTION_SAMPLE_BYTES};
use engine::registry::{Registry, Selection};

use crate::chunked::{dedup_indicators, parse_window, text_chunks, IndicatorMerger};
use crate::collab::{
    AnalysisStore, CollabError, DisabledSummarizer, ExtractOptions, Indicator, IocExtractor,
    KeywordMitreMapper, MemoryAnalysisStore, MitreMapper, Notification, Notifier, RegexIocExtractor,
    Summarizer, SummaryOptions,
};
use crate::config::IntakeConfig;
use crate::error::{IntakeError, IntakeResult};
use crate::progress::{self, bytes_percent, ProgressReporter};
use crate::quarantine::{QuarantineRecord, QuarantineStore};
use crate::state::{AnalysisId, AnalysisRecord, AnalysisStatus, AnalysisTable, ProcessingMode, Stage};
use crate::validate::{FileValidator, Verdict};

/// Downstream services the pipeline hands its results to.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn IocExtractor>,
    pub mapper: Arc<dyn MitreMapper>,
    pub summarizer: Arc<dyn Summarizer>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn AnalysisStore>,
}

impl Collaborators {
    /// The shipped in-process implementations.
    pub fn builtin(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            extractor: Arc::new(RegexIocExtractor::new()),
            mapper: Arc::new(KeywordMitreMapper::new()),
            summarizer: Arc::new(DisabledSummarizer),
            notifier,
            store: Arc::new(MemoryAnalysisStore::new()),
        }
    }
}

struct Shared {
    config: IntakeConfig,
    registry: Arc<Registry>,
    validator: FileValidator,
    quarantine: Arc<dyn QuarantineStore>,
    collab: Collaborators,
    table: Arc<AnalysisTable>,
}

struct Submission {
    id: AnalysisId,
    filename: String,
    content: Arc<Vec<u8>>,
    preferred: Option<String>,
}

enum Outcome {
    Completed,
    Quarantined,
    Rejected,
}

#[derive(Clone)]
pub struct IntakePipeline {
    shared: Arc<Shared>,
}

impl IntakePipeline {
    pub fn new(
        config: IntakeConfig,
        registry: Arc<Registry>,
        quarantine: Arc<dyn QuarantineStore>,
        collab: Collaborators,
    ) -> IntakeResult<Self> {
        let validator = FileValidator::new(&config.validation, config.limits.max_file_size)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry,
                validator,
                quarantine,
                collab,
                table: Arc::new(AnalysisTable::new()),
            }),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.shared.config
    }

    fn admit(&self, content: Vec<u8>, filename: String, preferred: Option<String>) -> (Submission, CancellationToken) {
        let id = AnalysisId::new();
        let cancel = self
            .shared
            .table
            .insert(AnalysisRecord::new(id, filename.clone(), content.len() as u64));
        let submission = Submission { id, filename, content: Arc::new(content), preferred };
        (submission, cancel)
    }

    /// Queue a file for background processing. Must be called inside a Tokio runtime.
    pub fn submit(
        &self,
        content: Vec<u8>,
        filename: impl Into<String>,
        preferred: Option<String>,
    ) -> (AnalysisId, AnalysisStatus) {
        let (submission, cancel) = self.admit(content, filename.into(), preferred);
        let id = submission.id;
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run(submission, cancel).await;
        });
        (id, AnalysisStatus::Queued)
    }

    /// Process a file to completion and return the final record.
    pub async fn process(
        &self,
        content: Vec<u8>,
        filename: impl Into<String>,
        preferred: Option<String>,
    ) -> AnalysisRecord {
        let (submission, cancel) = self.admit(content, filename.into(), preferred);
        self.run(submission, cancel).await
    }

    /// Request cancellation. Returns false for unknown or finished analyses.
    pub fn cancel(&self, id: AnalysisId) -> bool {
        let cancelled = self.shared.table.cancel(id);
        if cancelled {
            info!(analysis_id = %id, "Cancellation requested");
        }
        cancelled
    }

    pub fn status(&self, id: AnalysisId) -> Option<AnalysisStatus> {
        self.shared.table.status(id)
    }

    pub fn record(&self, id: AnalysisId) -> Option<AnalysisRecord> {
        self.shared.table.snapshot(id)
    }

    async fn run(&self, submission: Submission, cancel: CancellationToken) -> AnalysisRecord {
        let span = info_span!("analysis", analysis_id = %submission.id, file = %submission.filename);
        async move {
            let shared = &self.shared;
            let reporter = ProgressReporter::new(
                submission.id,
                Arc::clone(&shared.table),
                Arc::clone(&shared.collab.notifier),
            );
            let work = cancel.child_token();
            let timeout = shared.config.limits.analysis_timeout();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(IntakeError::Cancelled),
                result = tokio::time::timeout(timeout, self.stages(&submission, &reporter, &work)) => {
                    result.unwrap_or(Err(IntakeError::Timeout(timeout)))
                }
            };
            // stop a parser that may still be running on a blocking thread
            work.cancel();

            self.finalize(&submission, outcome, &reporter).await
        }
        .instrument(span)
        .await
    }

    async fn finalize(
        &self,
        submission: &Submission,
        outcome: IntakeResult<Outcome>,
        reporter: &ProgressReporter,
    ) -> AnalysisRecord {
        let shared = &self.shared;
        let id = submission.id;

        let (status, notification) = match outcome {
            Ok(Outcome::Completed) => {
                let partial = shared
                    .table
                    .update(id, |r| {
                        r.status = AnalysisStatus::Completed;
                        r.advance(progress::DONE);
                        r.partial
                    })
                    .unwrap_or(false);
                info!(partial, "Analysis completed");
                (AnalysisStatus::Completed, Notification::Completed { status: AnalysisStatus::Completed, partial })
            }
            Ok(Outcome::Quarantined) => (
                AnalysisStatus::Quarantined,
                Notification::Completed { status: AnalysisStatus::Quarantined, partial: false },
            ),
            Ok(Outcome::Rejected) => (
                AnalysisStatus::Rejected,
                Notification::Completed { status: AnalysisStatus::Rejected, partial: false },
            ),
            Err(IntakeError::Cancelled) => {
                shared.table.update(id, |r| r.status = AnalysisStatus::Cancelled);
                info!("Analysis cancelled");
                (
                    AnalysisStatus::Cancelled,
                    Notification::Completed { status: AnalysisStatus::Cancelled, partial: false },
                )
            }
            Err(e) => {
                let message = e.to_string();
                shared.table.update(id, |r| {
                    r.status = AnalysisStatus::Failed;
                    r.reason = Some(message.clone());
                });
                error!(error = %message, "Analysis failed");
                (AnalysisStatus::Failed, Notification::Error { message })
            }
        };

        let record = shared
            .table
            .update(id, |r| {
                r.finished_at = Some(Utc::now());
                r.clone()
            })
            .unwrap_or_else(|| {
                let mut r = AnalysisRecord::new(id, submission.filename.clone(), submission.content.len() as u64);
                r.status = status;
                r
            });

        reporter.send(notification).await;
        if let Err(e) = shared.collab.store.save(&record).await {
            warn!(error = %e, "Failed to persist analysis record");
        }

        // the store owns the events from here; the table keeps counts and findings
        shared.table.release_events(id);
        let evicted = shared.table.prune_finished(shared.config.limits.retain_finished);
        if evicted > 0 {
            debug!(evicted, "Evicted finished analyses from the live table");
        }
        record
    }

    async fn stages(
        &self,
        submission: &Submission,
        reporter: &ProgressReporter,
        work: &CancellationToken,
    ) -> IntakeResult<Outcome> {
        let shared = &self.shared;
        let limits = &shared.config.limits;
        let table = &shared.table;
        let id = submission.id;
        let content: &[u8] = &submission.content;

        // ── Validation ──────────────────────────────────────────────
        reporter.enter(AnalysisStatus::Validating, 0).await;
        let bytes = Arc::clone(&submission.content);
        let sha256 = tokio::task::spawn_blocking(move || hex::encode(Sha256::digest(bytes.as_slice())))
            .await
            .map_err(|e| IntakeError::Worker(e.to_string()))?;
        table.update(id, |r| r.sha256 = Some(sha256.clone()));

        match shared.validator.check(&submission.filename, content) {
            Verdict::Accept => {}
            Verdict::Reject(reason) => {
                warn!(reason = %reason, "File rejected");
                table.update(id, |r| {
                    r.status = AnalysisStatus::Rejected;
                    r.reason = Some(reason);
                });
                return Ok(Outcome::Rejected);
            }
            Verdict::Quarantine(reason) => {
                let record = QuarantineRecord {
                    analysis_id: id,
                    filename: submission.filename.clone(),
                    sha256,
                    size: content.len() as u64,
                    reason: reason.clone(),
                    quarantined_at: Utc::now(),
                };
                shared.quarantine.quarantine(&record, content).await?;
                table.update(id, |r| {
                    r.status = AnalysisStatus::Quarantined;
                    r.reason = Some(reason);
                });
                return Ok(Outcome::Quarantined);
            }
        }
        reporter.advance(progress::VALIDATED).await;

        let chunked = content.len() as u64 > limits.chunk_threshold;
        let mode = if chunked { ProcessingMode::Chunked } else { ProcessingMode::Direct };
        table.update(id, |r| r.mode = Some(mode));
        debug!(?mode, size = content.len(), "Processing mode chosen");

        // ── Selection ───────────────────────────────────────────────
        reporter.enter(AnalysisStatus::Selecting, progress::VALIDATED).await;
        let head = &content[..content.len().min(DETECTION_SAMPLE_BYTES)];
        let sample = String::from_utf8_lossy(head);
        let selection = shared
            .registry
            .select(&submission.filename, &sample, submission.preferred.as_deref());

        // bounded input in chunked mode; the whole file otherwise
        let parse_input = if chunked {
            let format = match &selection {
                Selection::Found { parser, .. } => Some(parser.format()),
                Selection::NotFound => None,
            };
            parse_window(content, usize::try_from(limits.chunk_parse_limit).unwrap_or(usize::MAX), format)
        } else {
            Cow::Borrowed(content)
        };
        let text: Arc<str> = Arc::from(String::from_utf8_lossy(&parse_input));

        // ── Parsing ─────────────────────────────────────────────────
        match selection {
            Selection::NotFound => {
                warn!("No parser recognised the file, continuing unparsed");
                table.update(id, |r| {
                    r.warnings.push("no parser recognised the file; continuing unparsed".to_string())
                });
            }
            Selection::Found { parser, name, via_preference } => {
                debug!(parser = %name, via_preference, "Parser selected");
                reporter.enter(AnalysisStatus::Parsing, progress::PARSE_START).await;
                table.update(id, |r| r.parser = Some(name.clone()));

                let result = self.parse(parser, &name, &submission.filename, Arc::clone(&text), work).await?;
                self.record_parse(id, &name, result, chunked.then_some(parse_input.len()));
            }
        }
        reporter.advance(progress::PARSED).await;
        if work.is_cancelled() {
            return Err(IntakeError::Cancelled);
        }

        // ── Extraction ──────────────────────────────────────────────
        reporter.enter(AnalysisStatus::Extracting, progress::PARSED).await;
        let options = ExtractOptions {
            min_confidence: shared.config.stages.ioc_min_confidence,
            max_indicators: shared.config.stages.max_indicators,
            include_context: true,
        };
        let (mut indicators, failure) = if chunked {
            self.extract_chunked(content, &options, reporter, work).await?
        } else {
            match shared.collab.extractor.extract(&text, &options).await {
                Ok(found) => (dedup_indicators(found), None),
                Err(e) => (Vec::new(), Some(e)),
            }
        };
        indicators.truncate(options.max_indicators);
        if let Some(e) = failure {
            warn!(stage = "extract", error = %e, "Stage failed, keeping earlier results");
            table.update(id, |r| r.stage_failed(Stage::Extract, format!("extract: {}", e)));
        }
        let found = indicators.len();
        table.update(id, |r| r.indicators = indicators.clone());
        reporter.send(Notification::IocFound { count: found }).await;
        reporter.advance(progress::EXTRACTED).await;

        // ── Mapping ─────────────────────────────────────────────────
        reporter.enter(AnalysisStatus::Mapping, progress::EXTRACTED).await;
        match shared.collab.mapper.map(&indicators).await {
            Ok(techniques) => {
                let count = techniques.len();
                table.update(id, |r| r.techniques = techniques);
                reporter.send(Notification::TechniqueMapped { count }).await;
            }
            Err(e) => {
                warn!(stage = "map", error = %e, "Stage failed, keeping earlier results");
                table.update(id, |r| r.stage_failed(Stage::Map, format!("map: {}", e)));
            }
        }
        reporter.advance(progress::MAPPED).await;

        // ── Summarizing ─────────────────────────────────────────────
        if shared.config.stages.summarize {
            reporter.enter(AnalysisStatus::Summarizing, progress::MAPPED).await;
            let options = SummaryOptions {
                max_words: shared.config.stages.summary_max_words,
                filename: submission.filename.clone(),
            };
            match shared.collab.summarizer.summarize(&text, &options).await {
                Ok(summary) => {
                    table.update(id, |r| r.summary = Some(summary));
                }
                Err(e) => {
                    warn!(stage = "summarize", error = %e, "Stage failed, keeping earlier results");
                    table.update(id, |r| r.stage_failed(Stage::Summarize, format!("summarize: {}", e)));
                }
            }
        }

        Ok(Outcome::Completed)
    }

    /// Run the parser on a blocking thread under `parse_timeout`.
    ///
    /// `Ok(None)` means the parser did not produce a usable result in time.
    async fn parse(
        &self,
        parser: Arc<dyn LogParser>,
        name: &str,
        filename: &str,
        text: Arc<str>,
        work: &CancellationToken,
    ) -> IntakeResult<Option<ParseResult>> {
        let shared = &self.shared;
        let metrics = shared.registry.metrics();
        let timeout = shared.config.limits.parse_timeout();

        let token = work.child_token();
        let task_token = token.clone();
        let task_parser = Arc::clone(&parser);
        let path = filename.to_string();
        let task = tokio::task::spawn_blocking(move || {
            guarded_parse(task_parser.as_ref(), &path, &text, &task_token)
        });

        match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                token.cancel();
                metrics.record_error(MetricErrorType::Timeout);
                warn!(parser = name, ?timeout, "Parser timed out");
                Ok(None)
            }
            Ok(Err(join)) => {
                metrics.record_error(MetricErrorType::Panic);
                warn!(parser = name, error = %join, "Parser task aborted");
                Ok(None)
            }
            Ok(Ok(result)) => {
                metrics.record_result(parser.format(), &result);
                if result.is_cancelled() {
                    return Err(IntakeError::Cancelled);
                }
                Ok(Some(result))
            }
        }
    }

    fn record_parse(&self, id: AnalysisId, name: &str, result: Option<ParseResult>, window: Option<usize>) {
        let table = &self.shared.table;
        match result {
            Some(result) if result.success() => {
                info!(parser = name, events = result.event_count, elapsed = ?result.elapsed, "Parse completed");
                table.update(id, move |r| {
                    r.parse_status = Some(ParseStatus::Completed);
                    r.event_count = result.event_count;
                    r.parse_metadata = result.metadata;
                    if let Some(bytes) = window {
                        r.parse_metadata.insert("parse_window_bytes".into(), bytes.to_string());
                        r.parse_metadata.insert("parse_window_partial".into(), (bytes < r.size as usize).to_string());
                    }
                    r.events = result.events;
                });
            }
            Some(result) => {
                let message = result.error_message.unwrap_or_else(|| "unknown error".to_string());
                warn!(parser = name, error = %message, "Parser failed, continuing unparsed");
                table.update(id, |r| {
                    r.parse_status = Some(ParseStatus::Failed);
                    r.warnings.push(format!("parser {} failed: {}; continuing unparsed", name, message));
                });
            }
            None => {
                table.update(id, |r| {
                    r.parse_status = Some(ParseStatus::Failed);
                    r.warnings.push(format!("parser {} did not finish; continuing unparsed", name));
                });
            }
        }
    }

    async fn extract_chunked(
        &self,
        content: &[u8],
        options: &ExtractOptions,
        reporter: &ProgressReporter,
        work: &CancellationToken,
    ) -> IntakeResult<(Vec<Indicator>, Option<CollabError>)> {
        let limits = &self.shared.config.limits;
        let extractor = &self.shared.collab.extractor;
        let mut merger = IndicatorMerger::new();

        for chunk in text_chunks(content, limits.chunk_chars) {
            if work.is_cancelled() {
                return Err(IntakeError::Cancelled);
            }
            match extractor.extract(&chunk.text, options).await {
                Ok(batch) => merger.add(batch),
                Err(e) => {
                    debug!(chunk = chunk.index, "Extraction failed mid-file");
                    return Ok((merger.finish(), Some(e)));
                }
            }
            reporter.advance(bytes_percent(chunk.bytes_end, content.len())).await;
            if (chunk.index + 1) % limits.yield_every.max(1) == 0 {
                tokio::task::yield_now().await;
            }
        }

        debug!(seen = merger.seen(), unique = merger.len(), "Merged chunk indicators");
        Ok((merger.finish(), None))
    }
}
