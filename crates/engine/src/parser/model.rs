use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Delimited exports (CSV, TSV, semicolon or pipe separated)
    Csv,
    /// Single JSON document, array of objects, or JSON Lines
    Json,
    /// Syslog (RFC 3164 / RFC 5424)
    Syslog,
    /// Windows Event Log exports (XML, text, CSV)
    WindowsEvent,
    /// Generic multi-pattern text (fallback)
    Text,
    /// User-supplied parser manifest
    Custom,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Csv => "csv",
            LogFormat::Json => "json",
            LogFormat::Syslog => "syslog",
            LogFormat::WindowsEvent => "windows_event",
            LogFormat::Text => "text",
            LogFormat::Custom => "custom",
        }
    }
}

/// Normalized severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Parse a level keyword ("warn", "Information", "FATAL", ...).
    pub fn from_text(text: &str) -> Option<Severity> {
        let lowered = text.trim().to_ascii_lowercase();
        let word = lowered.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        match word {
            "trace" | "trc" | "verbose" | "finest" => Some(Severity::Trace),
            "debug" | "dbg" | "fine" => Some(Severity::Debug),
            "info" | "inf" | "information" | "informational" | "notice" | "audit success" => {
                Some(Severity::Info)
            }
            "warn" | "wrn" | "warning" | "audit failure" => Some(Severity::Warning),
            "error" | "err" | "eror" | "fail" | "failed" | "failure" | "severe" => Some(Severity::Error),
            "critical" | "crit" | "fatal" | "emerg" | "emergency" | "alert" | "panic" => {
                Some(Severity::Critical)
            }
            _ => None,
        }
    }

    /// Scan free text for the most severe level keyword it mentions.
    pub fn infer(text: &str) -> Option<Severity> {
        text.split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty() && w.len() <= 11)
            .filter_map(Severity::from_text)
            .max()
    }

    /// Syslog severity (RFC 5424 §6.2.1): 0=Emergency … 7=Debug.
    pub fn from_syslog(code: u8) -> Severity {
        match code {
            0..=2 => Severity::Critical,
            3 => Severity::Error,
            4 => Severity::Warning,
            5 | 6 => Severity::Info,
            _ => Severity::Debug,
        }
    }

    /// Windows event level: 1=Critical, 2=Error, 3=Warning, 4=Information, 5=Verbose.
    pub fn from_windows_level(level: u8) -> Severity {
        match level {
            1 => Severity::Critical,
            2 => Severity::Error,
            3 => Severity::Warning,
            5 => Severity::Trace,
            _ => Severity::Info,
        }
    }
}

/// Whether an event's timestamp came from the evidence or was defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    Parsed,
    /// Missing or unparseable in the source; set to ingestion time.
    Ingested,
}

/// One normalized parsed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Always UTC
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub severity: Severity,
    pub message: String,
    /// Origin label (host, provider, file name)
    pub source: String,
    /// 1-based position in the source
    pub line_number: usize,
    /// Original text, preserved verbatim for chain of custody
    pub raw: String,
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl LogEvent {
    /// Create an event with ingestion-time defaults.
    pub fn new(line_number: usize, raw: impl Into<String>, ingested_at: DateTime<Utc>) -> Self {
        Self {
            timestamp: ingested_at,
            timestamp_source: TimestampSource::Ingested,
            severity: Severity::Info,
            message: String::new(),
            source: String::new(),
            line_number,
            raw: raw.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp;
        self.timestamp_source = TimestampSource::Parsed;
    }

    pub fn insert_field(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn has_parsed_timestamp(&self) -> bool {
        self.timestamp_source == TimestampSource::Parsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionResult {
    pub format: LogFormat,
    /// Fraction of sampled records that matched (0.0 - 1.0)
    pub confidence: f32,
    pub matched: usize,
    pub sampled: usize,
}

impl DetectionResult {
    pub fn new(format: LogFormat, matched: usize, sampled: usize) -> Self {
        let confidence = if sampled == 0 {
            0.0
        } else {
            (matched as f32 / sampled as f32).clamp(0.0, 1.0)
        };
        Self { format, confidence, matched, sampled }
    }

    pub fn no_match(format: LogFormat) -> Self {
        Self { format, confidence: 0.0, matched: 0, sampled: 0 }
    }

    /// Integer comparison so thresholds like 80% are exact for 4 of 5.
    pub fn meets(&self, threshold_percent: u32) -> bool {
        self.sampled > 0 && self.matched * 100 >= self.sampled * threshold_percent as usize
    }

    pub fn percentage(&self) -> u32 {
        (self.confidence * 100.0).round() as u32
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Line too large: {0} bytes (max: {1} bytes)")]
    LineTooLarge(usize, usize),

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Parser panic: {0}")]
    ParserPanic(String),

    #[error("Parse failed: {0}")]
    ParseFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Completed,
    Failed,
    /// Cooperative cancellation; never reported as a failure
    Cancelled,
}

/// Outcome of one parser invocation. Built once, never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ParseResult {
    pub status: ParseStatus,
    pub events: Vec<LogEvent>,
    pub event_count: usize,
    pub elapsed: Duration,
    pub parser: String,
    pub error_message: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ParseResult {
    pub fn completed(
        parser: impl Into<String>,
        events: Vec<LogEvent>,
        elapsed: Duration,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            status: ParseStatus::Completed,
            event_count: events.len(),
            events,
            elapsed,
            parser: parser.into(),
            error_message: None,
            metadata,
        }
    }

    pub fn failed(parser: impl Into<String>, error: ParseError, elapsed: Duration) -> Self {
        Self {
            status: ParseStatus::Failed,
            events: Vec::new(),
            event_count: 0,
            elapsed,
            parser: parser.into(),
            error_message: Some(error.to_string()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn cancelled(parser: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: ParseStatus::Cancelled,
            events: Vec::new(),
            event_count: 0,
            elapsed,
            parser: parser.into(),
            error_message: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == ParseStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ParseStatus::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

/// A located message about parser source or content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub severity: DiagnosticSeverity,
}

impl Diagnostic {
    pub fn error(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self { line, column, message: message.into(), severity: DiagnosticSeverity::Error }
    }

    pub fn warning(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self { line, column, message: message.into(), severity: DiagnosticSeverity::Warning }
    }

    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Dry-run feedback for content or parser source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Format-specific hints (detected delimiter, match percentage, ...)
    pub suggestions: BTreeMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self { is_valid: true, ..Self::default() }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self { is_valid: false, errors: vec![error.into()], ..Self::default() }
    }

    pub fn error(&mut self, error: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(error.into());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn suggest(&mut self, key: impl Into<String>, value: impl ToString) {
        self.suggestions.insert(key.into(), value.to_string());
    }

    /// Build from compiler diagnostics: errors block, warnings advise.
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let mut result = Self::valid();
        for diagnostic in &diagnostics {
            match diagnostic.severity {
                DiagnosticSeverity::Error => result.error(diagnostic.to_string()),
                DiagnosticSeverity::Warning => result.warn(diagnostic.to_string()),
                DiagnosticSeverity::Info => {}
            }
        }
        result.diagnostics = diagnostics;
        result
    }
}

/// Static description of a parser for registry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserInfo {
    pub name: String,
    pub version: String,
    pub format: LogFormat,
    pub extensions: Vec<String>,
    pub capabilities: Vec<String>,
    pub description: String,
}
