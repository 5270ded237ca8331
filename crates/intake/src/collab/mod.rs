//! Collab: narrow async interfaces to downstream analysis stages.
//!
//! The pipeline reaches IOC extraction, technique mapping, summarisation,
//! notification and persistence only through these traits. Shipped
//! implementations live in the submodules; test doubles in `crate::fake`
//! behind the `test-util` feature.

pub mod ioc;
pub mod mitre;
pub mod notify;
pub mod store;

pub use ioc::RegexIocExtractor;
pub use mitre::KeywordMitreMapper;
pub use notify::ChannelNotifier;
pub use store::MemoryAnalysisStore;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::state::{AnalysisId, AnalysisRecord, AnalysisStatus};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Ipv4,
    Domain,
    Url,
    Email,
    Md5,
    Sha1,
    Sha256,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Ipv4 => "ipv4",
            IndicatorKind::Domain => "domain",
            IndicatorKind::Url => "url",
            IndicatorKind::Email => "email",
            IndicatorKind::Md5 => "md5",
            IndicatorKind::Sha1 => "sha1",
            IndicatorKind::Sha256 => "sha256",
        }
    }
}

/// Indicator of compromise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub kind: IndicatorKind,
    pub value: String,
    /// 0.0 - 1.0
    pub confidence: f32,
    pub context: Option<String>,
}

impl Indicator {
    pub fn new(kind: IndicatorKind, value: impl Into<String>, confidence: f32) -> Self {
        Self { kind, value: value.into(), confidence, context: None }
    }

    /// Identity used for deduplication
    pub fn key(&self) -> (IndicatorKind, String) {
        (self.kind, self.value.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractOptions {
    pub min_confidence: f32,
    pub max_indicators: usize,
    pub include_context: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { min_confidence: 0.5, max_indicators: 10_000, include_context: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueMatch {
    pub technique_id: String,
    pub name: String,
    pub tactic: String,
    pub confidence: f32,
    /// Indicator values that produced the match
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryOptions {
    pub max_words: usize,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Progress { status: AnalysisStatus, percent: u8 },
    IocFound { count: usize },
    TechniqueMapped { count: usize },
    Completed { status: AnalysisStatus, partial: bool },
    Error { message: String },
}

pub trait IocExtractor: Send + Sync {
    fn extract<'a>(
        &'a self,
        content: &'a str,
        options: &'a ExtractOptions,
    ) -> BoxFuture<'a, Result<Vec<Indicator>, CollabError>>;
}

pub trait MitreMapper: Send + Sync {
    fn map<'a>(&'a self, indicators: &'a [Indicator]) -> BoxFuture<'a, Result<Vec<TechniqueMatch>, CollabError>>;
}

pub trait Summarizer: Send + Sync {
    fn summarize<'a>(
        &'a self,
        content: &'a str,
        options: &'a SummaryOptions,
    ) -> BoxFuture<'a, Result<String, CollabError>>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, id: AnalysisId, notification: Notification) -> BoxFuture<'_, Result<(), CollabError>>;
}

pub trait AnalysisStore: Send + Sync {
    fn save<'a>(&'a self, record: &'a AnalysisRecord) -> BoxFuture<'a, Result<(), CollabError>>;

    fn load(&self, id: AnalysisId) -> BoxFuture<'_, Result<Option<AnalysisRecord>, CollabError>>;
}

/// Summarizer used when no AI service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSummarizer;

impl Summarizer for DisabledSummarizer {
    fn summarize<'a>(
        &'a self,
        _content: &'a str,
        _options: &'a SummaryOptions,
    ) -> BoxFuture<'a, Result<String, CollabError>> {
        Box::pin(async { Err(CollabError::Unavailable("summarizer".to_string())) })
    }
}
