use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio_util::sync::CancellationToken;

pub use super::model::{
    DetectionResult, LogEvent, LogFormat, ParseResult, ParserInfo, ValidationResult,
};
use super::sample::extension_matches;

pub trait FormatDetector: Send + Sync {
    /// Content-shape check over a sample; confidence is the matching fraction.
    fn detect(&self, sample: &str) -> DetectionResult;
    fn format(&self) -> LogFormat;
}

pub trait LogParser: FormatDetector {
    fn info(&self) -> ParserInfo;

    fn extensions(&self) -> &[String];

    /// Minimum percentage of sampled records that must match.
    fn threshold_percent(&self) -> u32;

    /// Cheap compatibility check: extension allow-list first, content second.
    ///
    /// Never panics; undecidable input yields `false`.
    fn probe(&self, path: &str, sample: &str) -> bool {
        if !extension_matches(self.extensions(), path) {
            return false;
        }
        catch_unwind(AssertUnwindSafe(|| self.detect(sample)))
            .map(|result| result.meets(self.threshold_percent()))
            .unwrap_or(false)
    }

    /// Parse full content. Failures are captured in the result; cancellation
    /// yields a `Cancelled` status.
    fn parse(&self, path: &str, content: &str, cancel: &CancellationToken) -> ParseResult;

    /// Dry-run check of content, independent of `parse`.
    fn validate(&self, content: &str) -> ValidationResult;
}
