/// Evidence parsing and normalization module
///
/// This module decides which reader understands an evidence file and turns
/// its content into normalized [`LogEvent`]s.
///
/// # Architecture
///
/// - `traits.rs`: Core traits for detectors and parsers
/// - `model.rs`: Events, results, detection and validation types
/// - `context.rs`: Injected clock and per-parse limits
/// - `fields.rs`: Alias-based field mapping shared by structured formats
/// - `sample.rs`: Detection sampling and extension matching
/// - `run.rs`: Shared parse loop bookkeeping (cancellation, limits, timing)
/// - `guard.rs`: Panic containment around parser execution
/// - `formats/`: Individual format parser implementations
/// - `metrics.rs`: Selection and parsing metrics
///
/// # Safety Guarantees
///
/// All parsers implement:
/// - Bounded memory (event cap, line size limit)
/// - Panic safety (catch_unwind wrapper)
/// - Cooperative cancellation (checked once per record)
/// - Raw text preservation (every event keeps its source text verbatim)

pub mod traits;
pub mod model;
pub mod context;
pub mod fields;
pub mod sample;
pub mod metrics;
pub mod formats;
pub(crate) mod run;
mod guard;

// Re-export commonly used types
pub use traits::{FormatDetector, LogParser};
pub use model::{
    DetectionResult, Diagnostic, DiagnosticSeverity, LogEvent, LogFormat, ParseError, ParseResult,
    ParseStatus, ParserInfo, Severity, TimestampSource, ValidationResult,
};
pub use context::{Clock, FixedClock, ParserContext, SystemClock};
pub use guard::guarded_parse;
pub use sample::{detection_sample, extension_matches};

// Constants
pub const MAX_LINE_SIZE: usize = 1_048_576; // 1MB
pub const DETECTION_SAMPLE_BYTES: usize = 8 * 1024;
pub const DEFAULT_MAX_EVENTS: usize = 1_000_000;
