use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::model::{ParseError, ParseResult};
use super::traits::LogParser;

/// Run a parser with panic containment.
///
/// A panicking parser (built-in bug or hostile custom manifest) yields a
/// `Failed` result instead of unwinding into the caller.
pub fn guarded_parse(
    parser: &dyn LogParser,
    path: &str,
    content: &str,
    cancel: &CancellationToken,
) -> ParseResult {
    let started = Instant::now();
    match catch_unwind(AssertUnwindSafe(|| parser.parse(path, content, cancel))) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let name = parser.info().name;
            tracing::error!(parser = %name, panic = %detail, "Parser panicked");
            ParseResult::failed(name, ParseError::ParserPanic(detail), started.elapsed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::model::*;

    struct Exploding {
        extensions: Vec<String>,
    }

    impl crate::parser::FormatDetector for Exploding {
        fn detect(&self, _sample: &str) -> DetectionResult {
            panic!("detector bug")
        }
        fn format(&self) -> LogFormat {
            LogFormat::Custom
        }
    }

    impl LogParser for Exploding {
        fn info(&self) -> ParserInfo {
            ParserInfo {
                name: "exploding".into(),
                version: "0".into(),
                format: LogFormat::Custom,
                extensions: self.extensions.clone(),
                capabilities: vec![],
                description: String::new(),
            }
        }
        fn extensions(&self) -> &[String] {
            &self.extensions
        }
        fn threshold_percent(&self) -> u32 {
            50
        }
        fn parse(&self, _path: &str, _content: &str, _cancel: &CancellationToken) -> ParseResult {
            panic!("parser bug")
        }
        fn validate(&self, _content: &str) -> ValidationResult {
            ValidationResult::valid()
        }
    }

    #[test]
    fn test_panicking_parse_becomes_failed() {
        let parser = Exploding { extensions: vec![".log".into()] };
        let result = guarded_parse(&parser, "a.log", "x", &CancellationToken::new());
        assert_eq!(result.status, ParseStatus::Failed);
        assert!(result.error_message.unwrap().contains("parser bug"));
    }

    #[test]
    fn test_panicking_probe_returns_false() {
        let parser = Exploding { extensions: vec![".log".into()] };
        assert!(!parser.probe("a.log", "x"));
    }
}
