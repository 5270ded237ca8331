//! Manifest: the TOML shape of a user-submitted parser.

use serde::Deserialize;
use std::collections::BTreeMap;
use toml::Spanned;

pub const DEFAULT_CONSTRUCTOR: &str = "default";
pub const DEFAULT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_SAMPLE_LINES: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub parser: ParserSection,
    #[serde(default)]
    pub detect: Option<DetectSection>,
    #[serde(default)]
    pub rules: Vec<RuleSection>,
    /// Static fields stamped onto every event
    #[serde(default)]
    pub fields: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserSection {
    pub name: Spanned<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default = "default_constructor")]
    pub constructor: Spanned<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectSection {
    pub pattern: Spanned<String>,
    #[serde(default)]
    pub threshold: Option<Spanned<f64>>,
    #[serde(default)]
    pub sample_lines: Option<usize>,
    #[serde(default)]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSection {
    #[serde(default)]
    pub name: Option<String>,
    pub pattern: Spanned<String>,
    #[serde(default)]
    pub timestamp_format: Option<Spanned<String>>,
    #[serde(default)]
    pub level: Option<Spanned<String>>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_constructor() -> Spanned<String> {
    Spanned::new(0..0, DEFAULT_CONSTRUCTOR.to_string())
}

/// Keys each table accepts; anything else is reported as a warning.
pub(crate) const TOP_LEVEL_KEYS: &[&str] = &["parser", "detect", "rules", "fields"];
pub(crate) const PARSER_KEYS: &[&str] = &[
    "name", "description", "version", "author", "constructor", "extensions", "priority",
];
pub(crate) const DETECT_KEYS: &[&str] = &["pattern", "threshold", "sample_lines", "case_insensitive"];
pub(crate) const RULE_KEYS: &[&str] = &[
    "name", "pattern", "timestamp_format", "level", "source", "case_insensitive",
];

/// 1-based line and column of a byte offset.
pub(crate) fn position(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map(|nl| offset - nl).unwrap_or(offset + 1);
    (line, column)
}

/// Locate the first `key = ...` assignment after `from`, for diagnostics on
/// values that carry no span of their own.
pub(crate) fn locate_key(source: &str, key: &str, from: usize) -> (usize, usize) {
    let mut offset = 0usize;
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if offset >= from {
            if let Some(rest) = trimmed.strip_prefix(key) {
                if rest.trim_start().starts_with('=') {
                    let indent = line.len() - trimmed.len();
                    return position(source, offset + indent);
                }
            }
        }
        offset += line.len();
    }
    position(source, from)
}

/// Byte offset where the `[header]` or `[[header]]` table starts (nth occurrence).
pub(crate) fn table_offset(source: &str, header: &str, nth: usize) -> usize {
    let single = format!("[{}]", header);
    let array = format!("[[{}]]", header);
    let mut offset = 0usize;
    let mut seen = 0usize;
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed == single || trimmed == array {
            if seen == nth {
                return offset;
            }
            seen += 1;
        }
        offset += line.len();
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_manifest_defaults() {
        let manifest: Manifest = toml::from_str("[parser]\nname = \"x\"\n").unwrap();
        assert_eq!(manifest.parser.name.get_ref(), "x");
        assert_eq!(manifest.parser.constructor.get_ref(), DEFAULT_CONSTRUCTOR);
        assert_eq!(manifest.parser.version, "0.1.0");
        assert!(manifest.detect.is_none());
        assert!(manifest.rules.is_empty());
    }

    #[test]
    fn test_position_is_one_based() {
        let source = "ab\ncd";
        assert_eq!(position(source, 0), (1, 1));
        assert_eq!(position(source, 4), (2, 2));
    }

    #[test]
    fn test_locate_key_after_offset() {
        let source = "[detect]\npattern = 'a'\n[[rules]]\n  pattern = 'b'\n";
        let rules = table_offset(source, "rules", 0);
        assert_eq!(locate_key(source, "pattern", rules), (4, 3));
        assert_eq!(locate_key(source, "pattern", 0), (2, 1));
    }
}
