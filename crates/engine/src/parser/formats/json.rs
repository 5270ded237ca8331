use crate::parser::fields::{assign_roles, flatten_object, timestamp_from_value, value_to_text, FieldRole};
use crate::parser::run::{line_of_offset, numbered_lines, ParseRun};
use crate::parser::sample::sample_lines;
use crate::parser::traits::*;
use crate::parser::{ParseError, ParserContext, Severity};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

const JSONL_SAMPLE_LINES: usize = 5;
const JSON_THRESHOLD_PERCENT: u32 = 80;

/// Surface layout of a JSON evidence file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonLayout {
    /// One top-level object
    Object,
    /// Top-level array of objects
    Array,
    /// One object per line (JSON Lines / NDJSON)
    Lines,
}

impl JsonLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsonLayout::Object => "object",
            JsonLayout::Array => "array",
            JsonLayout::Lines => "jsonl",
        }
    }
}

/// Whole-document check. A sample cut in the middle of a document still
/// counts when the prefix is well formed up to the cut.
fn document_layout(sample: &str) -> Option<JsonLayout> {
    let trimmed = sample.trim_start();
    let looks_like_array = trimmed.starts_with('[') && trimmed[1..].trim_start().starts_with('{');
    if !trimmed.starts_with('{') && !looks_like_array {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(_)) => Some(JsonLayout::Object),
        Ok(Value::Array(items)) if !items.is_empty() && items.iter().all(Value::is_object) => {
            Some(JsonLayout::Array)
        }
        Ok(_) => None,
        Err(e) if e.is_eof() => Some(if looks_like_array { JsonLayout::Array } else { JsonLayout::Object }),
        Err(_) => None,
    }
}

fn is_object_line(line: &str) -> bool {
    matches!(serde_json::from_str::<Value>(line.trim()), Ok(Value::Object(_)))
}

/// JSON document, JSON array and JSON Lines parser
pub struct JsonParser {
    ctx: ParserContext,
    extensions: Vec<String>,
}

impl JsonParser {
    pub fn new(ctx: ParserContext) -> Self {
        Self {
            ctx,
            extensions: vec![".json".into(), ".jsonl".into(), ".ndjson".into(), ".log".into()],
        }
    }

    fn to_event(&self, run: &ParseRun<'_>, line: usize, raw: &str, object: &Map<String, Value>) -> LogEvent {
        let mut event = run.event(line, raw);
        let keys: Vec<&String> = object.keys().collect();
        let roles = assign_roles(&keys);
        let mut rest = object.clone();

        if let Some(idx) = roles.get(&FieldRole::Timestamp) {
            let key = keys[*idx];
            if let Some(ts) = object.get(key).and_then(timestamp_from_value) {
                event.set_timestamp(ts);
                rest.remove(key);
            }
        }
        if let Some(idx) = roles.get(&FieldRole::Level) {
            if let Some(severity) = object.get(keys[*idx]).map(value_to_text).and_then(|t| Severity::from_text(&t)) {
                event.severity = severity;
            }
        }
        if let Some(idx) = roles.get(&FieldRole::Message) {
            let key = keys[*idx];
            if let Some(value) = object.get(key) {
                event.message = value_to_text(value);
                rest.remove(key);
            }
        }
        if let Some(idx) = roles.get(&FieldRole::Source) {
            let key = keys[*idx];
            if let Some(value) = object.get(key).filter(|v| !v.is_null()) {
                event.source = value_to_text(value);
                rest.remove(key);
            }
        }

        if !roles.contains_key(&FieldRole::Level) {
            if let Some(severity) = Severity::infer(&event.message) {
                event.severity = severity;
            }
        }
        if event.message.is_empty() {
            event.message = run.bounded(raw).to_string();
        }

        event.fields.extend(flatten_object(&rest));
        event
    }

    fn parse_array(&self, mut run: ParseRun<'_>, content: &str) -> ParseResult {
        let items: Vec<&RawValue> = match serde_json::from_str(content.trim()) {
            Ok(items) => items,
            Err(e) => return run.fail(ParseError::InvalidFormat(format!("Invalid JSON array: {}", e))),
        };
        let base = content.as_ptr() as usize;

        for item in items {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let raw = item.get();
            let line = line_of_offset(content, (raw.as_ptr() as usize).saturating_sub(base));
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(object)) => {
                    let event = self.to_event(&run, line, raw, &object);
                    if !run.push(event) {
                        break;
                    }
                }
                _ => run.skip(),
            }
        }
        run.finish()
    }

    fn parse_lines(&self, mut run: ParseRun<'_>, content: &str) -> ParseResult {
        for (line, text) in numbered_lines(content) {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let object = match serde_json::from_str::<Value>(run.bounded(text).trim()) {
                Ok(Value::Object(object)) => object,
                Ok(_) | Err(_) => {
                    tracing::debug!(line, "Skipping non-object JSON line");
                    run.skip();
                    continue;
                }
            };
            let event = self.to_event(&run, line, text, &object);
            if !run.push(event) {
                break;
            }
        }
        run.finish()
    }
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new(ParserContext::default())
    }
}

impl FormatDetector for JsonParser {
    fn detect(&self, sample: &str) -> DetectionResult {
        if document_layout(sample).is_some() {
            return DetectionResult::new(LogFormat::Json, 1, 1);
        }

        let lines = sample_lines(sample, JSONL_SAMPLE_LINES);
        let matched = lines.iter().filter(|l| is_object_line(l)).count();
        DetectionResult::new(LogFormat::Json, matched, lines.len())
    }

    fn format(&self) -> LogFormat {
        LogFormat::Json
    }
}

impl LogParser for JsonParser {
    fn info(&self) -> ParserInfo {
        ParserInfo {
            name: "json".into(),
            version: "1.0.0".into(),
            format: LogFormat::Json,
            extensions: self.extensions.clone(),
            capabilities: vec!["jsonl".into(), "array".into(), "flatten-nested".into(), "epoch-timestamps".into()],
            description: "JSON documents, arrays of objects and newline-delimited JSON".into(),
        }
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn threshold_percent(&self) -> u32 {
        JSON_THRESHOLD_PERCENT
    }

    fn parse(&self, path: &str, content: &str, cancel: &CancellationToken) -> ParseResult {
        let mut run = ParseRun::new("json", path, &self.ctx, cancel);
        let trimmed = content.trim();

        if trimmed.starts_with('[') {
            run.meta("layout", JsonLayout::Array.as_str());
            return self.parse_array(run, content);
        }

        if trimmed.starts_with('{') {
            if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
                run.meta("layout", JsonLayout::Object.as_str());
                let offset = content.len() - content.trim_start().len();
                let event = self.to_event(&run, line_of_offset(content, offset), trimmed, &object);
                run.push(event);
                return run.finish();
            }
        }

        run.meta("layout", JsonLayout::Lines.as_str());
        self.parse_lines(run, content)
    }

    fn validate(&self, content: &str) -> ValidationResult {
        if content.trim().is_empty() {
            return ValidationResult::invalid("Content is empty");
        }

        let mut result = ValidationResult::valid();
        if let Some(layout) = document_layout(content) {
            match serde_json::from_str::<Value>(content.trim()) {
                Ok(_) => {
                    result.suggest("layout", layout.as_str());
                    result.suggest("match_percentage", 100);
                }
                Err(e) => result.error(format!("Invalid JSON at line {}, column {}: {}", e.line(), e.column(), e)),
            }
            return result;
        }

        let lines: Vec<&str> = numbered_lines(content).map(|(_, l)| l).collect();
        let valid = lines.iter().filter(|l| is_object_line(l)).count();
        let percentage = valid * 100 / lines.len().max(1);
        result.suggest("layout", JsonLayout::Lines.as_str());
        result.suggest("match_percentage", percentage);

        if valid == 0 {
            result.error("No line contains a JSON object");
        } else if valid < lines.len() {
            result.warn(format!("{} of {} lines are not JSON objects", lines.len() - valid, lines.len()));
        }
        result
    }
}
