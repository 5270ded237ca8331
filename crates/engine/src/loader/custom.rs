use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::compiler::{CompiledRule, RuleProgram};
use super::sink::DiagnosticSink;
use crate::parser::fields::{assign_roles, parse_timestamp, parse_timestamp_with, FieldRole};
use crate::parser::run::{numbered_lines, ParseRun};
use crate::parser::sample::sample_lines;
use crate::parser::traits::*;
use crate::parser::{ParserContext, Severity};

const RULELESS_THRESHOLD_PERCENT: u32 = 50;
const RULELESS_SAMPLE_LINES: usize = 10;

/// A parser interpreted from a compiled manifest.
///
/// It can only run its own regular expressions over the content it is
/// handed; it holds no file, network or process capability.
pub struct CustomParser {
    name: String,
    program: Arc<RuleProgram>,
    ctx: ParserContext,
    extensions: Vec<String>,
    sink: Option<DiagnosticSink>,
}

/// Named capture groups of a rule with their semantic roles resolved once.
struct RuleLayout {
    names: Vec<String>,
    roles: std::collections::HashMap<FieldRole, usize>,
}

impl RuleLayout {
    fn of(rule: &CompiledRule) -> Self {
        let names: Vec<String> = rule.regex.capture_names().flatten().map(String::from).collect();
        let roles = assign_roles(&names);
        Self { names, roles }
    }

    fn role_of(&self, idx: usize) -> Option<FieldRole> {
        self.roles.iter().find(|(_, i)| **i == idx).map(|(role, _)| *role)
    }
}

impl CustomParser {
    /// `default` constructor shape
    pub fn new(name: impl Into<String>, program: Arc<RuleProgram>, ctx: ParserContext) -> Self {
        let extensions = if program.extensions.is_empty() {
            vec!["*".to_string()]
        } else {
            program.extensions.clone()
        };
        Self {
            name: name.into(),
            program,
            ctx,
            extensions,
            sink: None,
        }
    }

    /// `with_diagnostics` constructor shape
    pub fn with_diagnostics(
        name: impl Into<String>,
        program: Arc<RuleProgram>,
        ctx: ParserContext,
        sink: DiagnosticSink,
    ) -> Self {
        let mut parser = Self::new(name, program, ctx);
        parser.sink = Some(sink);
        parser
    }

    pub fn diagnostics(&self) -> Option<&DiagnosticSink> {
        self.sink.as_ref()
    }

    pub fn program(&self) -> &RuleProgram {
        &self.program
    }

    fn matching_rule(&self, line: &str) -> Option<usize> {
        self.program.rules.iter().position(|rule| rule.regex.is_match(line))
    }

    fn apply_rule(&self, event: &mut LogEvent, rule: &CompiledRule, layout: &RuleLayout, line_number: usize, line: &str) {
        let Some(caps) = rule.regex.captures(line) else { return };
        let mut level_captured = false;

        for (idx, name) in layout.names.iter().enumerate() {
            let Some(value) = caps.name(name).map(|m| m.as_str()) else { continue };
            match layout.role_of(idx) {
                Some(FieldRole::Timestamp) => {
                    let parsed = match &rule.timestamp_format {
                        Some(format) => parse_timestamp_with(value, format),
                        None => parse_timestamp(value),
                    };
                    match parsed {
                        Some(ts) => event.set_timestamp(ts),
                        None => {
                            if let Some(sink) = &self.sink {
                                sink.rule_error(line_number, &rule.name, format!("unparseable timestamp `{}`", value));
                            }
                            event.insert_field(name.clone(), value);
                        }
                    }
                }
                Some(FieldRole::Level) => match Severity::from_text(value) {
                    Some(severity) => {
                        event.severity = severity;
                        level_captured = true;
                    }
                    None => event.insert_field(name.clone(), value),
                },
                Some(FieldRole::Message) => event.message = value.to_string(),
                Some(FieldRole::Source) if !value.is_empty() => event.source = value.to_string(),
                _ => event.insert_field(name.clone(), value),
            }
        }

        if !level_captured {
            if let Some(level) = rule.level {
                event.severity = level;
            }
        }
        if let Some(source) = &rule.source {
            if !layout.roles.contains_key(&FieldRole::Source) {
                event.source = source.clone();
            }
        }
        if event.message.is_empty() {
            event.message = line.to_string();
        }
        event.insert_field("rule", rule.name.clone());
    }
}

impl FormatDetector for CustomParser {
    fn detect(&self, sample: &str) -> DetectionResult {
        match &self.program.detect {
            Some(detect) => {
                let lines = sample_lines(sample, detect.sample_lines);
                let matched = lines.iter().filter(|l| detect.regex.is_match(l)).count();
                DetectionResult::new(LogFormat::Custom, matched, lines.len())
            }
            None => {
                let lines = sample_lines(sample, RULELESS_SAMPLE_LINES);
                let matched = lines.iter().filter(|l| self.matching_rule(l).is_some()).count();
                DetectionResult::new(LogFormat::Custom, matched, lines.len())
            }
        }
    }

    fn format(&self) -> LogFormat {
        LogFormat::Custom
    }
}

impl LogParser for CustomParser {
    fn info(&self) -> ParserInfo {
        let mut capabilities = vec!["rules".to_string()];
        if self.program.detect.is_some() {
            capabilities.push("detect".into());
        }
        if self.sink.is_some() {
            capabilities.push("diagnostics".into());
        }
        ParserInfo {
            name: self.name.clone(),
            version: self.program.version.clone(),
            format: LogFormat::Custom,
            extensions: self.extensions.clone(),
            capabilities,
            description: self.program.description.clone(),
        }
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn threshold_percent(&self) -> u32 {
        self.program
            .detect
            .as_ref()
            .map(|d| d.threshold_percent)
            .unwrap_or(RULELESS_THRESHOLD_PERCENT)
    }

    fn parse(&self, path: &str, content: &str, cancel: &CancellationToken) -> ParseResult {
        let mut run = ParseRun::new(&self.name, path, &self.ctx, cancel);
        let layouts: Vec<RuleLayout> = self.program.rules.iter().map(RuleLayout::of).collect();
        let mut unmatched = 0usize;

        for (line_number, line) in numbered_lines(content) {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let text = run.bounded(line);
            let mut event = run.event(line_number, line);
            match self.matching_rule(text) {
                Some(idx) => self.apply_rule(&mut event, &self.program.rules[idx], &layouts[idx], line_number, text),
                None => {
                    unmatched += 1;
                    if let Some(sink) = &self.sink {
                        sink.unmatched(line_number, text);
                    }
                    event.message = text.to_string();
                    event.severity = Severity::infer(text).unwrap_or(Severity::Info);
                    event.insert_field("rule", "unmatched");
                }
            }
            for (key, value) in &self.program.fields {
                event.fields.entry(key.clone()).or_insert_with(|| value.clone());
            }
            if !run.push(event) {
                break;
            }
        }

        run.meta("unmatched", unmatched);
        run.finish()
    }

    fn validate(&self, content: &str) -> ValidationResult {
        let lines: Vec<(usize, &str)> = numbered_lines(content).collect();
        if lines.is_empty() {
            return ValidationResult::invalid("Content is empty");
        }

        let mut hits: BTreeMap<&str, usize> = BTreeMap::new();
        let mut first_miss = None;
        for (line_number, line) in &lines {
            match self.matching_rule(line) {
                Some(idx) => *hits.entry(self.program.rules[idx].name.as_str()).or_default() += 1,
                None => {
                    first_miss.get_or_insert(*line_number);
                }
            }
        }

        let matched: usize = hits.values().sum();
        let mut result = ValidationResult::valid();
        result.suggest("match_percentage", matched * 100 / lines.len());
        for (rule, count) in &hits {
            result.suggest(format!("rule.{}", rule), count);
        }
        if matched == 0 {
            result.error("No line matches any rule");
        } else if let Some(line) = first_miss {
            result.warn(format!("{} line(s) match no rule; first at line {}", lines.len() - matched, line));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::compiler::compile;
    use crate::parser::context::FixedClock;
    use chrono::{TimeZone, Timelike, Utc};
    use serde_json::json;

    const MANIFEST: &str = r#"[parser]
name = "acme-fw"
constructor = "with_diagnostics"
extensions = [".log"]

[detect]
pattern = '^\d{4}-\d{2}-\d{2}'
threshold = 0.5

[[rules]]
name = "deny"
pattern = '^(?P<timestamp>\S+ \S+) DENY (?P<src>\S+) -> (?P<dst>\S+) (?P<message>.*)$'
timestamp_format = "%Y-%m-%d %H:%M:%S"
level = "warning"

[[rules]]
name = "allow"
pattern = '^(?P<timestamp>\S+ \S+) ALLOW (?P<message>.*)$'
source = "edge-fw"

[fields]
vendor = "acme"
"#;

    fn parser(sink: Option<DiagnosticSink>) -> CustomParser {
        let program = Arc::new(compile(MANIFEST).program.unwrap());
        let clock = FixedClock(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let ctx = ParserContext::new(Arc::new(clock));
        match sink {
            Some(sink) => CustomParser::with_diagnostics("acme", program, ctx, sink),
            None => CustomParser::new("acme", program, ctx),
        }
    }

    const CONTENT: &str = "2024-03-01 10:00:00 DENY 10.0.0.1 -> 10.0.0.2 blocked tcp/445\n\
                           2024-03-01 10:00:01 ALLOW outbound dns\n\
                           garbage line\n";

    #[test]
    fn test_rules_map_named_groups() {
        let result = parser(None).parse("fw.log", CONTENT, &CancellationToken::new());
        assert!(result.success());
        assert_eq!(result.event_count, 3);

        let deny = &result.events[0];
        assert_eq!(deny.severity, Severity::Warning);
        assert_eq!(deny.message, "blocked tcp/445");
        assert_eq!(deny.fields["src"], json!("10.0.0.1"));
        assert_eq!(deny.fields["rule"], json!("deny"));
        assert_eq!(deny.fields["vendor"], json!("acme"));
        assert_eq!(deny.timestamp.hour(), 10);

        let allow = &result.events[1];
        assert_eq!(allow.source, "edge-fw");
        assert_eq!(allow.severity, Severity::Info);

        let miss = &result.events[2];
        assert_eq!(miss.fields["rule"], json!("unmatched"));
        assert_eq!(miss.message, "garbage line");
        assert_eq!(result.metadata["unmatched"], "1");
    }

    #[test]
    fn test_probe_uses_detect_section_and_extensions() {
        let p = parser(None);
        assert!(p.probe("fw.log", CONTENT));
        assert!(!p.probe("fw.csv", CONTENT));
        assert!(!p.probe("fw.log", "a\nb\nc\n"));
    }

    #[test]
    fn test_sink_records_unmatched_lines() {
        let sink = DiagnosticSink::new();
        let p = parser(Some(sink.clone()));
        p.parse("fw.log", CONTENT, &CancellationToken::new());
        assert_eq!(sink.unmatched_count(), 1);
        assert!(p.info().capabilities.contains(&"diagnostics".to_string()));
    }

    #[test]
    fn test_bad_timestamp_reported_to_sink() {
        let sink = DiagnosticSink::new();
        let p = parser(Some(sink.clone()));
        let result = p.parse(
            "fw.log",
            "2024-13-45 99:99:99 ALLOW weird\n",
            &CancellationToken::new(),
        );
        assert!(!result.events[0].has_parsed_timestamp());
        assert_eq!(sink.rule_error_count(), 1);
    }

    #[test]
    fn test_cancellation_is_honoured() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(parser(None).parse("fw.log", CONTENT, &token).is_cancelled());
    }

    #[test]
    fn test_validate_counts_rule_hits() {
        let result = parser(None).validate(CONTENT);
        assert!(result.is_valid);
        assert_eq!(result.suggestions["rule.deny"], "1");
        assert_eq!(result.suggestions["match_percentage"], "66");
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_empty_extensions_mean_any_file() {
        let program = Arc::new(compile("[parser]\nname = \"x\"\n[[rules]]\npattern = '^(?P<message>.+)$'\n").program.unwrap());
        let p = CustomParser::new("x", program, ParserContext::default());
        assert!(p.probe("anything.bin", "hello\nworld\n"));
    }
}
