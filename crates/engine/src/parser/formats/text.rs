use crate::parser::fields::parse_timestamp;
use crate::parser::formats::syslog::apply_syslog;
use crate::parser::run::{numbered_lines, ParseRun};
use crate::parser::sample::sample_lines;
use crate::parser::traits::*;
use crate::parser::{ParserContext, Severity};
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;

const TEXT_SAMPLE_LINES: usize = 10;
const TEXT_THRESHOLD_PERCENT: u32 = 30;

const LEVELS: &str = r"TRACE|DEBUG|DBG|INFORMATION|INFO|NOTICE|WARNING|WARN|ERROR|ERR|SEVERE|CRITICAL|CRIT|FATAL|ALERT|EMERGENCY|EMERG";
const TIMESTAMP: &str = r"\d{4}[-/]\d{2}[-/]\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?";

static APACHE_COMBINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<client>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<ts>[^\]]+)\] "(?P<request>[^"]*)" (?P<status>\d{3}) (?P<size>\d+|-) "(?P<referer>[^"]*)" "(?P<agent>[^"]*)""#,
    )
    .expect("static apache combined pattern")
});

static APACHE_COMMON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<client>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<ts>[^\]]+)\] "(?P<request>[^"]*)" (?P<status>\d{3}) (?P<size>\d+|-)\s*$"#,
    )
    .expect("static apache common pattern")
});

static TIMESTAMP_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^\[?(?P<ts>{})\]?\s+[\[(<]?(?P<level>{})\b[\])>]?:?\s*(?P<msg>.*)$",
        TIMESTAMP, LEVELS
    ))
    .expect("static timestamp+level pattern")
});

static TIMESTAMP_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^\[?(?P<ts>{})\]?\s*(?P<msg>.*)$", TIMESTAMP))
        .expect("static timestamp pattern")
});

static LEVEL_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^[\[(<]?(?P<level>{})\b[\])>]?:?\s+(?P<msg>.*)$", LEVELS))
        .expect("static level pattern")
});

/// Default W3C field order written by IIS when no `#Fields:` directive precedes the data.
const IIS_DEFAULT_FIELDS: [&str; 15] = [
    "date", "time", "s-ip", "cs-method", "cs-uri-stem", "cs-uri-query", "s-port",
    "cs-username", "c-ip", "cs(User-Agent)", "cs(Referer)", "sc-status",
    "sc-substatus", "sc-win32-status", "time-taken",
];

/// Line grammars in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextPattern {
    Syslog,
    ApacheCombined,
    ApacheCommon,
    Iis,
    TimestampLevel,
    TimestampOnly,
    LevelOnly,
    Unstructured,
}

impl TextPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextPattern::Syslog => "syslog",
            TextPattern::ApacheCombined => "apache_combined",
            TextPattern::ApacheCommon => "apache_common",
            TextPattern::Iis => "iis",
            TextPattern::TimestampLevel => "timestamp_level",
            TextPattern::TimestampOnly => "timestamp_only",
            TextPattern::LevelOnly => "level_only",
            TextPattern::Unstructured => "unstructured",
        }
    }
}

fn w3c_key(name: &str) -> String {
    name.to_ascii_lowercase()
        .replace(['(', '-'], "_")
        .replace(')', "")
}

fn severity_from_status(status: u16) -> Severity {
    match status {
        500..=u16::MAX => Severity::Error,
        400..=499 => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Per-file state carried between lines (IIS `#Fields:` directive).
#[derive(Default)]
struct TextState {
    w3c_fields: Option<Vec<String>>,
}

impl TextState {
    /// Returns true when the line was a W3C directive and carries no event.
    fn directive(&mut self, line: &str) -> bool {
        if !line.starts_with('#') {
            return false;
        }
        if let Some(fields) = line.strip_prefix("#Fields:") {
            self.w3c_fields = Some(fields.split_whitespace().map(String::from).collect());
        }
        true
    }

    fn w3c_columns(&self, tokens: &[&str]) -> Option<Vec<String>> {
        match &self.w3c_fields {
            Some(fields) if fields.len() == tokens.len() => Some(fields.clone()),
            Some(_) => None,
            None if tokens.len() == IIS_DEFAULT_FIELDS.len()
                && tokens[11].len() == 3
                && tokens[11].bytes().all(|b| b.is_ascii_digit()) =>
            {
                Some(IIS_DEFAULT_FIELDS.iter().map(|s| s.to_string()).collect())
            }
            None => None,
        }
    }
}

fn apply_apache(event: &mut LogEvent, caps: &Captures<'_>) {
    let text = |name: &str| caps.name(name).map(|m| m.as_str()).filter(|s| *s != "-");

    if let Some(ts) = text("ts").and_then(parse_timestamp) {
        event.set_timestamp(ts);
    }
    if let Some(client) = text("client") {
        event.insert_field("client_ip", client);
    }
    if let Some(user) = text("user") {
        event.insert_field("user", user);
    }
    let request = caps.name("request").map(|m| m.as_str()).unwrap_or("");
    let mut parts = request.split_whitespace();
    if let (Some(method), Some(path)) = (parts.next(), parts.next()) {
        event.insert_field("method", method);
        event.insert_field("path", path);
        if let Some(protocol) = parts.next() {
            event.insert_field("protocol", protocol);
        }
    }
    if let Some(status) = text("status").and_then(|s| s.parse::<u16>().ok()) {
        event.insert_field("status", status);
        event.severity = severity_from_status(status);
    }
    if let Some(size) = text("size").and_then(|s| s.parse::<u64>().ok()) {
        event.insert_field("bytes", size);
    }
    if let Some(referer) = text("referer") {
        event.insert_field("referer", referer);
    }
    if let Some(agent) = text("agent") {
        event.insert_field("user_agent", agent);
    }
    event.message = request.to_string();
}

fn apply_w3c(event: &mut LogEvent, columns: &[String], tokens: &[&str]) {
    let values: BTreeMap<String, &str> = columns
        .iter()
        .map(|c| w3c_key(c))
        .zip(tokens.iter().copied())
        .collect();

    if let (Some(date), Some(time)) = (values.get("date"), values.get("time")) {
        if let Some(ts) = parse_timestamp(&format!("{} {}", date, time)) {
            event.set_timestamp(ts);
        }
    }
    if let Some(status) = values.get("sc_status").and_then(|s| s.parse::<u16>().ok()) {
        event.severity = severity_from_status(status);
    }
    let method = values.get("cs_method").copied().unwrap_or("");
    let uri = values.get("cs_uri_stem").copied().unwrap_or("");
    event.message = format!("{} {}", method, uri).trim().to_string();

    for (key, value) in values {
        if key != "date" && key != "time" && value != "-" {
            event.insert_field(key, value);
        }
    }
}

fn apply_level(event: &mut LogEvent, caps: &Captures<'_>) {
    if let Some(severity) = caps.name("level").and_then(|m| Severity::from_text(m.as_str())) {
        event.severity = severity;
    }
}

fn apply_timestamp(event: &mut LogEvent, caps: &Captures<'_>) {
    if let Some(ts) = caps.name("ts").and_then(|m| parse_timestamp(m.as_str())) {
        event.set_timestamp(ts);
    }
}

fn message(caps: &Captures<'_>) -> String {
    caps.name("msg").map(|m| m.as_str().trim().to_string()).unwrap_or_default()
}

/// Try each grammar in rank order and fill `event` from the first that matches.
fn apply_line(event: &mut LogEvent, line: &str, state: &TextState, now: DateTime<Utc>) -> TextPattern {
    if apply_syslog(event, line, now).is_some() {
        event.fields.remove("grammar");
        return TextPattern::Syslog;
    }
    if let Some(caps) = APACHE_COMBINED.captures(line) {
        apply_apache(event, &caps);
        return TextPattern::ApacheCombined;
    }
    if let Some(caps) = APACHE_COMMON.captures(line) {
        apply_apache(event, &caps);
        return TextPattern::ApacheCommon;
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if let Some(columns) = state.w3c_columns(&tokens) {
        apply_w3c(event, &columns, &tokens);
        return TextPattern::Iis;
    }
    if let Some(caps) = TIMESTAMP_LEVEL.captures(line) {
        apply_timestamp(event, &caps);
        apply_level(event, &caps);
        event.message = message(&caps);
        return TextPattern::TimestampLevel;
    }
    if let Some(caps) = TIMESTAMP_ONLY.captures(line) {
        apply_timestamp(event, &caps);
        event.message = message(&caps);
        event.severity = Severity::infer(&event.message).unwrap_or(Severity::Info);
        return TextPattern::TimestampOnly;
    }
    if let Some(caps) = LEVEL_ONLY.captures(line) {
        apply_level(event, &caps);
        event.message = message(&caps);
        return TextPattern::LevelOnly;
    }

    event.message = line.to_string();
    event.severity = Severity::infer(line).unwrap_or(Severity::Info);
    TextPattern::Unstructured
}

/// Generic multi-pattern text parser; the lowest-priority fallback.
pub struct TextParser {
    ctx: ParserContext,
    extensions: Vec<String>,
}

impl TextParser {
    pub fn new(ctx: ParserContext) -> Self {
        Self {
            ctx,
            extensions: vec![".log".into(), ".txt".into(), ".out".into(), ".err".into(), "".into()],
        }
    }

    /// Classify each line of `content` without building events.
    fn classify<'c>(&self, lines: impl Iterator<Item = &'c str>) -> Vec<TextPattern> {
        let mut state = TextState::default();
        let now = self.ctx.now();
        let mut patterns = Vec::new();
        for line in lines {
            if state.directive(line) {
                continue;
            }
            let mut scratch = LogEvent::new(0, "", now);
            patterns.push(apply_line(&mut scratch, line, &state, now));
        }
        patterns
    }
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new(ParserContext::default())
    }
}

impl FormatDetector for TextParser {
    fn detect(&self, sample: &str) -> DetectionResult {
        let patterns = self.classify(sample_lines(sample, TEXT_SAMPLE_LINES).into_iter());
        let matched = patterns.iter().filter(|p| **p != TextPattern::Unstructured).count();
        DetectionResult::new(LogFormat::Text, matched, patterns.len())
    }

    fn format(&self) -> LogFormat {
        LogFormat::Text
    }
}

impl LogParser for TextParser {
    fn info(&self) -> ParserInfo {
        ParserInfo {
            name: "text".into(),
            version: "1.0.0".into(),
            format: LogFormat::Text,
            extensions: self.extensions.clone(),
            capabilities: vec![
                "syslog".into(),
                "apache".into(),
                "iis-w3c".into(),
                "timestamp-level".into(),
                "fallback".into(),
            ],
            description: "Generic line-oriented text logs with ranked pattern matching".into(),
        }
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn threshold_percent(&self) -> u32 {
        TEXT_THRESHOLD_PERCENT
    }

    fn parse(&self, path: &str, content: &str, cancel: &CancellationToken) -> ParseResult {
        let mut run = ParseRun::new("text", path, &self.ctx, cancel);
        let mut state = TextState::default();
        let now = self.ctx.now();
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();

        for (line_number, line) in numbered_lines(content) {
            if run.is_cancelled() {
                return run.cancelled();
            }
            if state.directive(line) {
                run.skip();
                continue;
            }
            let mut event = run.event(line_number, line);
            let pattern = apply_line(&mut event, run.bounded(line), &state, now);
            event.insert_field("pattern", pattern.as_str());
            *counts.entry(pattern.as_str()).or_default() += 1;
            if !run.push(event) {
                break;
            }
        }

        for (pattern, count) in counts {
            run.meta(&format!("pattern.{}", pattern), count);
        }
        run.finish()
    }

    fn validate(&self, content: &str) -> ValidationResult {
        let patterns = self.classify(numbered_lines(content).map(|(_, l)| l));
        if patterns.is_empty() {
            return ValidationResult::invalid("Content is empty");
        }

        let mut result = ValidationResult::valid();
        let matched = patterns.iter().filter(|p| **p != TextPattern::Unstructured).count();
        result.suggest("match_percentage", matched * 100 / patterns.len());

        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for p in &patterns {
            *counts.entry(p.as_str()).or_default() += 1;
        }
        if let Some((dominant, _)) = counts.iter().max_by_key(|(_, n)| **n) {
            result.suggest("dominant_pattern", dominant);
        }
        if matched == 0 {
            result.warn("No line matches a known pattern; every line will be kept as unstructured");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::context::FixedClock;
    use chrono::{Datelike, TimeZone, Timelike};
    use serde_json::json;
    use std::sync::Arc;

    fn parser() -> TextParser {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        TextParser::new(ParserContext::new(Arc::new(clock)))
    }

    fn parse_one(line: &str) -> LogEvent {
        let result = parser().parse("app.log", line, &CancellationToken::new());
        result.events.into_iter().next().unwrap()
    }

    #[test]
    fn test_apache_combined() {
        let event = parse_one(
            r#"192.168.1.10 - frank [10/Oct/2000:13:55:36 -0700] "GET /apache_pb.gif HTTP/1.0" 404 2326 "http://example.com/" "Mozilla/4.08""#,
        );
        assert_eq!(event.fields["pattern"], json!("apache_combined"));
        assert_eq!(event.fields["client_ip"], json!("192.168.1.10"));
        assert_eq!(event.fields["status"], json!(404));
        assert_eq!(event.fields["user_agent"], json!("Mozilla/4.08"));
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.timestamp.hour(), 20);
        assert_eq!(event.message, "GET /apache_pb.gif HTTP/1.0");
    }

    #[test]
    fn test_apache_common() {
        let event = parse_one(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "POST /login HTTP/1.1" 500 -"#);
        assert_eq!(event.fields["pattern"], json!("apache_common"));
        assert_eq!(event.severity, Severity::Error);
        assert!(!event.fields.contains_key("bytes"));
    }

    #[test]
    fn test_iis_with_fields_directive() {
        let content = "#Software: Microsoft Internet Information Services 10.0\n\
                       #Fields: date time c-ip cs-method cs-uri-stem sc-status\n\
                       2024-01-15 08:30:00 10.1.1.1 GET /default.aspx 200\n";
        let result = parser().parse("u_ex240115.log", content, &CancellationToken::new());
        assert_eq!(result.event_count, 1);
        assert_eq!(result.metadata["skipped"], "2");
        let event = &result.events[0];
        assert_eq!(event.fields["pattern"], json!("iis"));
        assert_eq!(event.fields["c_ip"], json!("10.1.1.1"));
        assert_eq!(event.message, "GET /default.aspx");
        assert_eq!(event.timestamp.hour(), 8);
        assert_eq!(event.line_number, 3);
    }

    #[test]
    fn test_timestamp_level() {
        let event = parse_one("2024-01-15 10:23:45,123 [ERROR] Connection refused");
        assert_eq!(event.fields["pattern"], json!("timestamp_level"));
        assert_eq!(event.severity, Severity::Error);
        assert_eq!(event.message, "Connection refused");
        assert_eq!(event.timestamp.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_timestamp_only_and_level_only() {
        let event = parse_one("2024-01-15T10:23:45Z service started");
        assert_eq!(event.fields["pattern"], json!("timestamp_only"));
        assert_eq!(event.timestamp.day(), 15);

        let event = parse_one("WARN: disk almost full");
        assert_eq!(event.fields["pattern"], json!("level_only"));
        assert_eq!(event.severity, Severity::Warning);
        assert!(!event.has_parsed_timestamp());
    }

    #[test]
    fn test_syslog_ranked_first() {
        let event = parse_one("Oct 11 22:14:15 mymachine su: 'su root' failed");
        assert_eq!(event.fields["pattern"], json!("syslog"));
        assert_eq!(event.source, "mymachine");
        assert!(!event.fields.contains_key("grammar"));
    }

    #[test]
    fn test_unstructured_lines_kept() {
        let event = parse_one("just some words, nothing else");
        assert_eq!(event.fields["pattern"], json!("unstructured"));
        assert_eq!(event.message, "just some words, nothing else");
        assert_eq!(event.source, "app.log");
    }

    #[test]
    fn test_detection_threshold_over_ten_lines() {
        let p = parser();
        let structured = "2024-01-15 10:00:00 INFO ok";
        let mut lines = vec![structured; 3];
        lines.extend(vec!["free text"; 7]);
        assert!(p.probe("app.log", &lines.join("\n")));

        let mut lines = vec![structured; 2];
        lines.extend(vec!["free text"; 8]);
        assert!(!p.probe("app.log", &lines.join("\n")));
        assert!(!p.probe("app.json", structured));
    }

    #[test]
    fn test_parse_idempotent_under_fixed_clock() {
        let p = parser();
        let content = "free text\n2024-01-15 10:00:00 INFO ok\n";
        let a = p.parse("a.txt", content, &CancellationToken::new());
        let b = p.parse("a.txt", content, &CancellationToken::new());
        assert_eq!(a.events, b.events);
        assert_eq!(a.events[0].timestamp.year(), 2024);
    }

    #[test]
    fn test_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = parser().parse("a.txt", "line\n", &token);
        assert!(result.is_cancelled());
        assert!(!result.success());
    }

    #[test]
    fn test_validate_dominant_pattern() {
        let content = "2024-01-15 10:00:00 INFO a\n2024-01-15 10:00:01 WARN b\nfree\n";
        let result = parser().validate(content);
        assert!(result.is_valid);
        assert_eq!(result.suggestions["dominant_pattern"], "timestamp_level");
        assert_eq!(result.suggestions["match_percentage"], "66");
    }
}
