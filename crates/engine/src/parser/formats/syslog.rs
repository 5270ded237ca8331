use crate::parser::fields::parse_timestamp;
use crate::parser::run::{numbered_lines, ParseRun};
use crate::parser::sample::sample_lines;
use crate::parser::traits::*;
use crate::parser::{ParserContext, Severity};
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Utc};
use regex::{Captures, Regex};
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;

const SYSLOG_SAMPLE_LINES: usize = 5;
const SYSLOG_THRESHOLD_PERCENT: u32 = 60;

/// `<PRI>VERSION TIMESTAMP HOST APP PROCID MSGID SD [MSG]`
static RFC5424: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^<(?P<pri>\d{1,3})>(?P<version>\d{1,2}) (?P<ts>\S+) (?P<host>\S+) (?P<app>\S+) (?P<procid>\S+) (?P<msgid>\S+) (?P<sd>-|(?:\[(?:[^\]\\]|\\.)*\])+)(?: (?P<msg>.*))?$",
    )
    .expect("static RFC 5424 pattern")
});

/// `[<PRI>]MMM dd HH:MM:SS host [tag[pid]: ]msg`
static RFC3164: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:<(?P<pri>\d{1,3})>)?(?P<ts>[A-Z][a-z]{2} {1,2}\d{1,2} \d{2}:\d{2}:\d{2}) (?P<host>\S+) (?:(?P<tag>[^:\[\s]+)(?:\[(?P<pid>\d+)\])?: )?(?P<msg>.*)$",
    )
    .expect("static RFC 3164 pattern")
});

/// Syslog facility names (RFC 5424 §6.2.1)
const SYSLOG_FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news",
    "uucp", "cron", "authpriv", "ftp", "ntp", "audit", "alert", "clock",
    "local0", "local1", "local2", "local3", "local4", "local5", "local6", "local7",
];

/// Syslog severity names (RFC 5424 §6.2.1)
const SYSLOG_SEVERITIES: [&str; 8] = [
    "emergency", "alert", "critical", "error",
    "warning", "notice", "info", "debug",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    Rfc3164,
    Rfc5424,
}

impl Grammar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grammar::Rfc3164 => "rfc3164",
            Grammar::Rfc5424 => "rfc5424",
        }
    }
}

pub fn grammar_of(line: &str) -> Option<Grammar> {
    if RFC5424.is_match(line) {
        Some(Grammar::Rfc5424)
    } else if RFC3164.is_match(line) {
        Some(Grammar::Rfc3164)
    } else {
        None
    }
}

/// Resolve an RFC 3164 timestamp, which carries no year.
///
/// The current year is assumed; a result more than a day ahead of `now`
/// belongs to the previous year (December logs read in January).
pub fn resolve_bsd_timestamp(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let at_year = |year: i32| {
        NaiveDateTime::parse_from_str(&format!("{} {}", year, normalized), "%Y %b %d %H:%M:%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    };

    match at_year(now.year()) {
        Some(ts) if ts > now + Duration::days(1) => at_year(now.year() - 1),
        Some(ts) => Some(ts),
        // Feb 29 outside a leap year
        None => at_year(now.year() - 1),
    }
}

fn apply_priority(event: &mut LogEvent, pri: Option<&str>) -> bool {
    let Some(pri) = pri.and_then(|p| p.parse::<u16>().ok()).filter(|p| *p <= 191) else {
        return false;
    };
    let facility = (pri >> 3) as usize;
    let severity = (pri & 0x07) as u8;

    event.severity = Severity::from_syslog(severity);
    event.insert_field("priority", pri);
    event.insert_field("syslog_severity", SYSLOG_SEVERITIES[severity as usize]);
    if let Some(name) = SYSLOG_FACILITIES.get(facility) {
        event.insert_field("facility", *name);
    }
    true
}

fn non_nil<'t>(caps: &Captures<'t>, name: &str) -> Option<&'t str> {
    caps.name(name).map(|m| m.as_str()).filter(|s| *s != "-" && !s.is_empty())
}

/// Fill `event` from a syslog line. Returns the grammar that matched.
///
/// Shared with the generic text parser, which ranks syslog first.
pub(crate) fn apply_syslog(event: &mut LogEvent, line: &str, now: DateTime<Utc>) -> Option<Grammar> {
    if let Some(caps) = RFC5424.captures(line) {
        let from_pri = apply_priority(event, caps.name("pri").map(|m| m.as_str()));
        if let Some(ts) = non_nil(&caps, "ts").and_then(parse_timestamp) {
            event.set_timestamp(ts);
        }
        if let Some(host) = non_nil(&caps, "host") {
            event.source = host.to_string();
        }
        if let Some(app) = non_nil(&caps, "app") {
            event.insert_field("app", app);
        }
        if let Some(pid) = non_nil(&caps, "procid") {
            event.insert_field("pid", pid);
        }
        if let Some(msgid) = non_nil(&caps, "msgid") {
            event.insert_field("msgid", msgid);
        }
        if let Some(sd) = non_nil(&caps, "sd") {
            event.insert_field("structured_data", sd);
        }
        event.message = caps
            .name("msg")
            .map(|m| m.as_str().trim_start_matches('\u{feff}').to_string())
            .unwrap_or_default();
        if !from_pri {
            event.severity = Severity::infer(&event.message).unwrap_or(Severity::Info);
        }
        event.insert_field("grammar", Grammar::Rfc5424.as_str());
        return Some(Grammar::Rfc5424);
    }

    if let Some(caps) = RFC3164.captures(line) {
        let from_pri = apply_priority(event, caps.name("pri").map(|m| m.as_str()));
        if let Some(ts) = caps.name("ts").and_then(|m| resolve_bsd_timestamp(m.as_str(), now)) {
            event.set_timestamp(ts);
        }
        if let Some(host) = caps.name("host") {
            event.source = host.as_str().to_string();
        }
        if let Some(tag) = caps.name("tag") {
            event.insert_field("app", tag.as_str());
        }
        if let Some(pid) = caps.name("pid") {
            event.insert_field("pid", pid.as_str());
        }
        event.message = caps.name("msg").map(|m| m.as_str().to_string()).unwrap_or_default();
        if !from_pri {
            event.severity = Severity::infer(&event.message).unwrap_or(Severity::Info);
        }
        event.insert_field("grammar", Grammar::Rfc3164.as_str());
        return Some(Grammar::Rfc3164);
    }

    None
}

/// Parser for syslog files (RFC 3164 and RFC 5424).
///
/// Extracts priority, facility, hostname, app-name, process id and message
/// from each line. Lines that match neither grammar are kept as plain events.
pub struct SyslogParser {
    ctx: ParserContext,
    extensions: Vec<String>,
}

impl SyslogParser {
    pub fn new(ctx: ParserContext) -> Self {
        Self {
            ctx,
            extensions: vec![".log".into(), ".syslog".into(), ".txt".into(), "".into()],
        }
    }
}

impl Default for SyslogParser {
    fn default() -> Self {
        Self::new(ParserContext::default())
    }
}

impl FormatDetector for SyslogParser {
    fn detect(&self, sample: &str) -> DetectionResult {
        let lines = sample_lines(sample, SYSLOG_SAMPLE_LINES);
        let matched = lines.iter().filter(|l| grammar_of(l).is_some()).count();
        DetectionResult::new(LogFormat::Syslog, matched, lines.len())
    }

    fn format(&self) -> LogFormat {
        LogFormat::Syslog
    }
}

impl LogParser for SyslogParser {
    fn info(&self) -> ParserInfo {
        ParserInfo {
            name: "syslog".into(),
            version: "1.0.0".into(),
            format: LogFormat::Syslog,
            extensions: self.extensions.clone(),
            capabilities: vec!["rfc3164".into(), "rfc5424".into(), "priority-decoding".into()],
            description: "BSD (RFC 3164) and structured (RFC 5424) syslog".into(),
        }
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn threshold_percent(&self) -> u32 {
        SYSLOG_THRESHOLD_PERCENT
    }

    fn parse(&self, path: &str, content: &str, cancel: &CancellationToken) -> ParseResult {
        let mut run = ParseRun::new("syslog", path, &self.ctx, cancel);
        let now = self.ctx.now();
        let mut unmatched = 0usize;

        for (line_number, line) in numbered_lines(content) {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let mut event = run.event(line_number, line);
            let text = run.bounded(line);
            if apply_syslog(&mut event, text, now).is_none() {
                unmatched += 1;
                event.message = text.to_string();
                event.severity = Severity::infer(text).unwrap_or(Severity::Info);
            }
            if !run.push(event) {
                break;
            }
        }

        run.meta("unmatched", unmatched);
        run.finish()
    }

    fn validate(&self, content: &str) -> ValidationResult {
        let lines: Vec<&str> = numbered_lines(content).map(|(_, l)| l).collect();
        if lines.is_empty() {
            return ValidationResult::invalid("Content is empty");
        }

        let mut rfc3164 = 0usize;
        let mut rfc5424 = 0usize;
        for line in &lines {
            match grammar_of(line) {
                Some(Grammar::Rfc3164) => rfc3164 += 1,
                Some(Grammar::Rfc5424) => rfc5424 += 1,
                None => {}
            }
        }

        let mut result = ValidationResult::valid();
        let matched = rfc3164 + rfc5424;
        result.suggest("match_percentage", matched * 100 / lines.len());
        if matched == 0 {
            result.error("No line matches RFC 3164 or RFC 5424 syslog");
            return result;
        }
        let dominant = if rfc5424 > rfc3164 { Grammar::Rfc5424 } else { Grammar::Rfc3164 };
        result.suggest("grammar", dominant.as_str());
        if matched < lines.len() {
            result.warn(format!("{} line(s) do not match a syslog grammar", lines.len() - matched));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::context::FixedClock;
    use chrono::Timelike;
    use serde_json::json;
    use std::sync::Arc;

    fn parser_at(now: DateTime<Utc>) -> SyslogParser {
        SyslogParser::new(ParserContext::new(Arc::new(FixedClock(now))))
    }

    fn parser() -> SyslogParser {
        parser_at(Utc.with_ymd_and_hms(2024, 11, 20, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_rfc3164_without_priority() {
        let result = parser().parse(
            "auth.log",
            "Oct 11 22:14:15 mymachine su: 'su root' failed",
            &CancellationToken::new(),
        );
        let event = &result.events[0];
        assert_eq!(event.source, "mymachine");
        assert_eq!(event.message, "'su root' failed");
        assert_eq!(event.fields["app"], json!("su"));
        assert_eq!(event.fields["grammar"], json!("rfc3164"));
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2024, 10, 11, 22, 14, 15).unwrap());
    }

    #[test]
    fn test_rfc3164_priority_overrides_text() {
        let line = "<34>Oct 11 22:14:15 mymachine sshd[4721]: info: session opened";
        let result = parser().parse("auth.log", line, &CancellationToken::new());
        let event = &result.events[0];
        // pri=34 => facility=4 (auth), severity=2 (critical)
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.fields["facility"], json!("auth"));
        assert_eq!(event.fields["pid"], json!("4721"));
        assert_eq!(event.raw, line);
    }

    #[test]
    fn test_rfc5424() {
        let line = "<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog - ID47 [exampleSDID@32473 iut=\"3\"] An application event";
        let result = parser().parse("app.log", line, &CancellationToken::new());
        let event = &result.events[0];
        // pri=165 => facility=20 (local4), severity=5 (notice)
        assert_eq!(event.severity, Severity::Info);
        assert_eq!(event.fields["facility"], json!("local4"));
        assert_eq!(event.fields["syslog_severity"], json!("notice"));
        assert_eq!(event.fields["app"], json!("evntslog"));
        assert_eq!(event.fields["msgid"], json!("ID47"));
        assert_eq!(event.fields["structured_data"], json!("[exampleSDID@32473 iut=\"3\"]"));
        assert!(!event.fields.contains_key("pid"));
        assert_eq!(event.source, "mymachine.example.com");
        assert_eq!(event.message, "An application event");
        assert_eq!(event.timestamp.hour(), 22);
    }

    #[test]
    fn test_year_rollover_for_future_dates() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap();
        let ts = resolve_bsd_timestamp("Dec 31 23:59:00", now).unwrap();
        assert_eq!(ts.year(), 2024);

        let ts = resolve_bsd_timestamp("Jan  2 09:00:00", now).unwrap();
        assert_eq!(ts.year(), 2025);
    }

    #[test]
    fn test_detection_threshold() {
        let p = parser();
        let good = "Oct 11 22:14:15 host app: a";
        let three_of_five = [good, good, good, "junk", "junk"].join("\n");
        let two_of_five = [good, good, "junk", "junk", "junk"].join("\n");
        assert!(p.probe("messages", &three_of_five));
        assert!(!p.probe("messages", &two_of_five));
        assert!(!p.probe("messages.json", &three_of_five));
    }

    #[test]
    fn test_unmatched_lines_are_kept() {
        let content = "Oct 11 22:14:15 host app: ok\nsomething else entirely\n";
        let result = parser().parse("x.log", content, &CancellationToken::new());
        assert_eq!(result.event_count, 2);
        assert_eq!(result.metadata["unmatched"], "1");
        assert_eq!(result.events[1].message, "something else entirely");
        assert!(!result.events[1].has_parsed_timestamp());
    }

    #[test]
    fn test_validate_suggests_grammar() {
        let result = parser().validate("<13>1 - host app - - - hello\n");
        assert!(result.is_valid);
        assert_eq!(result.suggestions["grammar"], "rfc5424");
        assert!(!parser().validate("nothing here").is_valid);
    }
}
