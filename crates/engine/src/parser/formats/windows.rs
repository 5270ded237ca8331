//! Windows Event Log exports.
//!
//! Three surface encodings reach us from investigators:
//!
//! - XML (`wevtutil qe /f:xml`, Event Viewer "Save as XML")
//! - plain text (`wevtutil qe /f:text`, Event Viewer "Save as Text")
//! - CSV (Event Viewer "Save as CSV")
//!
//! They are mutually exclusive and chosen by sniffing the content. Binary
//! `.evtx` files are recognised but not decoded.

use crate::parser::fields::parse_timestamp;
use crate::parser::formats::csv::read_raw_records;
use crate::parser::run::{line_of_offset, ParseRun};
use crate::parser::traits::*;
use crate::parser::{ParseError, ParserContext, Severity};
use tokio_util::sync::CancellationToken;

const WINDOWS_THRESHOLD_PERCENT: u32 = 50;
const EVTX_MAGIC: &str = "ElfFile\0";
const CSV_EXPORT_HEADER: &str = "Level,Date and Time,Source,Event ID,Task Category";
const WRAPPER_OPEN: &str = "<Events>";
const WRAPPER_CLOSE: &str = "</Events>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowsEncoding {
    Xml,
    Text,
    Csv,
    /// Native binary log; recognised only to report it
    Binary,
}

impl WindowsEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowsEncoding::Xml => "xml",
            WindowsEncoding::Text => "text",
            WindowsEncoding::Csv => "csv",
            WindowsEncoding::Binary => "evtx",
        }
    }
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

/// Decide which export encoding `sample` uses, if any.
pub fn sniff(sample: &str) -> Option<WindowsEncoding> {
    if sample.starts_with(EVTX_MAGIC) {
        return Some(WindowsEncoding::Binary);
    }
    let body = strip_bom(sample);
    if body.contains("<Event") && body.contains("<System") {
        return Some(WindowsEncoding::Xml);
    }
    if body.contains("Log Name:") && body.contains("Event ID:") {
        return Some(WindowsEncoding::Text);
    }
    let first = body.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first.trim().eq_ignore_ascii_case(CSV_EXPORT_HEADER) {
        return Some(WindowsEncoding::Csv);
    }
    None
}

fn find_child<'a, 'input>(
    parent: roxmltree::Node<'a, 'input>,
    local_name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    parent
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == local_name)
}

fn child_text<'a>(parent: roxmltree::Node<'a, '_>, local_name: &str) -> Option<&'a str> {
    find_child(parent, local_name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn collect_text(node: roxmltree::Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

/// `<Data Name="key">value</Data>` pairs from EventData, or the leaf
/// elements of UserData. Unnamed data items become `Data_N`.
fn event_data(event: roxmltree::Node<'_, '_>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    if let Some(data) = find_child(event, "EventData") {
        let mut unnamed = 0usize;
        for child in data.children().filter(|n| n.is_element()) {
            let name = child.attribute("Name").map(String::from).unwrap_or_else(|| {
                unnamed += 1;
                format!("Data_{}", unnamed)
            });
            pairs.push((name, collect_text(child)));
        }
        return pairs;
    }

    if let Some(user_data) = find_child(event, "UserData") {
        for wrapper in user_data.children().filter(|n| n.is_element()) {
            for child in wrapper.children().filter(|n| n.is_element()) {
                pairs.push((child.tag_name().name().to_string(), collect_text(child)));
            }
        }
    }
    pairs
}

/// Replace the XML declaration with spaces so byte offsets stay valid
/// once the body is wrapped in a synthetic root.
fn blank_declaration(content: &str) -> String {
    let mut body = content.to_string();
    if let Some(start) = body.find("<?xml") {
        if let Some(len) = body[start..].find("?>") {
            let end = start + len + 2;
            body.replace_range(start..end, &" ".repeat(end - start));
        }
    }
    body
}

fn kv_field_name(key: &str) -> String {
    key.trim()
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Byte ranges of each record in a text export.
///
/// Records start at `Event[n]:` markers; exports without markers start a
/// record at every `Log Name:` line.
fn text_records(content: &str) -> Vec<(usize, usize)> {
    let mut offsets = Vec::new();
    let mut pos = 0usize;
    for line in content.split_inclusive('\n') {
        offsets.push((pos, line.trim()));
        pos += line.len();
    }

    let has_markers = offsets.iter().any(|(_, l)| is_event_marker(l));
    let starts: Vec<usize> = offsets
        .iter()
        .filter(|(_, l)| if has_markers { is_event_marker(l) } else { l.starts_with("Log Name:") })
        .map(|(start, _)| *start)
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, start)| (*start, starts.get(i + 1).copied().unwrap_or(content.len())))
        .collect()
}

fn is_event_marker(line: &str) -> bool {
    line.strip_prefix("Event[")
        .and_then(|rest| rest.strip_suffix("]:"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Parser for Windows Event Log exports (XML, text, CSV)
pub struct WindowsEventParser {
    ctx: ParserContext,
    extensions: Vec<String>,
}

impl WindowsEventParser {
    pub fn new(ctx: ParserContext) -> Self {
        Self {
            ctx,
            extensions: vec![
                ".evtx.xml".into(),
                ".xml".into(),
                ".txt".into(),
                ".csv".into(),
                ".evtx".into(),
            ],
        }
    }

    fn parse_xml(&self, mut run: ParseRun<'_>, content: &str) -> ParseResult {
        let body = blank_declaration(content);
        let wrapped = format!("{}{}{}", WRAPPER_OPEN, body, WRAPPER_CLOSE);
        let offset = WRAPPER_OPEN.len();

        let doc = match roxmltree::Document::parse(&wrapped) {
            Ok(doc) => doc,
            Err(e) => return run.fail(ParseError::InvalidFormat(format!("Failed to parse XML: {}", e))),
        };

        let events = doc
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "Event")
            .filter(|n| find_child(*n, "System").is_some());

        for node in events {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let range = node.range();
            let start = range.start.saturating_sub(offset).min(content.len());
            let end = range.end.saturating_sub(offset).min(content.len());
            let raw = content.get(start..end).unwrap_or_default();

            let mut event = run.event(line_of_offset(content, start), raw);
            let Some(system) = find_child(node, "System") else { continue };

            let provider = find_child(system, "Provider").and_then(|p| p.attribute("Name"));
            if let Some(provider) = provider {
                event.insert_field("provider", provider);
                event.source = provider.to_string();
            }
            if let Some(id) = child_text(system, "EventID") {
                match id.parse::<u32>() {
                    Ok(n) => event.insert_field("event_id", n),
                    Err(_) => event.insert_field("event_id", id),
                }
            }
            let level = child_text(system, "Level").and_then(|l| l.parse::<u8>().ok()).unwrap_or(0);
            event.severity = Severity::from_windows_level(level);
            event.insert_field("level", level);

            if let Some(ts) = find_child(system, "TimeCreated")
                .and_then(|t| t.attribute("SystemTime"))
                .and_then(parse_timestamp)
            {
                event.set_timestamp(ts);
            }
            if let Some(computer) = child_text(system, "Computer") {
                event.insert_field("computer", computer);
                if provider.is_none() {
                    event.source = computer.to_string();
                }
            }
            if let Some(channel) = child_text(system, "Channel") {
                event.insert_field("channel", channel);
            }
            if let Some(task) = child_text(system, "Task") {
                event.insert_field("task_category", task);
            }
            if let Some(record) = child_text(system, "EventRecordID") {
                event.insert_field("record_id", record);
            }
            if let Some(sid) = find_child(system, "Security").and_then(|s| s.attribute("UserID")) {
                event.insert_field("user_sid", sid);
            }
            if let Some(keywords) = child_text(system, "Keywords") {
                event.insert_field("keywords", keywords);
            }
            if let Some(execution) = find_child(system, "Execution") {
                if let Some(pid) = execution.attribute("ProcessID") {
                    event.insert_field("process_id", pid);
                }
            }

            let data = event_data(node);
            let rendered = find_child(node, "RenderingInfo")
                .and_then(|r| child_text(r, "Message"))
                .map(String::from);
            event.message = rendered.unwrap_or_else(|| {
                data.iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect::<Vec<_>>()
                    .join("; ")
            });
            for (name, value) in data {
                event.fields.entry(name).or_insert_with(|| value.into());
            }

            if !run.push(event) {
                break;
            }
        }

        run.finish()
    }

    fn parse_text(&self, mut run: ParseRun<'_>, content: &str) -> ParseResult {
        for (start, end) in text_records(content) {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let raw = content[start..end].trim_end();
            let mut event = run.event(line_of_offset(content, start), raw);
            let mut description: Option<Vec<&str>> = None;

            for line in raw.lines() {
                if let Some(desc) = description.as_mut() {
                    desc.push(line.trim_end());
                    continue;
                }
                let trimmed = line.trim();
                if is_event_marker(trimmed) {
                    continue;
                }
                let Some((key, value)) = trimmed.split_once(':') else { continue };
                let value = value.trim();
                match key.trim() {
                    "Description" => description = Some(vec![value]),
                    "Log Name" => event.insert_field("channel", value),
                    "Source" => {
                        event.insert_field("provider", value);
                        event.source = value.to_string();
                    }
                    "Date" => match parse_timestamp(value) {
                        Some(ts) => event.set_timestamp(ts),
                        None => event.insert_field("date", value),
                    },
                    "Event ID" => match value.parse::<u32>() {
                        Ok(n) => event.insert_field("event_id", n),
                        Err(_) => event.insert_field("event_id", value),
                    },
                    "Task" | "Task Category" => event.insert_field("task_category", value),
                    "Level" => {
                        event.severity = Severity::from_text(value).unwrap_or(Severity::Info);
                        event.insert_field("level", value);
                    }
                    "User" => event.insert_field("user_sid", value),
                    "Computer" => event.insert_field("computer", value),
                    "Record ID" | "Event Record ID" => event.insert_field("record_id", value),
                    other => event.insert_field(kv_field_name(other), value),
                }
            }

            event.message = description
                .map(|d| d.join("\n").trim().to_string())
                .unwrap_or_default();
            if !run.push(event) {
                break;
            }
        }
        run.finish()
    }

    fn parse_csv_export(&self, mut run: ParseRun<'_>, content: &str) -> ParseResult {
        let records = read_raw_records(content, b',');
        for raw_record in records.into_iter().skip(1) {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let Ok(record) = raw_record.record else {
                run.skip();
                continue;
            };
            let mut event = run.event(raw_record.line, raw_record.raw);
            let column = |i: usize| record.get(i).map(str::trim).unwrap_or("");

            event.severity = Severity::from_text(column(0)).unwrap_or(Severity::Info);
            event.insert_field("level", column(0));
            match parse_timestamp(column(1)) {
                Some(ts) => event.set_timestamp(ts),
                None => event.insert_field("date", column(1)),
            }
            if !column(2).is_empty() {
                event.insert_field("provider", column(2));
                event.source = column(2).to_string();
            }
            match column(3).parse::<u32>() {
                Ok(n) => event.insert_field("event_id", n),
                Err(_) => event.insert_field("event_id", column(3)),
            }
            event.insert_field("task_category", column(4));
            event.message = record.iter().skip(5).collect::<Vec<_>>().join(",").trim().to_string();

            if !run.push(event) {
                break;
            }
        }
        run.finish()
    }
}

impl Default for WindowsEventParser {
    fn default() -> Self {
        Self::new(ParserContext::default())
    }
}

impl FormatDetector for WindowsEventParser {
    fn detect(&self, sample: &str) -> DetectionResult {
        match sniff(sample) {
            Some(WindowsEncoding::Binary) | None => DetectionResult::new(LogFormat::WindowsEvent, 0, 1),
            Some(_) => DetectionResult::new(LogFormat::WindowsEvent, 1, 1),
        }
    }

    fn format(&self) -> LogFormat {
        LogFormat::WindowsEvent
    }
}

impl LogParser for WindowsEventParser {
    fn info(&self) -> ParserInfo {
        ParserInfo {
            name: "windows_event".into(),
            version: "1.0.0".into(),
            format: LogFormat::WindowsEvent,
            extensions: self.extensions.clone(),
            capabilities: vec!["xml".into(), "text-export".into(), "csv-export".into()],
            description: "Windows Event Log exports (XML, text, CSV)".into(),
        }
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn threshold_percent(&self) -> u32 {
        WINDOWS_THRESHOLD_PERCENT
    }

    fn parse(&self, path: &str, content: &str, cancel: &CancellationToken) -> ParseResult {
        let mut run = ParseRun::new("windows_event", path, &self.ctx, cancel);
        let encoding = sniff(content);
        if let Some(encoding) = encoding {
            run.meta("encoding", encoding.as_str());
        }

        match encoding {
            Some(WindowsEncoding::Xml) => self.parse_xml(run, content),
            Some(WindowsEncoding::Text) => self.parse_text(run, content),
            Some(WindowsEncoding::Csv) => self.parse_csv_export(run, strip_bom(content)),
            Some(WindowsEncoding::Binary) => run.fail(ParseError::UnsupportedEncoding(
                "binary .evtx is not decoded; export with `wevtutil qe <log> /f:xml`".into(),
            )),
            None => run.fail(ParseError::InvalidFormat("Not a Windows Event Log export".into())),
        }
    }

    fn validate(&self, content: &str) -> ValidationResult {
        let Some(encoding) = sniff(content) else {
            return ValidationResult::invalid("Content is not a recognised Windows Event Log export");
        };
        if encoding == WindowsEncoding::Binary {
            let mut result = ValidationResult::invalid(
                "Binary .evtx files are not decoded; export to XML, text or CSV first",
            );
            result.suggest("encoding", encoding.as_str());
            return result;
        }

        let mut result = ValidationResult::valid();
        result.suggest("encoding", encoding.as_str());
        match encoding {
            WindowsEncoding::Xml => {
                let wrapped = format!("{}{}{}", WRAPPER_OPEN, blank_declaration(content), WRAPPER_CLOSE);
                match roxmltree::Document::parse(&wrapped) {
                    Ok(doc) => {
                        let count = doc
                            .descendants()
                            .filter(|n| n.is_element() && n.tag_name().name() == "Event")
                            .count();
                        result.suggest("event_count", count);
                    }
                    Err(e) => result.error(format!("Malformed XML: {}", e)),
                }
            }
            WindowsEncoding::Text => result.suggest("event_count", text_records(content).len()),
            WindowsEncoding::Csv => {
                result.suggest("event_count", read_raw_records(content, b',').len().saturating_sub(1))
            }
            WindowsEncoding::Binary => {}
        }
        result
    }
}
