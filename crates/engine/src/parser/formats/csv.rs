use crate::parser::fields::{assign_roles, parse_timestamp, FieldRole};
use crate::parser::run::ParseRun;
use crate::parser::sample::sample_lines;
use crate::parser::traits::*;
use crate::parser::{ParseError, ParserContext, Severity};
use tokio_util::sync::CancellationToken;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b'\t', b';', b'|'];
const CSV_SAMPLE_LINES: usize = 5;
const CSV_THRESHOLD_PERCENT: u32 = 60;

/// Pick the delimiter that occurs most often in the header line.
///
/// Comma wins ties and the no-delimiter case.
pub fn detect_delimiter(first_line: &str) -> u8 {
    let mut best = b',';
    let mut best_count = 0usize;
    for candidate in CANDIDATE_DELIMITERS {
        let count = first_line.bytes().filter(|b| *b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

pub fn delimiter_name(delimiter: u8) -> &'static str {
    match delimiter {
        b'\t' => "tab",
        b';' => "semicolon",
        b'|' => "pipe",
        _ => "comma",
    }
}

/// A delimited record together with its verbatim source text.
pub(crate) struct RawRecord<'a> {
    pub line: usize,
    pub raw: &'a str,
    pub record: Result<csv::StringRecord, csv::Error>,
}

/// Read all records (header included) keeping the exact source slice of each.
pub(crate) fn read_raw_records(content: &str, delimiter: u8) -> Vec<RawRecord<'_>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut starts: Vec<(usize, usize, Result<csv::StringRecord, csv::Error>)> = Vec::new();
    let mut record = csv::StringRecord::new();
    loop {
        let position = reader.position().clone();
        match reader.read_record(&mut record) {
            Ok(true) => {
                let start = record.position().map(|p| p.byte() as usize).unwrap_or(position.byte() as usize);
                let line = record.position().map(|p| p.line() as usize).unwrap_or(position.line() as usize);
                starts.push((start, line, Ok(record.clone())));
            }
            Ok(false) => break,
            Err(e) => {
                let failed_at = position.byte() as usize;
                starts.push((failed_at, position.line() as usize, Err(e)));
                // csv errors on malformed UTF-8 leave the reader positioned past the record
                if reader.position().byte() as usize <= failed_at {
                    break;
                }
            }
        }
    }

    let ends: Vec<usize> = starts
        .iter()
        .skip(1)
        .map(|(start, _, _)| *start)
        .chain(std::iter::once(content.len()))
        .collect();

    starts
        .into_iter()
        .zip(ends)
        .filter_map(|((start, line, record), end)| {
            let slice = content.get(start.min(end)..end)?;
            let raw = slice.trim_end_matches(['\r', '\n']);
            if raw.trim().is_empty() {
                return None;
            }
            Some(RawRecord { line, raw, record })
        })
        .collect()
}

/// Delimited-text detector and parser (CSV, TSV, semicolon, pipe)
pub struct CsvParser {
    ctx: ParserContext,
    extensions: Vec<String>,
}

impl CsvParser {
    pub fn new(ctx: ParserContext) -> Self {
        Self {
            ctx,
            extensions: vec![".csv".into(), ".tsv".into()],
        }
    }
}

impl Default for CsvParser {
    fn default() -> Self {
        Self::new(ParserContext::default())
    }
}

impl FormatDetector for CsvParser {
    fn detect(&self, sample: &str) -> DetectionResult {
        let lines = sample_lines(sample, CSV_SAMPLE_LINES);
        if lines.len() < 2 {
            return DetectionResult::new(LogFormat::Csv, 0, lines.len());
        }

        let delimiter = detect_delimiter(lines[0]);
        let joined = lines.join("\n");
        let records = read_raw_records(&joined, delimiter);

        let header_width = match records.first().map(|r| &r.record) {
            Some(Ok(header)) if header.iter().filter(|f| !f.trim().is_empty()).count() >= 2 => header.len(),
            _ => return DetectionResult::new(LogFormat::Csv, 0, lines.len()),
        };

        let rows = &records[1..];
        let matched = rows
            .iter()
            .filter(|r| matches!(&r.record, Ok(rec) if rec.len() == header_width))
            .count();

        DetectionResult::new(LogFormat::Csv, matched, rows.len())
    }

    fn format(&self) -> LogFormat {
        LogFormat::Csv
    }
}

impl LogParser for CsvParser {
    fn info(&self) -> ParserInfo {
        ParserInfo {
            name: "csv".into(),
            version: "1.0.0".into(),
            format: LogFormat::Csv,
            extensions: self.extensions.clone(),
            capabilities: vec!["delimiter-inference".into(), "header-mapping".into()],
            description: "Delimited exports with a header row (comma, tab, semicolon, pipe)".into(),
        }
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn threshold_percent(&self) -> u32 {
        CSV_THRESHOLD_PERCENT
    }

    fn parse(&self, path: &str, content: &str, cancel: &CancellationToken) -> ParseResult {
        let mut run = ParseRun::new("csv", path, &self.ctx, cancel);

        let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let delimiter = detect_delimiter(first_line);
        run.meta("delimiter", delimiter_name(delimiter));

        let records = read_raw_records(content, delimiter);
        let mut iter = records.into_iter();

        let header = match iter.next() {
            Some(RawRecord { record: Ok(header), .. }) => header,
            Some(RawRecord { record: Err(e), .. }) => {
                return run.fail(ParseError::InvalidFormat(format!("Unreadable header: {}", e)))
            }
            None => return run.fail(ParseError::InvalidFormat("Empty CSV content".into())),
        };
        let columns: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
        let roles = assign_roles(&columns);
        run.meta("columns", columns.len());

        for raw_record in iter {
            if run.is_cancelled() {
                return run.cancelled();
            }
            let record = match raw_record.record {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(line = raw_record.line, error = %e, "Skipping malformed CSV record");
                    run.skip();
                    continue;
                }
            };

            let mut event = run.event(raw_record.line, raw_record.raw);
            for (idx, value) in record.iter().enumerate() {
                let key = columns
                    .get(idx)
                    .filter(|c| !c.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("column_{}", idx + 1));
                let role = roles.iter().find(|(_, col)| **col == idx).map(|(role, _)| *role);

                match role {
                    Some(FieldRole::Timestamp) => match parse_timestamp(value) {
                        Some(ts) => event.set_timestamp(ts),
                        None => event.insert_field(key, value),
                    },
                    Some(FieldRole::Level) => match Severity::from_text(value) {
                        Some(sev) => {
                            event.severity = sev;
                            event.insert_field(key, value);
                        }
                        None => event.insert_field(key, value),
                    },
                    Some(FieldRole::Message) => event.message = value.to_string(),
                    Some(FieldRole::Source) if !value.trim().is_empty() => event.source = value.trim().to_string(),
                    _ => event.insert_field(key, value),
                }
            }
            if event.message.is_empty() {
                event.message = record.iter().collect::<Vec<_>>().join(" ");
            }
            if !run.push(event) {
                break;
            }
        }

        run.finish()
    }

    fn validate(&self, content: &str) -> ValidationResult {
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return ValidationResult::invalid("Content is empty");
        }

        let mut result = ValidationResult::valid();
        let delimiter = detect_delimiter(lines[0]);
        result.suggest("delimiter", delimiter_name(delimiter));

        if lines.len() < 2 {
            result.error("CSV content needs a header and at least one data row");
        }

        let records = read_raw_records(content, delimiter);
        match records.first().map(|r| &r.record) {
            Some(Ok(header)) => {
                let width = header.len();
                result.suggest("column_count", width);
                result.suggest("header", header.iter().collect::<Vec<_>>().join(","));
                if header.iter().filter(|f| !f.trim().is_empty()).count() < 2 {
                    result.error("Header must contain at least two named columns");
                }
                let mismatched = records[1..]
                    .iter()
                    .filter(|r| !matches!(&r.record, Ok(rec) if rec.len() == width))
                    .count();
                if mismatched > 0 {
                    result.warn(format!("{} row(s) do not match the header width of {}", mismatched, width));
                }
                result.suggest("rows", records.len().saturating_sub(1));
            }
            Some(Err(e)) => result.error(format!("Header is not readable: {}", e)),
            None => result.error("No records found"),
        }

        result
    }
}
