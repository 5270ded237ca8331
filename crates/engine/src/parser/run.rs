use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::ParserContext;
use super::model::{LogEvent, ParseError, ParseResult};
use super::sample::file_name;

/// Bookkeeping shared by every parse loop: cancellation, event cap,
/// defaulted-timestamp counting and timing.
pub(crate) struct ParseRun<'a> {
    parser: &'a str,
    cancel: &'a CancellationToken,
    ctx: &'a ParserContext,
    started: Instant,
    events: Vec<LogEvent>,
    metadata: BTreeMap<String, String>,
    default_source: String,
    skipped: usize,
    truncated: bool,
}

impl<'a> ParseRun<'a> {
    pub(crate) fn new(
        parser: &'a str,
        path: &str,
        ctx: &'a ParserContext,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            parser,
            cancel,
            ctx,
            started: Instant::now(),
            events: Vec::new(),
            metadata: BTreeMap::new(),
            default_source: file_name(path).to_string(),
            skipped: 0,
            truncated: false,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fresh event stamped with ingestion time and the file name as source.
    pub(crate) fn event(&self, line_number: usize, raw: &str) -> LogEvent {
        let mut event = LogEvent::new(line_number, raw, self.ctx.now());
        event.source = self.default_source.clone();
        if raw.len() > self.ctx.max_line_size {
            event.insert_field("truncated", true);
        }
        event
    }

    /// Text that parsers may inspect for a raw record (bounded by line size).
    pub(crate) fn bounded<'t>(&self, raw: &'t str) -> &'t str {
        if raw.len() <= self.ctx.max_line_size {
            return raw;
        }
        let mut end = self.ctx.max_line_size;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        &raw[..end]
    }

    /// Returns false once the event cap is reached; callers stop reading.
    pub(crate) fn push(&mut self, event: LogEvent) -> bool {
        if self.events.len() >= self.ctx.max_events {
            self.truncated = true;
            return false;
        }
        self.events.push(event);
        if self.events.len() >= self.ctx.max_events {
            self.truncated = true;
            return false;
        }
        true
    }

    pub(crate) fn skip(&mut self) {
        self.skipped += 1;
    }

    pub(crate) fn meta(&mut self, key: &str, value: impl ToString) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    pub(crate) fn cancelled(self) -> ParseResult {
        tracing::debug!(parser = self.parser, events = self.events.len(), "Parse cancelled");
        ParseResult::cancelled(self.parser, self.started.elapsed())
    }

    pub(crate) fn fail(self, error: ParseError) -> ParseResult {
        tracing::debug!(parser = self.parser, error = %error, "Parse failed");
        ParseResult::failed(self.parser, error, self.started.elapsed())
    }

    pub(crate) fn finish(mut self) -> ParseResult {
        let defaulted = self.events.iter().filter(|e| !e.has_parsed_timestamp()).count();
        self.metadata.insert("defaulted_timestamps".into(), defaulted.to_string());
        self.metadata.insert("skipped".into(), self.skipped.to_string());
        if self.truncated {
            self.metadata.insert("truncated".into(), "true".into());
            tracing::warn!(parser = self.parser, max_events = self.ctx.max_events, "Event cap reached, parse truncated");
        }
        ParseResult::completed(self.parser, self.events, self.started.elapsed(), self.metadata)
    }
}

/// Iterate non-blank lines with their 1-based line numbers.
pub(crate) fn numbered_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty())
}

/// 1-based line number of a byte offset.
pub(crate) fn line_of_offset(content: &str, offset: usize) -> usize {
    content.as_bytes()[..offset.min(content.len())]
        .iter()
        .filter(|b| **b == b'\n')
        .count()
        + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_lines_skip_blank_keep_numbers() {
        let lines: Vec<_> = numbered_lines("a\r\n\nb\n").collect();
        assert_eq!(lines, vec![(1, "a"), (3, "b")]);
    }

    #[test]
    fn test_line_of_offset() {
        let content = "one\ntwo\nthree";
        assert_eq!(line_of_offset(content, 0), 1);
        assert_eq!(line_of_offset(content, 4), 2);
        assert_eq!(line_of_offset(content, 1_000), 3);
    }
}
