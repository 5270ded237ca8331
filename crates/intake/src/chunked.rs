//! Chunked: bounded-memory processing of large submissions.
//!
//! Content is cut into character-counted chunks without ever splitting a
//! UTF-8 sequence; invalid bytes become U+FFFD. Indicators found across
//! chunks are merged by `(kind, value)`, keeping the most confident one.

use std::borrow::Cow;
use std::collections::HashMap;

use engine::parser::LogFormat;

use crate::collab::{Indicator, IndicatorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    /// Byte offset in the source just past this chunk
    pub bytes_end: usize,
}

/// Iterator of lossy UTF-8 chunks of at most `chunk_chars` characters.
pub struct TextChunks<'a> {
    content: &'a [u8],
    pos: usize,
    chunk_chars: usize,
    index: usize,
}

pub fn text_chunks(content: &[u8], chunk_chars: usize) -> TextChunks<'_> {
    TextChunks { content, pos: 0, chunk_chars: chunk_chars.max(1), index: 0 }
}

impl Iterator for TextChunks<'_> {
    type Item = TextChunk;

    fn next(&mut self) -> Option<TextChunk> {
        if self.pos >= self.content.len() {
            return None;
        }

        let mut text = String::new();
        let mut chars = 0usize;
        while chars < self.chunk_chars && self.pos < self.content.len() {
            let want = self.chunk_chars - chars;
            // a char is at most 4 bytes; the slack keeps a cut sequence out of `valid()`
            let window_end = self
                .content
                .len()
                .min(self.pos.saturating_add(want.saturating_mul(4).saturating_add(3)));
            let Some(piece) = self.content[self.pos..window_end].utf8_chunks().next() else { break };

            let valid = piece.valid();
            let (take, taken) = match valid.char_indices().nth(want) {
                Some((byte, _)) => (byte, want),
                None => (valid.len(), valid.chars().count()),
            };
            text.push_str(&valid[..take]);
            chars += taken;
            self.pos += take;

            if take < valid.len() || chars >= self.chunk_chars {
                break;
            }
            let invalid = piece.invalid();
            if !invalid.is_empty() {
                text.push(char::REPLACEMENT_CHARACTER);
                chars += 1;
                self.pos += invalid.len();
            }
        }

        let chunk = TextChunk { index: self.index, text, bytes_end: self.pos };
        self.index += 1;
        Some(chunk)
    }
}

/// Accumulates indicators across chunks.
#[derive(Debug, Default)]
pub struct IndicatorMerger {
    by_key: HashMap<(IndicatorKind, String), usize>,
    merged: Vec<Indicator>,
    seen: usize,
}

impl IndicatorMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, batch: Vec<Indicator>) {
        for indicator in batch {
            self.seen += 1;
            match self.by_key.get(&indicator.key()) {
                Some(&i) => {
                    if indicator.confidence > self.merged[i].confidence {
                        self.merged[i] = indicator;
                    }
                }
                None => {
                    self.by_key.insert(indicator.key(), self.merged.len());
                    self.merged.push(indicator);
                }
            }
        }
    }

    /// Indicators received before deduplication
    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn finish(self) -> Vec<Indicator> {
        self.merged
    }
}

/// One-shot deduplication, first-seen order
pub fn dedup_indicators(indicators: Vec<Indicator>) -> Vec<Indicator> {
    let mut merger = IndicatorMerger::new();
    merger.add(indicators);
    merger.finish()
}

/// Prefix of `content` at most `limit` bytes long that still parses.
///
/// JSON arrays are cut after the last complete element and re-closed.
/// Windows XML exports are cut after the last `</Event>` and every element
/// still open before the first event is closed again. Anything else is cut
/// after the last complete line.
pub fn parse_window(content: &[u8], limit: usize, format: Option<LogFormat>) -> Cow<'_, [u8]> {
    if content.len() <= limit {
        return Cow::Borrowed(content);
    }
    let head = &content[..limit];
    let record_aware = match format {
        Some(LogFormat::Json) if starts_with_array(head) => json_array_window(head),
        Some(LogFormat::WindowsEvent) => xml_event_window(head),
        _ => None,
    };
    record_aware.unwrap_or_else(|| Cow::Borrowed(line_window(head)))
}

fn line_window(head: &[u8]) -> &[u8] {
    match head.iter().rposition(|b| *b == b'\n') {
        Some(nl) => &head[..=nl],
        None => head,
    }
}

fn starts_with_array(head: &[u8]) -> bool {
    head.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'[')
}

/// Scalars directly inside the top-level array are not tracked as cut points.
fn json_array_window(head: &[u8]) -> Option<Cow<'_, [u8]>> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut last_end = None;

    for (i, &b) in head.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
                if depth == 1 {
                    last_end = Some(i + 1);
                }
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                match depth {
                    0 => return Some(Cow::Borrowed(&head[..=i])),
                    1 => last_end = Some(i + 1),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let mut window = head[..last_end?].to_vec();
    window.extend_from_slice(b"\n]");
    Some(Cow::Owned(window))
}

const EVENT_CLOSE: &[u8] = b"</Event>";

fn xml_event_window(head: &[u8]) -> Option<Cow<'_, [u8]>> {
    let cut = head.windows(EVENT_CLOSE.len()).rposition(|w| w == EVENT_CLOSE)? + EVENT_CLOSE.len();
    let first_event = (0..cut).find(|&i| {
        head[i..].starts_with(b"<Event")
            && head.get(i + 6).is_some_and(|b| *b == b'>' || b.is_ascii_whitespace())
    })?;

    let mut window = head[..cut].to_vec();
    for name in open_elements(&head[..first_event]).iter().rev() {
        window.extend_from_slice(b"\n</");
        window.extend_from_slice(name);
        window.push(b'>');
    }
    Some(Cow::Owned(window))
}

/// Names of elements opened and not yet closed in `prefix`.
fn open_elements(prefix: &[u8]) -> Vec<&[u8]> {
    let mut open = Vec::new();
    let mut pos = 0;
    while let Some(lt) = prefix[pos..].iter().position(|b| *b == b'<') {
        let tag_start = pos + lt + 1;
        let Some(gt) = prefix[tag_start..].iter().position(|b| *b == b'>') else { break };
        let tag = &prefix[tag_start..tag_start + gt];
        pos = tag_start + gt + 1;

        match tag.first() {
            Some(b'?') | Some(b'!') | None => {}
            Some(b'/') => {
                open.pop();
            }
            Some(_) if tag.ends_with(b"/") => {}
            Some(_) => {
                let end = tag
                    .iter()
                    .position(|b| b.is_ascii_whitespace() || *b == b'/')
                    .unwrap_or(tag.len());
                open.push(&tag[..end]);
            }
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(content: &[u8], n: usize) -> Vec<TextChunk> {
        text_chunks(content, n).collect()
    }

    #[test]
    fn test_chunks_cover_content() {
        let chunks = collect(b"abcdefghij", 4);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
        assert_eq!(chunks.last().unwrap().bytes_end, 10);
        assert_eq!(chunks[1].index, 1);
    }

    #[test]
    fn test_multibyte_never_split() {
        let content = "héllo wörld ✓✓".as_bytes();
        let chunks = collect(content, 3);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 3));
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, "héllo wörld ✓✓");
        assert_eq!(chunks.last().unwrap().bytes_end, content.len());
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let content = b"ab\xffcd\xfe";
        let joined: String = collect(content, 2).into_iter().map(|c| c.text).collect();
        assert_eq!(joined, "ab\u{FFFD}cd\u{FFFD}");
    }

    #[test]
    fn test_truncated_sequence_at_end() {
        // first two bytes of a three-byte sequence
        let content = b"ok\xe2\x9c";
        let joined: String = collect(content, 10).into_iter().map(|c| c.text).collect();
        assert_eq!(joined, "ok\u{FFFD}");
    }

    #[test]
    fn test_dedup_keeps_highest_confidence() {
        let batch = vec![
            Indicator::new(IndicatorKind::Ipv4, "1.2.3.4", 0.5),
            Indicator::new(IndicatorKind::Domain, "Evil.COM", 0.4),
            Indicator::new(IndicatorKind::Ipv4, "1.2.3.4", 0.9),
            Indicator::new(IndicatorKind::Domain, "evil.com", 0.3),
        ];
        let mut merger = IndicatorMerger::new();
        merger.add(batch);
        assert_eq!(merger.seen(), 4);
        let merged = merger.finish();
        assert!(merged.len() <= 4);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].confidence, 0.9);
        assert_eq!(merged[1].value, "Evil.COM");
    }

    #[test]
    fn test_same_value_different_kind_kept() {
        let merged = dedup_indicators(vec![
            Indicator::new(IndicatorKind::Md5, "abc", 0.5),
            Indicator::new(IndicatorKind::Sha1, "abc", 0.5),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_parse_window_cuts_at_line() {
        assert_eq!(&*parse_window(b"one\ntwo\nthree", 9, None), b"one\ntwo\n");
        assert_eq!(&*parse_window(b"short", 9, None), b"short");
        assert_eq!(&*parse_window(b"no-newline-here", 4, None), b"no-n");
    }

    #[test]
    fn test_json_array_window_closes_array() {
        let content = b"[\n  {\"message\": \"first\"},\n  {\"message\": \"second\"},\n  {\"message\": \"third\"}\n]";
        let window = parse_window(content, 50, Some(LogFormat::Json));
        let parsed: serde_json::Value = serde_json::from_slice(&window).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[1]["message"], "second");
    }

    #[test]
    fn test_json_window_ignores_brackets_in_strings() {
        let content = b"[{\"m\": \"a}]\\\"\"}, {\"m\": \"b\"}, {\"m\": \"cccccccc\"}]";
        let window = parse_window(content, 30, Some(LogFormat::Json));
        let parsed: serde_json::Value = serde_json::from_slice(&window).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["m"], "a}]\"");
    }

    #[test]
    fn test_json_lines_fall_back_to_line_cut() {
        let content = b"{\"m\": 1}\n{\"m\": 2}\n{\"m\": 3}\n";
        assert_eq!(&*parse_window(content, 20, Some(LogFormat::Json)), b"{\"m\": 1}\n{\"m\": 2}\n");
    }

    #[test]
    fn test_xml_window_closes_wrapper() {
        let content = concat!(
            "<?xml version=\"1.0\"?>\n<Events>\n",
            "<Event xmlns=\"x\"><System><EventID>4624</EventID></System><EventData/></Event>\n",
            "<Event xmlns=\"x\"><System><EventID>4625</EventID></System><EventData/></Event>\n",
            "</Events>\n"
        )
        .as_bytes();
        let limit = content.len() - 40;
        let window = parse_window(content, limit, Some(LogFormat::WindowsEvent));
        let text = std::str::from_utf8(&window).unwrap();
        assert!(text.ends_with("</Event>\n</Events>"));
        assert_eq!(text.matches("<EventID>").count(), 1);
    }

    #[test]
    fn test_xml_without_complete_event_falls_back() {
        let content = b"<Events>\n<Event><System>\n<EventID>1</EventID>\n</System>";
        let window = parse_window(content, 30, Some(LogFormat::WindowsEvent));
        assert_eq!(&*window, b"<Events>\n<Event><System>\n");
    }
}
