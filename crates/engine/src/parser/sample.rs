//! Detection sampling and extension allow-list matching.

/// Cut a detection sample from the head of `content`.
///
/// When the content is longer than `max_bytes` the sample ends at the last
/// complete line, so a record split by the cut never counts as a mismatch.
pub fn detection_sample(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut end = max_bytes;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    let head = &content[..end];
    match head.rfind('\n') {
        Some(idx) if idx > 0 => &head[..idx],
        _ => head,
    }
}

/// First `limit` non-blank lines of a sample.
pub fn sample_lines(sample: &str, limit: usize) -> Vec<&str> {
    sample
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .take(limit)
        .collect()
}

/// Lowercased file name component of a path (handles both separators).
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Check a path against a declared extension list.
///
/// Entries are matched as suffixes of the file name (".evtx.xml" works),
/// `""` matches files without any extension and `"*"` matches everything.
pub fn extension_matches(extensions: &[String], path: &str) -> bool {
    let name = file_name(path).to_ascii_lowercase();
    let has_extension = name.trim_start_matches('.').contains('.');

    extensions.iter().any(|ext| {
        let ext = ext.trim().to_ascii_lowercase();
        match ext.as_str() {
            "*" => true,
            "" => !has_extension,
            e if e.starts_with('.') => name.ends_with(e),
            e => name.ends_with(&format!(".{}", e)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extension_suffix_match() {
        let list = exts(&[".log", ".evtx.xml"]);
        assert!(extension_matches(&list, "/var/log/auth.LOG"));
        assert!(extension_matches(&list, "C:\\exports\\security.evtx.xml"));
        assert!(!extension_matches(&list, "report.csv"));
    }

    #[test]
    fn test_extension_without_dot_and_wildcard() {
        assert!(extension_matches(&exts(&["json"]), "a.json"));
        assert!(extension_matches(&exts(&["*"]), "anything.bin"));
    }

    #[test]
    fn test_empty_extension_matches_bare_names_only() {
        let list = exts(&[""]);
        assert!(extension_matches(&list, "/var/log/messages"));
        assert!(extension_matches(&list, ".bash_history"));
        assert!(!extension_matches(&list, "messages.1"));
    }

    #[test]
    fn test_detection_sample_stops_at_line_boundary() {
        let content = "first line\nsecond line\nthird";
        assert_eq!(detection_sample(content, 15), "first line");
        assert_eq!(detection_sample(content, 1_000), content);
    }

    #[test]
    fn test_detection_sample_respects_char_boundary() {
        let content = "ééééé\nabc";
        let sample = detection_sample(content, 3);
        assert_eq!(sample, "é");
    }

    #[test]
    fn test_sample_lines_skips_blank() {
        let lines = sample_lines("a\n\n  \nb\r\nc\n", 2);
        assert_eq!(lines, vec!["a", "b"]);
    }
}
