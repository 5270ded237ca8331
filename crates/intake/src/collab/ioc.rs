use regex::Regex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use super::{BoxFuture, CollabError, ExtractOptions, Indicator, IndicatorKind, IocExtractor};

const CONTEXT_CHARS: usize = 120;

static SHA256: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Fa-f0-9]{64}\b").expect("static sha256 pattern"));
static SHA1: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Fa-f0-9]{40}\b").expect("static sha1 pattern"));
static MD5: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Fa-f0-9]{32}\b").expect("static md5 pattern"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\b(?:https?|ftp)://[^\s"'<>()\[\]]+"#).expect("static url pattern"));
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,24}\b").expect("static email pattern")
});
static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b")
        .expect("static ipv4 pattern")
});
static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+(?:com|net|org|info|biz|io|ru|cn|su|top|xyz|onion|online|site|club|tk|pw|cc|de|uk|co)\b",
    )
    .expect("static domain pattern")
});

/// Pattern-based extraction of network and file indicators.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexIocExtractor;

impl RegexIocExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core, also used directly by tests.
    pub fn extract_sync(&self, content: &str, options: &ExtractOptions) -> Vec<Indicator> {
        let mut found: HashMap<(IndicatorKind, String), Indicator> = HashMap::new();
        let mut order: Vec<(IndicatorKind, String)> = Vec::new();

        let mut add = |kind: IndicatorKind, value: &str, confidence: f32, start: usize| {
            if confidence < options.min_confidence {
                return;
            }
            let mut indicator = Indicator::new(kind, value, confidence);
            if options.include_context {
                indicator.context = Some(line_context(content, start));
            }
            let key = indicator.key();
            match found.get_mut(&key) {
                Some(existing) if existing.confidence >= confidence => {}
                Some(existing) => *existing = indicator,
                None => {
                    order.push(key.clone());
                    found.insert(key, indicator);
                }
            }
        };

        for (regex, kind, confidence) in [
            (&*SHA256, IndicatorKind::Sha256, 0.95),
            (&*SHA1, IndicatorKind::Sha1, 0.9),
            (&*MD5, IndicatorKind::Md5, 0.85),
            (&*URL, IndicatorKind::Url, 0.9),
            (&*EMAIL, IndicatorKind::Email, 0.75),
        ] {
            for m in regex.find_iter(content) {
                let value = m.as_str().trim_end_matches(['.', ',', ';']);
                add(kind, value, confidence, m.start());
            }
        }

        for m in IPV4.find_iter(content) {
            if let Ok(ip) = m.as_str().parse::<Ipv4Addr>() {
                add(IndicatorKind::Ipv4, m.as_str(), ipv4_confidence(ip), m.start());
            }
        }

        for m in DOMAIN.find_iter(content) {
            // skip the host part of an email address
            if content[..m.start()].ends_with('@') {
                continue;
            }
            add(IndicatorKind::Domain, &m.as_str().to_ascii_lowercase(), 0.6, m.start());
        }

        order
            .into_iter()
            .filter_map(|key| found.remove(&key))
            .take(options.max_indicators)
            .collect()
    }
}

fn ipv4_confidence(ip: Ipv4Addr) -> f32 {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_broadcast() || ip.is_link_local() {
        0.2
    } else if ip.is_private() {
        0.5
    } else {
        0.8
    }
}

/// The line containing byte `start`, trimmed to a bounded preview.
fn line_context(content: &str, start: usize) -> String {
    let line_start = content[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = content[start..].find('\n').map(|i| start + i).unwrap_or(content.len());
    content[line_start..line_end].trim().chars().take(CONTEXT_CHARS).collect()
}

impl IocExtractor for RegexIocExtractor {
    fn extract<'a>(
        &'a self,
        content: &'a str,
        options: &'a ExtractOptions,
    ) -> BoxFuture<'a, Result<Vec<Indicator>, CollabError>> {
        Box::pin(async move { Ok(self.extract_sync(content, options)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(min_confidence: f32) -> ExtractOptions {
        ExtractOptions { min_confidence, ..ExtractOptions::default() }
    }

    fn kinds(found: &[Indicator], kind: IndicatorKind) -> Vec<&str> {
        found.iter().filter(|i| i.kind == kind).map(|i| i.value.as_str()).collect()
    }

    #[test]
    fn test_extracts_each_kind() {
        let content = "beacon to http://evil.example.com/a.php from 203.0.113.7\n\
                       mail from attacker@phish.net\n\
                       dropped 44d88612fea8a8f36de82e1278abb02f\n\
                       sha1 3395856ce81f2b7382dee72602f798b642f14140\n\
                       sha256 275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f\n\
                       resolved badsite.ru\n";
        let found = RegexIocExtractor::new().extract_sync(content, &opts(0.0));

        assert_eq!(kinds(&found, IndicatorKind::Url), vec!["http://evil.example.com/a.php"]);
        assert_eq!(kinds(&found, IndicatorKind::Ipv4), vec!["203.0.113.7"]);
        assert_eq!(kinds(&found, IndicatorKind::Email), vec!["attacker@phish.net"]);
        assert_eq!(kinds(&found, IndicatorKind::Md5).len(), 1);
        assert_eq!(kinds(&found, IndicatorKind::Sha1).len(), 1);
        assert_eq!(kinds(&found, IndicatorKind::Sha256).len(), 1);
        assert!(kinds(&found, IndicatorKind::Domain).contains(&"badsite.ru"));
        assert!(!kinds(&found, IndicatorKind::Domain).contains(&"phish.net"));
    }

    #[test]
    fn test_duplicates_collapse() {
        let content = "8.8.8.8 then 8.8.8.8 again\n";
        let found = RegexIocExtractor::new().extract_sync(content, &opts(0.0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].context.as_deref(), Some("8.8.8.8 then 8.8.8.8 again"));
    }

    #[test]
    fn test_min_confidence_filters_private_addresses() {
        let content = "from 10.0.0.5 and 127.0.0.1 to 198.51.100.20\n";
        let found = RegexIocExtractor::new().extract_sync(content, &opts(0.6));
        assert_eq!(kinds(&found, IndicatorKind::Ipv4), vec!["198.51.100.20"]);
    }

    #[test]
    fn test_max_indicators() {
        let content = "1.1.1.1 2.2.2.2 3.3.3.3 4.4.4.4";
        let options = ExtractOptions { max_indicators: 2, ..opts(0.0) };
        assert_eq!(RegexIocExtractor::new().extract_sync(content, &options).len(), 2);
    }

    #[test]
    fn test_invalid_octets_ignored() {
        let found = RegexIocExtractor::new().extract_sync("version 999.1.2.3", &opts(0.0));
        assert!(kinds(&found, IndicatorKind::Ipv4).is_empty());
    }
}
