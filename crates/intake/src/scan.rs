use std::sync::atomic::{AtomicU64, Ordering};
use grep_matcher::Matcher;
use grep_regex::{RegexMatcher, RegexMatcherBuilder};

use crate::config::SignatureConfig;
use crate::error::IntakeError;

/// Standard anti-malware test string, always scanned for.
pub const EICAR: &str = r"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

#[derive(Debug, Default)]
pub struct ScanStats {
    pub files_scanned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub hits: AtomicU64,
}

struct Signature {
    name: String,
    matcher: RegexMatcher,
}

/// Byte-signature scanner over raw submissions.
pub struct SignatureScanner {
    signatures: Vec<Signature>,
    stats: ScanStats,
}

fn build_matcher(name: &str, pattern: &str) -> Result<RegexMatcher, IntakeError> {
    RegexMatcherBuilder::new()
        .multi_line(false)
        .build(pattern)
        .map_err(|e| IntakeError::InvalidSignature {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

impl SignatureScanner {
    pub fn new(configured: &[SignatureConfig]) -> Result<Self, IntakeError> {
        let mut signatures = vec![Signature {
            name: "EICAR-Test-File".to_string(),
            matcher: build_matcher("EICAR-Test-File", &regex::escape(EICAR))?,
        }];
        for sig in configured {
            signatures.push(Signature {
                name: sig.name.clone(),
                matcher: build_matcher(&sig.name, &sig.pattern)?,
            });
        }
        Ok(Self { signatures, stats: ScanStats::default() })
    }

    /// Name of the first signature found in `content`.
    pub fn scan(&self, content: &[u8]) -> Option<&str> {
        self.stats.files_scanned.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_scanned.fetch_add(content.len() as u64, Ordering::Relaxed);

        let hit = self
            .signatures
            .iter()
            .find(|sig| sig.matcher.is_match(content).unwrap_or(false))
            .map(|sig| sig.name.as_str());

        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.files_scanned.load(Ordering::Relaxed),
            self.stats.bytes_scanned.load(Ordering::Relaxed),
            self.stats.hits.load(Ordering::Relaxed),
        )
    }
}
