//! Validate: pre-parse gatekeeping of submitted files.
//!
//! Checks run cheapest first: size, extension policy, leading-byte
//! signature for the claimed extension, then the malware byte scan.
//! Policy violations reject; content that lies about its type or carries
//! a malware signature is quarantined and never reaches a parser.

use engine::parser::DETECTION_SAMPLE_BYTES;

use crate::config::ValidationConfig;
use crate::error::IntakeError;
use crate::scan::SignatureScanner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
    Quarantine(String),
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

const PCAP_MAGICS: [[u8; 4]; 4] = [
    [0xd4, 0xc3, 0xb2, 0xa1],
    [0xa1, 0xb2, 0xc3, 0xd4],
    [0x4d, 0x3c, 0xb2, 0xa1],
    [0xa1, 0xb2, 0x3c, 0x4d],
];

const TEXT_EXTENSIONS: &[&str] = &[
    ".log", ".txt", ".csv", ".tsv", ".syslog", ".jsonl", ".ndjson", ".out", ".err",
];

/// Lowercased extension with its dot, or empty for bare names.
pub fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn first_significant(content: &[u8]) -> Option<u8> {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    content.iter().copied().find(|b| !b.is_ascii_whitespace())
}

/// What the leading bytes of a file with `ext` must look like, if checked.
///
/// `Err` carries the mismatch description.
fn check_magic(ext: &str, content: &[u8]) -> Result<(), String> {
    let starts = |magic: &[u8], label: &str| {
        if content.starts_with(magic) {
            Ok(())
        } else {
            Err(format!("{} must start with {}", ext, label))
        }
    };

    match ext {
        ".evtx" => starts(&b"ElfFile\0"[..], "ElfFile\\0"),
        ".gz" => starts(&[0x1f, 0x8b][..], "1f 8b"),
        ".zip" => starts(&b"PK\x03\x04"[..], "PK\\x03\\x04"),
        ".pcapng" => starts(&[0x0a, 0x0d, 0x0d, 0x0a][..], "0a 0d 0d 0a"),
        ".pcap" => {
            if PCAP_MAGICS.iter().any(|m| content.starts_with(m)) {
                Ok(())
            } else {
                Err(".pcap must start with a pcap magic number".to_string())
            }
        }
        ".json" => match first_significant(content) {
            Some(b'{') | Some(b'[') => Ok(()),
            _ => Err(".json must start with { or [".to_string()),
        },
        ".xml" => match first_significant(content) {
            Some(b'<') => Ok(()),
            _ => Err(".xml must start with <".to_string()),
        },
        ext if TEXT_EXTENSIONS.contains(&ext) => {
            let head = &content[..content.len().min(DETECTION_SAMPLE_BYTES)];
            if head.contains(&0) {
                Err(format!("{} text file contains NUL bytes", ext))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

pub struct FileValidator {
    max_file_size: u64,
    allowed: Vec<String>,
    blocked: Vec<String>,
    verify_signatures: bool,
    scanner: SignatureScanner,
}

fn normalize(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| {
            let e = e.trim().to_ascii_lowercase();
            if e.is_empty() || e.starts_with('.') {
                e
            } else {
                format!(".{}", e)
            }
        })
        .collect()
}

impl FileValidator {
    pub fn new(config: &ValidationConfig, max_file_size: u64) -> Result<Self, IntakeError> {
        Ok(Self {
            max_file_size,
            allowed: normalize(&config.allowed_extensions),
            blocked: normalize(&config.blocked_extensions),
            verify_signatures: config.verify_signatures,
            scanner: SignatureScanner::new(&config.malware_signatures)?,
        })
    }

    pub fn check(&self, filename: &str, content: &[u8]) -> Verdict {
        if content.is_empty() {
            return Verdict::Reject("file is empty".to_string());
        }
        if content.len() as u64 > self.max_file_size {
            return Verdict::Reject(format!(
                "file size {} exceeds limit of {} bytes",
                content.len(),
                self.max_file_size
            ));
        }

        let ext = extension_of(filename);
        if self.blocked.contains(&ext) {
            return Verdict::Reject(format!("extension {} is blocked", ext));
        }
        if !self.allowed.is_empty() && !self.allowed.contains(&ext) {
            let shown = if ext.is_empty() { "(none)" } else { ext.as_str() };
            return Verdict::Reject(format!("extension {} is not on the allow-list", shown));
        }

        if self.verify_signatures {
            if let Err(mismatch) = check_magic(&ext, content) {
                return Verdict::Quarantine(format!("file format signature mismatch: {}", mismatch));
            }
        }

        if let Some(signature) = self.scanner.scan(content) {
            return Verdict::Quarantine(format!("malware signature matched: {}", signature));
        }

        Verdict::Accept
    }

    pub fn scanner(&self) -> &SignatureScanner {
        &self.scanner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;
    use crate::scan::EICAR;

    fn validator() -> FileValidator {
        let config = IntakeConfig::default();
        FileValidator::new(&config.validation, 1024).unwrap()
    }

    #[test]
    fn test_size_and_empty_rejected() {
        let v = validator();
        assert!(matches!(v.check("a.log", b""), Verdict::Reject(_)));
        assert!(matches!(v.check("a.log", &[b'a'; 2048]), Verdict::Reject(r) if r.contains("exceeds")));
    }

    #[test]
    fn test_blocked_extension_case_insensitive() {
        assert!(matches!(validator().check("payload.EXE", b"MZ"), Verdict::Reject(r) if r.contains(".exe")));
    }

    #[test]
    fn test_allow_list() {
        let mut config = IntakeConfig::default().validation;
        config.allowed_extensions = vec!["log".into(), ".json".into()];
        let v = FileValidator::new(&config, 1024).unwrap();
        assert_eq!(v.check("a.log", b"line\n"), Verdict::Accept);
        assert!(matches!(v.check("a.csv", b"a,b\n"), Verdict::Reject(_)));
        assert!(matches!(v.check("README", b"hi"), Verdict::Reject(r) if r.contains("(none)")));
    }

    #[test]
    fn test_magic_mismatch_quarantines_with_format_reason() {
        let v = validator();
        for (name, content) in [
            ("Security.evtx", &b"<Event>"[..]),
            ("archive.gz", &b"plain"[..]),
            ("archive.zip", &b"PK\x05\x06"[..]),
            ("dump.pcap", &b"\x00\x00\x00\x00"[..]),
            ("dump.pcapng", &b"\x0a\x0d\x0d\x0b"[..]),
            ("data.json", &b"  hello"[..]),
            ("events.xml", &b"{}"[..]),
            ("app.log", &b"line\0with nul"[..]),
        ] {
            match v.check(name, content) {
                Verdict::Quarantine(reason) => assert!(reason.contains("format"), "{}: {}", name, reason),
                other => panic!("{} should be quarantined, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_matching_magic_accepted() {
        let v = validator();
        assert_eq!(v.check("Security.evtx", b"ElfFile\0rest"), Verdict::Accept);
        assert_eq!(v.check("dump.pcap", &[0xd4, 0xc3, 0xb2, 0xa1, 2, 0]), Verdict::Accept);
        assert_eq!(v.check("data.json", b"\xEF\xBB\xBF\n [1]"), Verdict::Accept);
        assert_eq!(v.check("notes.md", b"\0binary is fine for unknown types"), Verdict::Accept);
    }

    #[test]
    fn test_signature_check_can_be_disabled() {
        let mut config = IntakeConfig::default().validation;
        config.verify_signatures = false;
        let v = FileValidator::new(&config, 1024).unwrap();
        assert_eq!(v.check("Security.evtx", b"<Event>"), Verdict::Accept);
    }

    #[test]
    fn test_eicar_quarantined() {
        match validator().check("readme.txt", EICAR.as_bytes()) {
            Verdict::Quarantine(reason) => assert!(reason.contains("EICAR")),
            other => panic!("expected quarantine, got {:?}", other),
        }
    }
}
