use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::scan::SignatureScanner;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntakeConfig {
    pub limits: LimitsConfig,
    pub validation: ValidationConfig,
    pub quarantine: QuarantineConfig,
    pub stages: StagesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Largest accepted submission in bytes
    pub max_file_size: u64,
    /// Above this size the file is processed in chunks
    pub chunk_threshold: u64,
    /// Characters per chunk in chunked mode
    pub chunk_chars: usize,
    /// Yield to the scheduler every N chunks
    pub yield_every: usize,
    /// Bytes handed to the parser in chunked mode
    pub chunk_parse_limit: u64,
    pub max_events: usize,
    pub analysis_timeout_secs: u64,
    pub parse_timeout_secs: u64,
    /// Finished analyses kept in the live table before the oldest are evicted
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

fn default_retain_finished() -> usize {
    1024
}

impl LimitsConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_secs(self.parse_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationConfig {
    /// Empty means every extension not blocked is accepted
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    pub blocked_extensions: Vec<String>,
    #[serde(default)]
    pub malware_signatures: Vec<SignatureConfig>,
    /// Check leading bytes against the extension
    pub verify_signatures: bool,
}

/// A byte pattern (regular expression) that marks a file as malicious.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignatureConfig {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuarantineConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StagesConfig {
    pub summarize: bool,
    pub ioc_min_confidence: f32,
    pub max_indicators: usize,
    pub summary_max_words: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl IntakeConfig {
    /// Load configuration from intake.toml and environment variables
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Same as [`load`](Self::load), with an extra file layered above the defaults.
    pub fn load_with(extra_file: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&IntakeConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        // 1. /etc/evidence-intake/intake.toml (production)
        // 2. config/intake.toml (local development)
        for path in ["/etc/evidence-intake/intake", "config/intake"] {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        if let Some(path) = extra_file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        // INTAKE_LIMITS__MAX_FILE_SIZE=...
        builder = builder.add_source(
            config::Environment::with_prefix("INTAKE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("validation.allowed_extensions")
                .with_list_parse_key("validation.blocked_extensions")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_file_size == 0 {
            anyhow::bail!("limits.max_file_size must be greater than zero");
        }
        if limits.chunk_threshold == 0 || limits.chunk_threshold > limits.max_file_size {
            anyhow::bail!(
                "limits.chunk_threshold must be in 1..={} (got {})",
                limits.max_file_size,
                limits.chunk_threshold
            );
        }
        for (name, value) in [
            ("chunk_chars", limits.chunk_chars as u64),
            ("yield_every", limits.yield_every as u64),
            ("chunk_parse_limit", limits.chunk_parse_limit),
            ("max_events", limits.max_events as u64),
            ("analysis_timeout_secs", limits.analysis_timeout_secs),
            ("parse_timeout_secs", limits.parse_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("limits.{} must be greater than zero", name);
            }
        }
        if limits.parse_timeout_secs > limits.analysis_timeout_secs {
            anyhow::bail!("limits.parse_timeout_secs must not exceed limits.analysis_timeout_secs");
        }

        if !(0.0..=1.0).contains(&self.stages.ioc_min_confidence) {
            anyhow::bail!("stages.ioc_min_confidence must be within 0.0..=1.0");
        }

        for ext in self.validation.allowed_extensions.iter() {
            if self.validation.blocked_extensions.iter().any(|b| b.eq_ignore_ascii_case(ext)) {
                anyhow::bail!("extension {} is both allowed and blocked", ext);
            }
        }

        SignatureScanner::new(&self.validation.malware_signatures)
            .context("Invalid validation.malware_signatures")?;

        Ok(())
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig {
                max_file_size: 512 * 1024 * 1024,
                chunk_threshold: 16 * 1024 * 1024,
                chunk_chars: 1_000_000,
                yield_every: 10,
                chunk_parse_limit: 8 * 1024 * 1024,
                max_events: engine::parser::DEFAULT_MAX_EVENTS,
                analysis_timeout_secs: 900,
                parse_timeout_secs: 300,
                retain_finished: default_retain_finished(),
            },
            validation: ValidationConfig {
                allowed_extensions: vec![],
                blocked_extensions: [
                    ".exe", ".dll", ".bat", ".cmd", ".com", ".ps1", ".vbs", ".scr", ".msi", ".jar",
                    ".sh",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                malware_signatures: vec![],
                verify_signatures: true,
            },
            quarantine: QuarantineConfig {
                dir: PathBuf::from("quarantine"),
            },
            stages: StagesConfig {
                summarize: false,
                ioc_min_confidence: 0.5,
                max_indicators: 10_000,
                summary_max_words: 250,
            },
            logging: LoggingConfig {
                level: "intake=info,engine=info".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        IntakeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_chunk_threshold_above_max_size_rejected() {
        let mut config = IntakeConfig::default();
        config.limits.chunk_threshold = config.limits.max_file_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = IntakeConfig::default();
        config.limits.yield_every = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("yield_every"));
    }

    #[test]
    fn test_bad_signature_pattern_rejected() {
        let mut config = IntakeConfig::default();
        config.validation.malware_signatures.push(SignatureConfig {
            name: "broken".into(),
            pattern: "(unclosed".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowed_and_blocked_overlap_rejected() {
        let mut config = IntakeConfig::default();
        config.validation.allowed_extensions = vec![".EXE".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_round_trip_through_config_crate() {
        let built = config::Config::builder()
            .add_source(config::Config::try_from(&IntakeConfig::default()).unwrap())
            .build()
            .unwrap();
        let config: IntakeConfig = built.try_deserialize().unwrap();
        assert_eq!(config.limits.yield_every, 10);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }
}
