//! Boot: logging init and pipeline construction from configuration.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use engine::parser::ParserContext;
use engine::registry::Registry;

use crate::collab::ChannelNotifier;
use crate::config::{IntakeConfig, LogFormat, LoggingConfig};
use crate::pipeline::{Collaborators, IntakePipeline};
use crate::quarantine::FsQuarantine;

/// Initialise the tracing subsystem. `RUST_LOG` wins over the configured level.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    }
    .context("Failed to install tracing subscriber")
}

/// Everything a running intake needs, wired from one configuration.
pub struct Runtime {
    pub pipeline: IntakePipeline,
    pub notifier: Arc<ChannelNotifier>,
}

pub fn build(config: IntakeConfig) -> Result<Runtime> {
    config.validate().context("Configuration validation failed")?;

    let ctx = ParserContext::default().with_max_events(config.limits.max_events);
    let registry = Arc::new(Registry::new(ctx));
    info!(parsers = registry.list().len(), "Parser registry ready");

    let quarantine = Arc::new(FsQuarantine::new(config.quarantine.dir.clone()));
    info!(dir = %config.quarantine.dir.display(), "Quarantine directory configured");

    let notifier = Arc::new(ChannelNotifier::default());
    let collab = Collaborators::builtin(notifier.clone());

    let pipeline = IntakePipeline::new(config, registry, quarantine, collab)
        .context("Failed to build intake pipeline")?;

    Ok(Runtime { pipeline, notifier })
}
