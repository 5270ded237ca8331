use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use engine::registry::NewParser;
use intake::boot;
use intake::config::IntakeConfig;
use intake::state::AnalysisRecord;

#[derive(Parser, Debug)]
#[command(name = "evidence-intake")]
#[command(about = "Validate, parse and analyse forensic evidence files")]
struct Args {
    #[arg(long, global = true, help = "Extra configuration file layered over the defaults")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Run files through the intake pipeline")]
    Analyze {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
        #[arg(long, help = "Preferred parser name")]
        parser: Option<String>,
        #[arg(long = "manifest", value_name = "TOML", help = "Register a custom parser manifest first")]
        manifests: Vec<PathBuf>,
        #[arg(long, help = "Print full records as JSON")]
        json: bool,
    },
    #[command(subcommand, about = "Inspect and exercise parsers")]
    Parsers(ParsersCommand),
}

#[derive(Subcommand, Debug)]
enum ParsersCommand {
    #[command(about = "List registered parsers by priority")]
    List {
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Check a custom parser manifest without registering it")]
    Validate {
        #[arg(value_name = "TOML")]
        manifest: PathBuf,
    },
    #[command(about = "Register a manifest and run it over a sample file")]
    Test {
        #[arg(value_name = "TOML")]
        manifest: PathBuf,
        #[arg(value_name = "SAMPLE")]
        sample: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = IntakeConfig::load_with(args.config.as_deref()).context("Failed to load configuration")?;
    boot::init_logging(&config.logging)?;
    info!("Starting evidence-intake v{}", env!("CARGO_PKG_VERSION"));

    let runtime = boot::build(config)?;
    let pipeline = runtime.pipeline;

    match args.command {
        Command::Analyze { files, parser, manifests, json } => {
            for manifest in &manifests {
                let source = read_text(manifest).await?;
                let descriptor = pipeline
                    .registry()
                    .register(NewParser::from_source(source))
                    .with_context(|| format!("Failed to register {}", manifest.display()))?;
                info!(parser = %descriptor.name, priority = descriptor.priority, "Registered custom parser");
            }

            for path in &files {
                let content = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());

                let record = pipeline.process(content, filename, parser.clone()).await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                } else {
                    print_record(&record);
                }
            }
        }
        Command::Parsers(ParsersCommand::List { json }) => {
            let descriptors = pipeline.registry().list();
            if json {
                println!("{}", serde_json::to_string_pretty(&descriptors)?);
            } else {
                for d in descriptors {
                    println!(
                        "{:<16} {:>4}  {:<8} {:<7} {}",
                        d.name,
                        d.priority,
                        if d.builtin { "builtin" } else { "custom" },
                        if d.enabled { "enabled" } else { "disabled" },
                        d.extensions.join(",")
                    );
                }
            }
        }
        Command::Parsers(ParsersCommand::Validate { manifest }) => {
            let source = read_text(&manifest).await?;
            let result = pipeline.registry().validate_code(&source);
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_valid {
                anyhow::bail!("{} is not a valid parser manifest", manifest.display());
            }
        }
        Command::Parsers(ParsersCommand::Test { manifest, sample }) => {
            let source = read_text(&manifest).await?;
            let sample_text = read_text(&sample).await?;
            let registry = pipeline.registry();
            let descriptor = registry
                .register(NewParser::from_source(source))
                .with_context(|| format!("Failed to register {}", manifest.display()))?;
            let report = registry.test_run(&descriptor.name, &sample_text)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed {
                warn!(parser = %descriptor.name, "Test run did not pass");
            }
        }
    }

    Ok(())
}

async fn read_text(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn print_record(record: &AnalysisRecord) {
    println!("{}  {}  {}", record.id, record.filename, record.status.as_str());
    if let Some(reason) = &record.reason {
        println!("  reason: {}", reason);
    }
    if let Some(parser) = &record.parser {
        println!("  parser: {} ({} events)", parser, record.event_count);
    }
    println!(
        "  indicators: {}  techniques: {}",
        record.indicators.len(),
        record.techniques.len()
    );
    if let Some(summary) = &record.summary {
        println!("  summary: {}", summary);
    }
    for warning in &record.warnings {
        println!("  warning: {}", warning);
    }
    if record.partial {
        let missing: Vec<&str> = record.missing_stages.iter().map(|s| s.as_str()).collect();
        println!("  partial: missing {}", missing.join(", "));
    }
}
