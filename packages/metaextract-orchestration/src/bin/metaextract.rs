//! Metaextract CLI
//!
//! # Usage
//!
//! ```bash
//! # Extract one file at the default tier
//! cargo run --bin metaextract -- run --file photo.jpg --mime image/jpeg
//!
//! # Show the execution plan with an extra plugin root
//! cargo run --bin metaextract -- plan --plugin ./plugins/acme
//!
//! # Print the default configuration
//! cargo run --bin metaextract -- config-template
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use metaextract_orchestration::{EngineConfig, ExtractionEngine, ExtractionRequest};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metaextract")]
#[command(about = "Metaextract - run extractor units against a file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract metadata from one file and print the JSON report
    Run {
        /// File to extract
        #[arg(short, long)]
        file: PathBuf,

        /// MIME type of the file
        #[arg(short, long, default_value = "application/octet-stream")]
        mime: String,

        /// Access tier (defaults to the configured default tier)
        #[arg(short, long)]
        tier: Option<String>,

        /// Engine configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Extra plugin roots (enables plugins)
        #[arg(short, long)]
        plugin: Vec<PathBuf>,
    },

    /// Print the execution plan and its diagnostics
    Plan {
        /// Engine configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Extra plugin roots (enables plugins)
        #[arg(short, long)]
        plugin: Vec<PathBuf>,
    },

    /// Print the default configuration
    ConfigTemplate,
}

fn build_engine(config: Option<&Path>, plugins: &[PathBuf]) -> anyhow::Result<ExtractionEngine> {
    let config = EngineConfig::load(config).context("loading configuration")?;
    let engine = ExtractionEngine::from_config(&config)?;

    if !plugins.is_empty() {
        engine.plugins().set_enabled(true);
    }
    for root in plugins {
        let name = engine
            .plugins()
            .load(root)
            .with_context(|| format!("loading plugin {}", root.display()))?;
        info!("Loaded plugin {} from {}", name, root.display());
    }
    Ok(engine)
}

async fn run(
    file: PathBuf,
    mime: String,
    tier: Option<String>,
    config: Option<PathBuf>,
    plugins: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let engine = build_engine(config.as_deref(), &plugins)?;

    let mut request = ExtractionRequest::new(file, mime);
    if let Some(tier) = tier {
        request = request.with_tier(tier);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let report = match engine.extract(request, &cancel).await {
        Ok(report) => report,
        Err(e) => {
            error!("Extraction failed [{}]: {}", e.category(), e);
            return Err(e.into());
        }
    };
    println!("{}", report.to_json()?);
    Ok(())
}

fn plan(config: Option<PathBuf>, plugins: Vec<PathBuf>) -> anyhow::Result<()> {
    let engine = build_engine(config.as_deref(), &plugins)?;
    let catalog = engine.plugins().snapshot();
    let plan = engine.plan();

    println!(
        "Catalog generation {}: {} units",
        catalog.generation(),
        catalog.len()
    );
    println!("{}", plan.describe());

    if !catalog.diagnostics().is_empty() {
        println!("\nDiscovery diagnostics:");
        for diag in catalog.diagnostics() {
            println!("  {} ({}): {:?} - {}", diag.unit_id, diag.origin, diag.issue, diag.message);
        }
    }
    if !plan.diagnostics().is_empty() {
        println!("\nPlan diagnostics:");
        for diag in plan.diagnostics() {
            println!("  {}", diag.describe());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            mime,
            tier,
            config,
            plugin,
        } => run(file, mime, tier, config, plugin).await?,
        Commands::Plan { config, plugin } => plan(config, plugin)?,
        Commands::ConfigTemplate => print!("{}", EngineConfig::template()?),
    }

    Ok(())
}
