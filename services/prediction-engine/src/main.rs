//! Prediction Engine CLI
//!
//! Usage:
//!   prediction-engine list [--asset BTC]
//!   prediction-engine delete --asset BTC
//!   prediction-engine reconcile
//!   prediction-engine fit-garch --csv prices.csv [--column close] [--horizon 10]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prediction_engine::{EngineConfig, PredictionEngine};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prediction-engine")]
#[command(about = "Model registry and volatility tooling for crypto market predictions")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Registry root directory, overrides the configuration
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered versions, newest first
    List {
        /// Asset prefix to filter model ids by
        #[arg(long, default_value = "")]
        asset: String,
    },
    /// Delete every model whose id starts with the asset prefix
    Delete {
        /// Asset prefix (e.g. BTC)
        #[arg(long)]
        asset: String,
    },
    /// Remove orphaned artifacts and report dangling index entries
    Reconcile,
    /// Fit GARCH(1,1) to a CSV price column and print the forecast as JSON
    FitGarch {
        /// CSV file with a header row
        #[arg(long)]
        csv: PathBuf,
        /// Column holding close prices
        #[arg(long, default_value = "close")]
        column: String,
        /// Forecast steps
        #[arg(long, default_value_t = 10)]
        horizon: usize,
        /// Symbol to report
        #[arg(long, default_value = "UNKNOWN")]
        symbol: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("prediction_engine=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = cli.root {
        config.registry.root = root;
    }

    info!("Registry index: {}", config.index_path().display());
    let engine = PredictionEngine::from_config(config)?;
    let registry = engine.cache().registry();

    match cli.command {
        Commands::List { asset } => {
            let versions = registry.list_models(&asset);
            if versions.is_empty() {
                println!("No models registered for prefix '{asset}'");
            }
            for version in versions {
                println!(
                    "{}\tv{}\t{}\t{}\t{}",
                    version.model_id,
                    version.version,
                    version.model_type,
                    version.created_at.to_rfc3339(),
                    &version.checksum[..12.min(version.checksum.len())]
                );
            }
        }
        Commands::Delete { asset } => {
            let removed = engine.cache().delete_models(&asset)?;
            println!("Deleted {removed} versions for prefix '{asset}'");
        }
        Commands::Reconcile => {
            let report = registry.reconcile()?;
            println!("Stale staging files removed: {}", report.stale_staging_removed);
            for name in &report.orphaned_artifacts_removed {
                println!("Removed orphan: {name}");
            }
            for (model_id, version) in &report.missing_artifacts {
                println!("Missing artifact: {model_id} v{version}");
            }
        }
        Commands::FitGarch {
            csv,
            column,
            horizon,
            symbol,
        } => {
            let prices = read_prices(&csv, &column)?;
            let prediction = engine.predict_volatility(&symbol, &prices, horizon)?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
    }

    Ok(())
}

fn read_prices(path: &Path, column: &str) -> Result<Vec<f64>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let index = reader
        .headers()?
        .iter()
        .position(|header| header == column)
        .with_context(|| format!("Column '{column}' not found in {}", path.display()))?;

    let mut prices = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let raw = record
            .get(index)
            .with_context(|| format!("Row {} has no '{column}' field", line + 2))?;
        let price = raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("Row {}: invalid price '{raw}'", line + 2))?;
        prices.push(price);
    }
    Ok(prices)
}
