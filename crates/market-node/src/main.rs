use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use market_node::logging;
use market_node::MarketConfig;
use market_storage::{export_json, BackendRegistry};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_CONFIG: &str = "./market.toml";

#[derive(Parser)]
#[command(name = "market-node")]
#[command(about = "Storage and retrieval deal market node", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default market.toml
    Init {
        /// Output directory for configuration
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Dump every repository namespace as JSON
    Export {
        /// Repository DSN, e.g. rocks:./data/market; defaults to the configured one
        #[arg(short, long)]
        repo: Option<String>,

        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<MarketConfig> {
    let mut config = match path {
        Some(path) => MarketConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => MarketConfig::from_file(Path::new(DEFAULT_CONFIG))?,
        None => MarketConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    if let Err(e) = logging::init_logging(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Init { output } => {
            std::fs::create_dir_all(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            let path = output.join("market.toml");
            MarketConfig::default().save_to_file(&path)?;
            info!(path = %path.display(), "✨ Wrote default configuration");
            Ok(())
        }

        Commands::Export { repo, output } => {
            let dsn = repo.unwrap_or_else(|| config.repo.dsn.clone());
            let store = BackendRegistry::with_defaults()
                .open(&dsn)
                .with_context(|| format!("opening deal repository {}", dsn))?;
            let dump = export_json(store.as_ref()).await.context("exporting repository")?;
            let text = serde_json::to_string_pretty(&dump)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, text)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), backend = store.backend_name(), "📦 Repository exported");
                }
                None => println!("{}", text),
            }
            Ok(())
        }
    }
}
