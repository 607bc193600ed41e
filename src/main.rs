use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use backupd::config::Config;
use backupd::cycler::CyclerRegistry;
use backupd::error::Result;
use backupd::pipeline::{self, BackupRun};

#[derive(Parser)]
#[command(name = "backupd")]
#[command(about = "Backup daemon with pluggable storages and keep-last-N retention")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./backupd.yml, ~/.backupd/backupd.yml, /etc/backupd/backupd.yml)
    #[arg(long, short, global = true, env = "BACKUPD_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a finished archive on every storage of a model and apply retention
    Perform {
        #[arg(long, short)]
        model: String,
        /// Archive file, or directory of archive parts
        #[arg(long, short)]
        archive: PathBuf,
        /// Key to store under (defaults to a timestamped archive name)
        #[arg(long)]
        file_key: Option<String>,
    },
    /// List files stored under a prefix
    List {
        #[arg(long, short)]
        model: String,
        #[arg(long, short)]
        storage: String,
        #[arg(default_value = "")]
        parent: String,
    },
    /// Print the retention ledger of a model's storage
    Ledger {
        #[arg(long, short)]
        model: String,
        #[arg(long, short)]
        storage: String,
    },
    /// Download a stored file to a local temp path
    Download {
        #[arg(long, short)]
        model: String,
        #[arg(long, short)]
        storage: String,
        file_key: String,
    },
    /// Show configured models and storages
    Models,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(cli.config.as_deref())?;
    let registry = CyclerRegistry::new(config.cycler_dir());

    match cli.command {
        Commands::Perform {
            model,
            archive,
            file_key,
        } => {
            let run = match file_key {
                Some(key) => BackupRun::new(&model, archive, &key).await?,
                None => BackupRun::at(&model, archive, Utc::now()).await?,
            };
            let result = pipeline::run_backup(&config, &registry, &run).await?;
            for outcome in &result.outcomes {
                match &outcome.result {
                    Ok(report) => println!(
                        "{} ({}): stored {}, evicted {}, failed deletes {}",
                        outcome.storage,
                        outcome.kind,
                        result.file_key,
                        report.evicted.len(),
                        report.failed.len()
                    ),
                    Err(e) => println!("{} ({}): FAILED: {e}", outcome.storage, outcome.kind),
                }
            }
            Ok(result.is_success())
        }
        Commands::List {
            model,
            storage,
            parent,
        } => {
            for item in pipeline::list_storage(&config, &model, &storage, &parent).await? {
                println!(
                    "{}\t{}\t{}",
                    item.last_modified.to_rfc3339(),
                    item.size,
                    item.filename
                );
            }
            Ok(true)
        }
        Commands::Ledger { model, storage } => {
            config.model(&model)?.storage(&storage)?;
            let artifacts = registry.artifacts(&model, &storage).await?;
            println!("{}", serde_json::to_string_pretty(&artifacts)?);
            Ok(true)
        }
        Commands::Download {
            model,
            storage,
            file_key,
        } => {
            let path = pipeline::download_from_storage(&config, &model, &storage, &file_key).await?;
            println!("{}", path.display());
            Ok(true)
        }
        Commands::Models => {
            for model in config.models.values() {
                println!("{}", model.name);
                for storage in model.storages.values() {
                    println!("  {} ({}, keep {})", storage.name, storage.kind, storage.keep);
                }
            }
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "backupd failed");
            ExitCode::FAILURE
        }
    }
}
