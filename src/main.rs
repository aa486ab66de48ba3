use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use payrail::config::Config;
use payrail::connectors::ProviderKey;
use payrail::connectors::registry::ConnectorRegistry;
use payrail::infrastructure::Stores;
use payrail::interfaces::csv::project_reader::load_projects;
use payrail::interfaces::http::{self, AppStateBuilder};
use payrail::telemetry;
use std::io;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook ingestion and operations HTTP server
    Serve {
        /// Project bindings CSV (webhook_key,org_id,project_id,provider,signing_secret)
        #[arg(long)]
        projects: Option<PathBuf>,

        /// Path to persistent database (optional). If provided, uses RocksDB.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print what a project must provision to receive a provider's webhooks
    SetupConfig {
        #[arg(long)]
        provider: ProviderKey,

        #[arg(long)]
        project_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { projects, db_path } => serve(projects, db_path).await,
        Command::SetupConfig {
            provider,
            project_id,
        } => {
            let registry = ConnectorRegistry::new();
            let setup = registry.resolve(provider).setup_config(&project_id);
            serde_json::to_writer_pretty(io::stdout().lock(), &setup).into_diagnostic()?;
            println!();
            Ok(())
        }
    }
}

async fn serve(projects: Option<PathBuf>, db_path: Option<PathBuf>) -> Result<()> {
    let config = Config::from_env()
        .inspect_err(|e| error!(error = %e, "invalid configuration"))
        .into_diagnostic()?;

    let bindings = match projects {
        Some(path) => load_projects(&path)
            .inspect_err(|e| error!(error = %e, path = %path.display(), "cannot load projects"))
            .into_diagnostic()?,
        None => {
            warn!("no --projects file given; every webhook key will be rejected");
            Vec::new()
        }
    };

    let stores = open_stores(db_path)?;
    let bind_addr = config.bind_addr;
    info!(?config, projects = bindings.len(), "starting");

    let state = AppStateBuilder::new(config)
        .stores(stores)
        .bindings(bindings)
        .build()
        .into_diagnostic()?;
    http::serve(bind_addr, state).await.into_diagnostic()?;
    Ok(())
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    match db_path {
        Some(path) => Stores::rocksdb(path).into_diagnostic(),
        None => Ok(Stores::in_memory()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if let Some(path) = db_path {
        warn!(
            path = %path.display(),
            "built without the storage-rocksdb feature; using in-memory storage"
        );
    }
    Ok(Stores::in_memory())
}
