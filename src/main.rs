//! VinIntel - dealer inventory scrape & ingest backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vinintel_backend::config::Settings;
use vinintel_backend::db::Store;
use vinintel_backend::scrape::{
    FetchClient, HttpBackendApi, HttpTransport, LocalBlobStore, Orchestrator,
};

#[derive(Parser)]
#[command(name = "vinintel", about = "Dealer inventory scrape pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scrape job over the active dealer catalog.
    Scrape {
        /// Model to scrape (e.g. "4Runner", "Land Cruiser").
        #[arg(long)]
        model: String,
        /// Restrict the job to specific dealer ids.
        #[arg(long, value_delimiter = ',')]
        dealer_ids: Vec<i64>,
    },
    /// Seed the dealer catalog from a JSON export, classifying backends.
    Seed {
        /// Path to a JSON array of dealer records.
        #[arg(long)]
        file: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Command::Scrape { model, dealer_ids } => run_scrape(settings, &model, dealer_ids).await,
        Command::Seed { file } => seed_dealers(settings, &file),
    }
}

fn seed_dealers(settings: Settings, file: &std::path::Path) -> Result<()> {
    use vinintel_backend::models::{Backend, Dealer};

    let store = Store::open(&settings.database_path)
        .with_context(|| format!("opening store at {}", settings.database_path.display()))?;
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading dealer export {}", file.display()))?;
    let mut dealers: Vec<Dealer> =
        serde_json::from_str(&raw).context("parsing dealer export JSON")?;

    for dealer in &mut dealers {
        if let Some(backend) = Backend::classify(
            &dealer.backend_type,
            dealer.inventory_url_template.as_deref(),
            dealer.homepage_url.as_deref(),
            Some(dealer.id),
        ) {
            dealer.backend_type = backend.as_str().to_string();
        }
        store.insert_dealer(dealer)?;
    }
    info!(count = dealers.len(), "dealer catalog seeded");
    Ok(())
}

async fn run_scrape(settings: Settings, model: &str, dealer_ids: Vec<i64>) -> Result<()> {
    let store = Store::open(&settings.database_path).with_context(|| {
        format!(
            "opening store at {}",
            settings.database_path.display()
        )
    })?;

    let mut dealers = store.load_active_dealers().context("loading dealers")?;
    if !dealer_ids.is_empty() {
        dealers.retain(|dealer| dealer_ids.contains(&dealer.id));
    }
    info!(count = dealers.len(), model, "dealers selected for scrape");

    let transport = HttpTransport::new(
        &settings.fetch_base_url,
        settings.fetch_api_key.clone(),
        Duration::from_secs(settings.fetch_timeout_secs),
    )?;
    let fetcher = Arc::new(FetchClient::new(Box::new(transport), settings.max_attempts));
    let api = Arc::new(HttpBackendApi::new(Duration::from_secs(
        settings.followup_timeout_secs,
    ))?);
    let blobs = Arc::new(LocalBlobStore::new(settings.blob_root.clone()));

    let orchestrator = Orchestrator::new(store, fetcher, api, blobs)
        .with_max_attempts(settings.max_attempts)
        .with_limits(settings.rpm_limit, settings.max_concurrency);

    // Ctrl-C flips the job's cancel flag; in-flight tasks observe it at
    // their next suspension point and record a cancellation error.
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling scrape job");
            cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let summary = orchestrator.run_job(dealers, model).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
