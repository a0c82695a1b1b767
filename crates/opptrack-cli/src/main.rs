use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use opptrack_storage::RecordStore;
use opptrack_sync::{archive_older_than, Pipeline, RunConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opptrack")]
#[command(about = "Procurement opportunity tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the catalog and reconcile against the persisted store.
    Run {
        /// Catalog entry URL (overrides OPPTRACK_ENTRY_URL).
        #[arg(long)]
        entry_url: Option<String>,
        /// Maximum listing pages to crawl.
        #[arg(long)]
        max_pages: Option<usize>,
        /// Keep only records published this many days ago.
        #[arg(long)]
        days_ago: Option<i64>,
        /// Skip detail-page enrichment.
        #[arg(long)]
        skip_details: bool,
        /// Store file path (overrides OPPTRACK_STORE_PATH).
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Archive active records not seen for the given number of days.
    Archive {
        #[arg(long, default_value_t = 30)]
        days: i64,
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        entry_url: None,
        max_pages: None,
        days_ago: None,
        skip_details: false,
        store: None,
    }) {
        Commands::Run {
            entry_url,
            max_pages,
            days_ago,
            skip_details,
            store,
        } => {
            let mut config = RunConfig::from_env();
            if let Some(entry_url) = entry_url {
                config.entry_url = entry_url;
            }
            if let Some(max_pages) = max_pages {
                config.max_pages = max_pages;
            }
            if days_ago.is_some() {
                config.days_ago = days_ago;
            }
            if skip_details {
                config.fetch_details = false;
            }
            if let Some(store) = store {
                config.store_path = store;
            }

            let summary = Pipeline::new(config).run().await?;
            println!(
                "run complete: pages={} rows={} new={} updated={} unchanged={} stale={} duplicates={} enrich_ok={} enrich_failed={}",
                summary.pages_crawled,
                summary.rows_extracted,
                summary.new,
                summary.updated,
                summary.unchanged,
                summary.stale_archived,
                summary.duplicates_dropped,
                summary.enrichment_ok,
                summary.enrichment_failed,
            );
        }
        Commands::Archive { days, store } => {
            let path = store.unwrap_or_else(|| RunConfig::from_env().store_path);
            let mut record_store = RecordStore::load(&path).await?;
            let archived = archive_older_than(&mut record_store, days, Utc::now());
            record_store.save(&path).await?;
            println!(
                "archive complete: moved={} active={} archived_total={}",
                archived,
                record_store.active_len(),
                record_store.archive_len()
            );
        }
    }

    Ok(())
}
