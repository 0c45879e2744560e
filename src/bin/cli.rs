//! Harvester CLI
//!
//! Local execution entry point for one target per process.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use harvester::{
    error::Result,
    models::Config,
    pipeline::Harvester,
    storage::{CheckpointStore, RecordSink},
    transport::HttpTransport,
};

/// Resumable harvester for cursor-paginated feeds
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Resumable, exactly-once harvester for cursor-paginated feeds"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "harvester.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Harvest the configured feed, resuming from the checkpoint
    Harvest {
        /// Stop after this many top-level pages
        #[arg(long)]
        max_pages: Option<usize>,

        /// Ignore the stored cursor and start from a fresh capture
        #[arg(long)]
        fresh: bool,
    },

    /// Validate the configuration file
    Validate,

    /// Show checkpoint and output log info
    Info,

    /// Delete the checkpoint (the output log is kept)
    Reset,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load_or_default(&cli.config);
    log::info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Harvest { max_pages, fresh } => {
            if max_pages.is_some() {
                config.harvest.max_pages = max_pages;
            }
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }

            let mut transport = HttpTransport::new(&config.session, &config.target)?;
            let loaded = transport.load_capture_file().await?;
            log::info!("{} captured request(s) available", loaded);

            let mut harvester = Harvester::new(config, transport).fresh_start(fresh);
            if let Err(e) = harvester.run().await {
                log::error!("Harvest failed: {}", e);
                return Err(e);
            }
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("✓ Config OK");
            if !config.expansion.is_enabled() {
                log::info!("Reply threads disabled (no [expansion] doc_id)");
            }
        }

        Command::Info => {
            log::info!("Target: {}", config.target.id);

            let store = CheckpointStore::new(config.paths.checkpoint.clone());
            match store.load().await? {
                Some(cp) => {
                    log::info!("Checkpoint: {}", store.path().display());
                    log::info!("  cursor: {}", cp.cursor.as_deref().unwrap_or("<exhausted>"));
                    if let Some(identity) = &cp.query_identity {
                        log::info!("  query: {}", identity);
                    }
                    log::info!("  dedup keys: {}", cp.dedup_keys.len());
                    log::info!("  pages committed: {}", cp.pages_committed);
                    log::info!("  updated: {}", cp.timestamp);
                }
                None => log::info!("No checkpoint yet."),
            }

            let sink = RecordSink::open(config.paths.output_log.clone()).await?;
            let logged = sink.logged_keys().await?;
            log::info!("Output log: {} ({} record(s))", sink.path().display(), logged.len());
        }

        Command::Reset => {
            let store = CheckpointStore::new(config.paths.checkpoint.clone());
            if !store.reset().await? {
                log::info!("No checkpoint at {}", store.path().display());
            }
        }
    }

    log::info!("Done!");

    Ok(())
}
