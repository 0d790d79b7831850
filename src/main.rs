//! # json-mdq CLI (`mdq`)
//!
//! ## Usage
//!
//! ```bash
//! mdq [--config mdq.toml] [--metadata feed.json] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mdq serve` | Index the feed, watch it for changes and serve HTTP |
//! | `mdq index` | Index the feed and exit |
//!
//! ## Examples
//!
//! ```bash
//! # Serve the feed named by $METADATA on :3000
//! METADATA=/srv/metadata.json mdq serve
//!
//! # Throw away the on-disk index and rebuild it, then exit
//! mdq --metadata feed.json --index /var/lib/mdq --rebuild index
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use json_mdq::config::{self, Config};
use json_mdq::reload::ReloadCoordinator;
use json_mdq::server;
use json_mdq::watch::ChangeWatcher;

/// json-mdq: a searchable discovery service over a JSON metadata feed.
///
/// Settings come from an optional TOML file; flags override it.
#[derive(Parser)]
#[command(name = "mdq", version)]
struct Cli {
    /// Path to configuration file (TOML). Defaults are used without one.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON metadata feed to serve.
    #[arg(long, global = true, env = "METADATA")]
    metadata: Option<PathBuf>,

    /// Directory of the on-disk search index.
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    /// HTTP listen address.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Number of documents per indexing batch.
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Delete the on-disk index before opening it, forcing a full rebuild.
    #[arg(long, global = true)]
    rebuild: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the feed, watch it for changes, and serve discovery queries.
    Serve,

    /// Index the feed and exit.
    Index,
}

impl Cli {
    fn resolve_config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config(path)?,
            None => Config::default(),
        };

        if let Some(path) = &self.metadata {
            cfg.source.path = path.clone();
        }
        if let Some(path) = &self.index {
            cfg.index.path = path.clone();
        }
        if let Some(bind) = &self.bind {
            cfg.server.bind = bind.clone();
        }
        if let Some(batch_size) = self.batch_size {
            cfg.index.batch_size = batch_size;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn discard_index(cfg: &Config) -> Result<()> {
    if cfg.index.in_memory || !cfg.index.path.exists() {
        return Ok(());
    }
    info!(path = %cfg.index.path.display(), "removing index for rebuild");
    std::fs::remove_dir_all(&cfg.index.path)
        .with_context(|| format!("Failed to remove index: {}", cfg.index.path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = cli.resolve_config()?;

    if cli.rebuild {
        discard_index(&cfg)?;
    }

    let coordinator = Arc::new(ReloadCoordinator::start(&cfg).await?);
    info!(
        entities = coordinator.snapshot().store.len(),
        "metadata initialized"
    );

    match cli.command {
        Commands::Index => {}
        Commands::Serve => {
            let _watcher = ChangeWatcher::spawn(coordinator.clone(), cfg.source.debounce())?;
            server::run_server(coordinator, &cfg.server).await?;
        }
    }

    Ok(())
}
