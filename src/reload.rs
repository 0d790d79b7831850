//! Generation publishing and reload sequencing.
//!
//! The [`ReloadCoordinator`] owns the current [`Generation`], the
//! `(EntityStore, index)` pair that query handlers read. Readers take a
//! snapshot with [`ReloadCoordinator::snapshot`], which never waits on a
//! reload; a reload builds its new store off to the side, synchronizes the
//! index, and only then swaps the new generation in.
//!
//! # Reload sequence
//!
//! ```text
//! reload() ── lock ──▶ EntityStore::load ──▶ sync_index (blocking task) ──▶ publish
//!                                                 │ error
//!                                                 ▼
//!                                        generation not published
//! ```
//!
//! Only one reload runs at a time. The sync mode is decided once, when the
//! index is opened: the first pass rebuilds if no ready index existed, and
//! every later reload reconciles. An on-disk index is marked ready only
//! after the first pass succeeds, so a start that fails partway leaves
//! nothing a later start would reconcile against.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::index::{EntityIndex, SearchIndex};
use crate::store::EntityStore;
use crate::sync::{sync_index, SyncMode, SyncReport};

/// One published `(store, index)` pair.
pub struct Generation {
    /// Starts at 1 for the startup load and increases by one per reload.
    pub number: u64,
    pub mode: SyncMode,
    pub store: Arc<EntityStore>,
    pub index: Arc<dyn SearchIndex>,
}

pub struct ReloadCoordinator {
    source: PathBuf,
    batch_size: usize,
    index: Arc<dyn SearchIndex>,
    current: ArcSwap<Generation>,
    reload_lock: Mutex<()>,
}

impl ReloadCoordinator {
    /// Opens the configured index and publishes the first generation.
    ///
    /// Any failure here is a startup failure: the source could not be read,
    /// the index could not be opened, or the first synchronization failed.
    pub async fn start(config: &Config) -> Result<Self> {
        let heap = config.index.writer_heap_bytes;
        let (index, existed) = if config.index.in_memory {
            (EntityIndex::create_in_ram(heap)?, false)
        } else {
            let path = config.index.path.clone();
            tokio::task::spawn_blocking(move || EntityIndex::open(&path, heap))
                .await
                .context("index open task failed")??
        };

        let mode = if existed {
            SyncMode::Reconcile
        } else {
            SyncMode::Rebuild
        };
        info!(
            index = %config.index.path.display(),
            in_memory = config.index.in_memory,
            existed,
            %mode,
            "opened index"
        );

        let coordinator = Self::with_index(
            &config.source.path,
            config.index.batch_size,
            Arc::new(index),
            mode,
        )
        .await?;

        // Only a fully synchronized index survives a restart.
        if !config.index.in_memory {
            EntityIndex::mark_ready(&config.index.path)?;
        }
        Ok(coordinator)
    }

    /// Publishes the first generation against an already opened index,
    /// synchronizing it with `mode`.
    pub async fn with_index(
        source: &Path,
        batch_size: usize,
        index: Arc<dyn SearchIndex>,
        mode: SyncMode,
    ) -> Result<Self> {
        let source = source.to_path_buf();
        let (store, report) = load_and_sync(&source, &index, mode, batch_size).await?;
        let generation = Generation {
            number: 1,
            mode: report.mode,
            store,
            index: index.clone(),
        };

        Ok(Self {
            source,
            batch_size,
            index,
            current: ArcSwap::from_pointee(generation),
            reload_lock: Mutex::new(()),
        })
    }

    /// The currently published generation.
    ///
    /// # Returns
    ///
    /// A shared handle that stays valid, and unchanged, across later
    /// reloads. Hold it for the whole request so store and index agree.
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// The metadata source this coordinator reloads from.
    ///
    /// # Returns
    ///
    /// The path as configured, not canonicalized. The watcher resolves it
    /// before subscribing to its parent directory.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Loads the source again, reconciles the index against it and
    /// publishes the result. Concurrent callers queue behind each other.
    pub async fn reload(&self) -> Result<SyncReport> {
        let _guard = self.reload_lock.lock().await;

        let (store, report) =
            load_and_sync(&self.source, &self.index, SyncMode::Reconcile, self.batch_size).await?;
        let number = self.current.load().number + 1;
        let entities = store.len();

        self.current.store(Arc::new(Generation {
            number,
            mode: report.mode,
            store,
            index: self.index.clone(),
        }));

        info!(generation = number, entities, "published generation");
        Ok(report)
    }
}

async fn load_and_sync(
    source: &Path,
    index: &Arc<dyn SearchIndex>,
    mode: SyncMode,
    batch_size: usize,
) -> Result<(Arc<EntityStore>, SyncReport)> {
    let path = source.to_path_buf();
    let store = tokio::task::spawn_blocking(move || EntityStore::load(&path))
        .await
        .context("metadata load task failed")??;
    let store = Arc::new(store);

    let report = {
        let store = store.clone();
        let index = index.clone();
        tokio::task::spawn_blocking(move || sync_index(index.as_ref(), &store, mode, batch_size))
            .await
            .context("index sync task failed")?
            .with_context(|| format!("{} of the search index failed", mode))?
    };

    Ok((store, report))
}
