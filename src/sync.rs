//! Index synchronization.
//!
//! Brings the search index in line with a freshly loaded [`EntityStore`]
//! using one of two passes, chosen by the caller:
//!
//! - **Rebuild** indexes every entity in batches of `batch_size`, flushing
//!   the remainder at the end. It is the only pass that adds or updates
//!   documents.
//! - **Reconcile** lists every indexed ID and deletes those no longer in the
//!   store, all in one commit. It never adds documents and never refreshes the content of an
//!   entity that still exists, so an entity whose fields changed keeps its
//!   previously indexed projection until the next rebuild.
//!
//! Any engine error aborts the pass; the caller must not publish the
//! generation.

use anyhow::{Context, Result};
use std::fmt;
use tracing::{debug, info, warn};

use crate::index::{IndexQuery, SearchIndex};
use crate::models::EntityDocument;
use crate::store::EntityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Rebuild,
    Reconcile,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Rebuild => write!(f, "rebuild"),
            SyncMode::Reconcile => write!(f, "reconcile"),
        }
    }
}

/// What a synchronization pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub indexed: usize,
    pub batches: usize,
    pub removed: usize,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            indexed: 0,
            batches: 0,
            removed: 0,
        }
    }
}

/// Runs a pass of the given mode. Blocking.
pub fn sync_index(
    index: &dyn SearchIndex,
    store: &EntityStore,
    mode: SyncMode,
    batch_size: usize,
) -> Result<SyncReport> {
    match mode {
        SyncMode::Rebuild => rebuild(index, store, batch_size),
        SyncMode::Reconcile => reconcile(index, store),
    }
}

pub fn rebuild(
    index: &dyn SearchIndex,
    store: &EntityStore,
    batch_size: usize,
) -> Result<SyncReport> {
    let batch_size = batch_size.max(1);
    let mut report = SyncReport::new(SyncMode::Rebuild);
    let mut batch = index.new_batch();

    for (id, raw) in store.iter() {
        let doc = EntityDocument::from_raw(raw)
            .with_context(|| format!("Failed to project entity {}", id))?;
        batch.add(doc);
        report.indexed += 1;

        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, index.new_batch());
            index
                .apply_batch(full)
                .with_context(|| format!("Failed to apply batch {}", report.batches + 1))?;
            report.batches += 1;
            debug!(indexed = report.indexed, "applied batch");
        }
    }

    if !batch.is_empty() {
        index
            .apply_batch(batch)
            .with_context(|| format!("Failed to apply batch {}", report.batches + 1))?;
        report.batches += 1;
    }

    info!(
        documents = report.indexed,
        batches = report.batches,
        "finished indexing"
    );
    Ok(report)
}

pub fn reconcile(index: &dyn SearchIndex, store: &EntityStore) -> Result<SyncReport> {
    let mut report = SyncReport::new(SyncMode::Reconcile);

    let count = index
        .doc_count()
        .context("Failed to count indexed documents")?;
    let hits = index
        .search(&IndexQuery::MatchAll, count as usize)
        .context("Failed to list indexed documents")?;

    let gone: Vec<String> = hits
        .into_iter()
        .map(|hit| hit.id)
        .filter(|id| !store.contains(id))
        .collect();
    for id in &gone {
        warn!(id = %id, "removing gone entity");
    }
    index
        .delete_many(&gone)
        .with_context(|| format!("Failed to delete {} gone documents", gone.len()))?;
    report.removed = gone.len();

    info!(
        documents = count,
        removed = report.removed,
        "finished looking for removed entities"
    );
    Ok(report)
}
