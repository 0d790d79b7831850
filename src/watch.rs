//! Source file change watching.
//!
//! The [`ChangeWatcher`] subscribes to the directory containing the metadata
//! source and reacts to write-type events on the source file. The first
//! write after an idle period arms the [`Debouncer`]; once the quiescence
//! window has elapsed the coordinator reloads. Writes that arrive while a
//! cycle is armed or reloading are dropped, not queued. The final state of
//! the file is still picked up, by the next write after the cycle ends.
//!
//! A reload failure at this point is fatal and terminates the process.
//! Watch errors are logged and watching continues.

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::reload::ReloadCoordinator;

/// Coalesces bursts of triggers into a single delayed task.
///
/// The active flag is set with a compare-and-swap when a cycle is armed and
/// cleared when the task finishes (or panics), so at most one task is
/// pending or running at any instant.
#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    active: Arc<AtomicBool>,
}

struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Debouncer {
    /// Creates an idle debouncer that waits `window` after the first
    /// trigger before running the task.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a cycle is armed or its task is still running.
    ///
    /// # Returns
    ///
    /// `true` from the moment [`Debouncer::trigger`] arms a cycle until its
    /// task completes or panics. Triggers made while this is `true` are
    /// dropped.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Runs `task` after the quiescence window unless a cycle is already
    /// active. Returns whether this call armed a new cycle.
    pub fn trigger<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let guard = ActiveGuard(self.active.clone());
        let window = self.window;
        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(window).await;
            task.await;
        });
        true
    }
}

/// Watches the metadata source and drives reloads.
///
/// Dropping the watcher stops watching.
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    /// Attaches the watch. Failing to attach is a startup error.
    pub fn spawn(coordinator: Arc<ReloadCoordinator>, debounce: Duration) -> Result<Self> {
        let source = std::fs::canonicalize(coordinator.source()).with_context(|| {
            format!(
                "Failed to resolve metadata source: {}",
                coordinator.source().display()
            )
        })?;
        let directory = source
            .parent()
            .context("metadata source has no parent directory")?
            .to_path_buf();
        let file_name = source
            .file_name()
            .context("metadata source has no file name")?
            .to_os_string();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                if events_tx.send(result).is_err() {
                    debug!("watch event dropped, receiver closed");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to set up watcher")?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to add {} to watchlist", directory.display()))?;
        info!(path = %source.display(), "watching metadata source");

        let task = tokio::spawn(handle_events(
            coordinator,
            events_rx,
            file_name,
            Debouncer::new(debounce),
        ));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_events(
    coordinator: Arc<ReloadCoordinator>,
    mut events_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    file_name: OsString,
    debouncer: Debouncer,
) {
    while let Some(result) = events_rx.recv().await {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "watcher error");
                continue;
            }
        };

        if !is_write(&event.kind) || !touches(&event, &file_name) {
            continue;
        }

        let armed = debouncer.trigger(reload_or_exit(coordinator.clone()));
        if armed {
            info!(kind = ?event.kind, "got change event, waiting for file to settle");
        } else {
            debug!(kind = ?event.kind, "reload already pending");
        }
    }
}

async fn reload_or_exit(coordinator: Arc<ReloadCoordinator>) {
    match coordinator.reload().await {
        Ok(report) => info!(
            mode = %report.mode,
            removed = report.removed,
            "reload complete"
        ),
        Err(e) => {
            error!(error = format!("{:#}", e), "reload failed, terminating");
            std::process::exit(1);
        }
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_write_kinds() {
        assert!(is_write(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(is_write(&EventKind::Create(CreateKind::File)));
        assert!(is_write(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(!is_write(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_write(&EventKind::Access(AccessKind::Read)));
    }

    #[test]
    fn test_touches_filters_by_file_name() {
        let name = OsString::from("metadata.json");
        let event = Event::new(EventKind::Any).add_path(PathBuf::from("/srv/metadata.json"));
        assert!(touches(&event, &name));
        let other = Event::new(EventKind::Any).add_path(PathBuf::from("/srv/other.json"));
        assert!(!touches(&other, &name));
    }

    #[tokio::test]
    async fn test_burst_runs_task_once() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut armed = 0;
        for _ in 0..10 {
            let runs = runs.clone();
            if debouncer.trigger(async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }) {
                armed += 1;
            }
        }
        assert_eq!(armed, 1);
        assert!(debouncer.is_active());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_active());
    }

    #[tokio::test]
    async fn test_triggers_during_task_are_dropped() {
        let debouncer = Debouncer::new(Duration::from_millis(10));
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = running.clone();
            let max_running = max_running.clone();
            debouncer.trigger(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rearms_after_cycle() {
        let debouncer = Debouncer::new(Duration::from_millis(10));
        assert!(debouncer.trigger(async {}));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(debouncer.trigger(async {}));
    }

    #[tokio::test]
    async fn test_flag_cleared_after_panic() {
        let debouncer = Debouncer::new(Duration::from_millis(1));
        assert!(debouncer.trigger(async {
            if true {
                panic!("boom");
            }
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!debouncer.is_active());
    }
}
