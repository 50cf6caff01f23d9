//! The Config Watcher: observes the config file for changes, debounces, and
//! triggers atomic catalog rebuilds. A failed rebuild leaves the previous
//! catalog in force.

use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::catalog::Catalog;
use crate::config::HostConfig;
use crate::scheduler::SchedulerLoop;

/// Multiple filesystem notifications within this window are coalesced into
/// a single reload attempt (§4.8).
const DEBOUNCE: Duration = Duration::from_millis(800);

pub struct ConfigWatcher {
    path: PathBuf,
    catalog: Arc<ArcSwap<Catalog>>,
    scheduler: Arc<SchedulerLoop>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, catalog: Arc<ArcSwap<Catalog>>, scheduler: Arc<SchedulerLoop>) -> Self {
        ConfigWatcher {
            path,
            catalog,
            scheduler,
        }
    }

    /// Spawn the filesystem watcher and debounced reload task. Returns the
    /// underlying `notify` watcher, which must be kept alive for the
    /// duration of the host's run.
    pub fn spawn(self) -> anyhow::Result<RecommendedWatcher> {
        let (tx, mut rx) = mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.try_send(());
            }
        })?;

        // Watching the parent directory catches atomic temp-file + rename
        // replacement, which never fires an in-place "modify" event for the
        // original inode.
        let watch_target: &Path = self.path.parent().unwrap_or_else(|| Path::new("."));
        watcher.watch(watch_target, RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            loop {
                if rx.recv().await.is_none() {
                    break;
                }

                // Debounce: drain any further notifications within the window.
                let _ = tokio::time::timeout(DEBOUNCE, async {
                    while rx.recv().await.is_some() {}
                })
                .await;

                self.reload();
            }
        });

        Ok(watcher)
    }

    /// Attempt to load and validate the config file, swapping the catalog
    /// pointer on success. On failure the previous catalog remains active.
    pub fn reload(&self) {
        match HostConfig::from_file(&self.path) {
            Ok(config) => {
                let (catalog, report) = Catalog::load(&config);
                tracing::info!(
                    total = report.total,
                    valid_enabled = report.valid_enabled,
                    disabled = report.disabled,
                    invalid_cron = report.invalid_cron,
                    zone_fallbacks = report.zone_fallbacks,
                    "config reload validation summary"
                );
                for issue in &report.issues {
                    tracing::warn!(?issue, "job validation issue");
                }
                if report.warning_no_active_jobs {
                    tracing::warn!("reload produced zero active jobs from a non-empty config");
                }
                self.scheduler.update_settings(config.scheduler.clone());
                self.catalog.store(Arc::new(catalog));
            }
            Err(e) => {
                tracing::error!(error = %e, "config reload failed; retaining previous catalog");
            }
        }
    }
}
