//! Timezone-aware cron job host.
//!
//! Components, leaves first: a [`clock`] abstraction and zone resolver, a
//! [`cron`] evaluator, the [`catalog`] loader/validator, a [`concurrency`]
//! gate, the [`supervisor`] that runs child processes, the [`recorder`] that
//! tracks execution history and fires alerts, the [`scheduler`] poll loop,
//! and the [`watcher`] that hot-reloads configuration.

pub mod catalog;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod cron;
pub mod error;
pub mod recorder;
pub mod scheduler;
pub mod supervisor;
pub mod watcher;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "http-api")]
pub mod http;

pub use error::HostError;

use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use std::path::PathBuf;
use std::sync::Arc;

use catalog::Catalog;
use config::HostConfig;
use recorder::{AlertSink, ExecutionRecorder, LoggingAlertSink};
use scheduler::SchedulerLoop;
use watcher::ConfigWatcher;

/// Everything needed to run the host: the live catalog pointer, the
/// scheduler loop, and the filesystem watcher keeping them in sync.
pub struct Host {
    pub catalog: Arc<ArcSwap<Catalog>>,
    pub scheduler: Arc<SchedulerLoop>,
    _watcher_handle: Option<RecommendedWatcher>,
}

impl Host {
    /// Load configuration from `config_path`, build the initial catalog, and
    /// wire up the scheduler loop and (optionally) a hot-reload watcher.
    ///
    /// A fatal pre-start condition (unreadable config) is the only error
    /// this returns; every subsequent failure is recovered internally.
    pub fn bootstrap(
        config_path: PathBuf,
        alert_sink: Arc<dyn AlertSink>,
        watch_for_changes: bool,
    ) -> Result<Self, HostError> {
        let config = HostConfig::from_file(&config_path)?;
        let (catalog, report) = Catalog::load(&config);
        tracing::info!(
            total = report.total,
            valid_enabled = report.valid_enabled,
            disabled = report.disabled,
            invalid_cron = report.invalid_cron,
            zone_fallbacks = report.zone_fallbacks,
            "initial catalog loaded"
        );
        for issue in &report.issues {
            tracing::warn!(?issue, "job validation issue");
        }

        let catalog = Arc::new(ArcSwap::from_pointee(catalog));
        let recorder = Arc::new(ExecutionRecorder::new(
            alert_sink,
            config.scheduler.slow_run_threshold_ms as i64,
            config.scheduler.consecutive_failure_alert_threshold,
        ));
        let scheduler = SchedulerLoop::new(Arc::clone(&catalog), recorder, config.scheduler.clone());

        let watcher_handle = if watch_for_changes {
            let watcher = ConfigWatcher::new(config_path, Arc::clone(&catalog), Arc::clone(&scheduler));
            match watcher.spawn() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to start config watcher; hot-reload disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Host {
            catalog,
            scheduler,
            _watcher_handle: watcher_handle,
        })
    }

    /// Construct a host with the default (logging-only) alert sink.
    pub fn bootstrap_default(config_path: PathBuf, watch_for_changes: bool) -> Result<Self, HostError> {
        Self::bootstrap(config_path, Arc::new(LoggingAlertSink), watch_for_changes)
    }

    /// Run the scheduler loop until shutdown is requested. Returns once
    /// every in-flight execution has been awaited to quiescence.
    pub async fn run(&self) {
        Arc::clone(&self.scheduler).run().await;
    }

    pub fn request_shutdown(&self) {
        self.scheduler.request_shutdown();
    }
}
