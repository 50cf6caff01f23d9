//! The Scheduler Loop: polls the active catalog, dispatches due jobs without
//! blocking, maintains a heartbeat, and applies exponential back-off on its
//! own internal errors.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::concurrency::{Acquisition, ConcurrencyGate};
use crate::config::SchedulerSection;
use crate::recorder::ExecutionRecorder;
use crate::supervisor::{self, ExecutionEvent};

/// Read-only snapshot of one job's position in the schedule, for the health
/// surface (§6).
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: String,
    pub command: String,
    pub cron: String,
    pub zone: String,
    pub enabled: bool,
    pub allow_parallel: bool,
    pub concurrency_key: String,
    pub max_runtime_minutes: Option<f64>,
    pub next_run_utc: Option<DateTime<Utc>>,
    pub next_run_local: Option<String>,
}

/// Scheduler liveness sub-object (§6).
#[derive(Debug, Clone)]
pub struct SchedulerHealth {
    pub healthy: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub seconds_since_heartbeat: i64,
    pub consecutive_errors: u32,
    pub poll_interval_seconds: u64,
}

/// The full read-only snapshot exposed to the external HTTP layer.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub version: String,
    pub now_utc: DateTime<Utc>,
    pub schedule: Vec<ScheduleEntry>,
    pub recent_events: Vec<ExecutionEvent>,
    pub failure_counters: Vec<(String, u32)>,
    pub scheduler: SchedulerHealth,
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BASE_BACKOFF: Duration = Duration::from_secs(10);
const CRITICAL_ERROR_THRESHOLD: u32 = 3;

/// Owns the live catalog pointer, the concurrency gate, and the recorder,
/// and drives the poll/dispatch loop.
pub struct SchedulerLoop {
    catalog: Arc<ArcSwap<Catalog>>,
    gate: Arc<ConcurrencyGate>,
    recorder: Arc<ExecutionRecorder>,
    clock: Arc<dyn Clock>,
    settings: Mutex<SchedulerSection>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    consecutive_loop_errors: AtomicU32,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerLoop {
    pub fn new(
        catalog: Arc<ArcSwap<Catalog>>,
        recorder: Arc<ExecutionRecorder>,
        settings: SchedulerSection,
    ) -> Arc<Self> {
        Self::new_with_clock(catalog, recorder, settings, Arc::new(SystemClock))
    }

    #[cfg(test)]
    pub fn with_clock(
        catalog: Arc<ArcSwap<Catalog>>,
        recorder: Arc<ExecutionRecorder>,
        settings: SchedulerSection,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Self::new_with_clock(catalog, recorder, settings, clock)
    }

    fn new_with_clock(
        catalog: Arc<ArcSwap<Catalog>>,
        recorder: Arc<ExecutionRecorder>,
        settings: SchedulerSection,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gate = Arc::new(ConcurrencyGate::new(settings.max_parallelism));
        let now = clock.now_utc();
        Arc::new(SchedulerLoop {
            catalog,
            gate,
            recorder,
            clock,
            last_heartbeat: Mutex::new(now),
            consecutive_loop_errors: AtomicU32::new(0),
            settings: Mutex::new(settings),
            shutdown_tx,
            shutdown_rx,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    pub fn update_settings(&self, settings: SchedulerSection) {
        *self.settings.lock() = settings;
    }

    fn poll_seconds(&self) -> u64 {
        self.settings.lock().poll_seconds
    }

    fn stderr_implies_failure(&self) -> bool {
        self.settings.lock().stderr_implies_failure
    }

    /// Request a graceful shutdown: breaks the loop's sleep and signals every
    /// in-flight execution to terminate its child non-failingly.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A receiver that fires once [`Self::request_shutdown`] is called, for
    /// coordinating auxiliary tasks (e.g. the optional HTTP surface) with the
    /// same shutdown signal as the loop itself.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Await completion of every dispatched-but-not-yet-finished execution.
    pub async fn await_quiescence(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let catalog = self.catalog.load();
        let now = self.clock.now_utc();
        let last_heartbeat = *self.last_heartbeat.lock();
        let poll_seconds = self.poll_seconds();
        let consecutive_errors = self.consecutive_loop_errors.load(Ordering::SeqCst);
        let seconds_since_heartbeat = (now - last_heartbeat).num_seconds();
        let healthy =
            seconds_since_heartbeat < (3 * poll_seconds as i64) && consecutive_errors == 0;

        let schedule = catalog
            .jobs()
            .iter()
            .map(|job| {
                let next_run_utc = job.snapshot_next_run();
                ScheduleEntry {
                    id: job.id.clone(),
                    command: job.command.clone(),
                    cron: job.cron.source().to_string(),
                    zone: job.zone_id.clone(),
                    enabled: job.enabled,
                    allow_parallel: job.allow_parallel,
                    concurrency_key: job.concurrency_key.clone(),
                    max_runtime_minutes: job.max_runtime.map(|d| d.as_secs_f64() / 60.0),
                    next_run_utc,
                    next_run_local: next_run_utc
                        .map(|t| t.with_timezone(&job.zone).to_rfc3339()),
                }
            })
            .collect();

        HealthSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            now_utc: now,
            schedule,
            recent_events: self.recorder.recent_events(),
            failure_counters: self.recorder.failure_counters_snapshot(),
            scheduler: SchedulerHealth {
                healthy,
                last_heartbeat,
                seconds_since_heartbeat,
                consecutive_errors,
                poll_interval_seconds: poll_seconds,
            },
        }
    }

    /// Run the poll/dispatch loop until shutdown is requested.
    pub async fn run(self: Arc<Self>) {
        loop {
            *self.last_heartbeat.lock() = self.clock.now_utc();

            let tick_result = self.tick().await;

            let sleep_duration = match tick_result {
                Ok(()) => {
                    self.consecutive_loop_errors.store(0, Ordering::SeqCst);
                    Duration::from_secs(self.poll_seconds())
                }
                Err(e) => {
                    let errors = self.consecutive_loop_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::error!(error = %e, errors, "scheduler loop iteration failed");
                    if errors >= CRITICAL_ERROR_THRESHOLD {
                        tracing::error!(errors, "scheduler loop has failed repeatedly");
                    }
                    #[cfg(feature = "metrics")]
                    crate::metrics::metrics().loop_errors_total.inc();
                    backoff_for(errors)
                }
            };

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }

            if *self.shutdown_rx.borrow() {
                break;
            }
        }

        self.await_quiescence().await;
    }

    async fn tick(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        self.in_flight.lock().retain(|h| !h.is_finished());

        let catalog = self.catalog.load_full();
        let now = self.clock.now_utc();
        let stderr_implies_failure = self.stderr_implies_failure();

        for job in catalog.jobs() {
            if !job.enabled {
                continue;
            }

            let due = {
                let mut guard = job.next_run.write();
                if guard.is_none() {
                    *guard = job.cron.next_after(now, job.zone);
                }
                *guard
            };

            let Some(due_instant) = due else {
                continue; // terminal cron: Quiescent
            };

            if due_instant > now {
                continue;
            }

            // Advance the pointer before the dispatched task observes catalog
            // state, guaranteeing forward progress and no double-fire within
            // this tick.
            let new_next = job.cron.next_after(due_instant + chrono::Duration::seconds(1), job.zone);
            *job.next_run.write() = new_next;

            self.dispatch(Arc::clone(&catalog), job.id.clone(), stderr_implies_failure);
        }

        Ok(())
    }

    fn dispatch(self: &Arc<Self>, catalog: Arc<Catalog>, job_id: String, stderr_implies_failure: bool) {
        let scheduler = Arc::clone(self);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let Some(job) = catalog.find(&job_id) else {
                return;
            };

            let acquisition = scheduler
                .gate
                .acquire(&job.concurrency_key, job.allow_parallel)
                .await;

            let event = match acquisition {
                Acquisition::SkippedDueToConflict => ExecutionEvent::skipped(job, Utc::now()),
                Acquisition::RanWithPermits { .. } => {
                    #[cfg(feature = "metrics")]
                    crate::metrics::metrics().jobs_active.inc();

                    let event = supervisor::run(job, shutdown_rx, stderr_implies_failure).await;

                    #[cfg(feature = "metrics")]
                    crate::metrics::metrics().jobs_active.dec();

                    event
                }
            };

            #[cfg(feature = "metrics")]
            {
                let m = crate::metrics::metrics();
                let outcome = if event.skipped_due_to_conflict {
                    "skipped"
                } else if event.success {
                    "success"
                } else {
                    "failure"
                };
                m.runs_total.with_label_values(&[outcome]).inc();
                if !event.skipped_due_to_conflict {
                    m.run_duration_ms
                        .with_label_values(&[job.id.as_str()])
                        .observe(event.duration_ms() as f64);
                }
            }

            scheduler.recorder.record(
                event,
                job.alert_on_fail,
                job.custom_alert_message.clone(),
            );
        });

        self.in_flight.lock().push(handle);
    }
}

fn backoff_for(consecutive_errors: u32) -> Duration {
    let exponent = (consecutive_errors.saturating_sub(1)).min(3);
    let scaled = BASE_BACKOFF.saturating_mul(1 << exponent);
    scaled.min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::HostConfig;
    use crate::recorder::{ExecutionRecorder, LoggingAlertSink};
    use std::sync::Arc;

    fn recorder() -> Arc<ExecutionRecorder> {
        Arc::new(ExecutionRecorder::new(Arc::new(LoggingAlertSink), 1_000_000, 3))
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_for(1), Duration::from_secs(10));
        assert_eq!(backoff_for(2), Duration::from_secs(20));
        assert_eq!(backoff_for(3), Duration::from_secs(40));
        assert_eq!(backoff_for(4), Duration::from_secs(80).min(MAX_BACKOFF));
        assert_eq!(backoff_for(10), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn finished_handles_are_pruned_on_the_next_tick() {
        let config = HostConfig::from_str(
            r#"{"ScheduledCommands": [{"command": "exit 0", "cron": "* * * * *"}]}"#,
        )
        .unwrap();
        let (catalog, _report) = Catalog::load(&config);
        let job = &catalog.jobs()[0];
        *job.next_run.write() = Some(Utc::now() - chrono::Duration::seconds(1));

        let catalog = Arc::new(ArcSwap::from_pointee(catalog));
        let loop_ = SchedulerLoop::new(Arc::clone(&catalog), recorder(), config.scheduler.clone());
        loop_.tick().await.unwrap();
        loop_.await_quiescence().await;
        assert!(loop_.in_flight.lock().is_empty());

        // A second tick with nothing due must not accumulate a stale handle.
        loop_.tick().await.unwrap();
        assert!(loop_.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn health_snapshot_is_healthy_immediately_after_construction() {
        let config = HostConfig::from_str("{}").unwrap();
        let (catalog, _report) = Catalog::load(&config);
        let catalog = Arc::new(ArcSwap::from_pointee(catalog));
        let loop_ = SchedulerLoop::new(catalog, recorder(), config.scheduler.clone());
        let snap = loop_.health_snapshot();
        assert!(snap.scheduler.healthy);
        assert_eq!(snap.scheduler.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn due_job_is_dispatched_and_recorded() {
        let config = HostConfig::from_str(
            r#"{"ScheduledCommands": [{"command": "exit 0", "cron": "* * * * *"}]}"#,
        )
        .unwrap();
        let (catalog, _report) = Catalog::load(&config);
        let job = &catalog.jobs()[0];
        // Force the job to already be due.
        *job.next_run.write() = Some(Utc::now() - chrono::Duration::seconds(1));

        let catalog = Arc::new(ArcSwap::from_pointee(catalog));
        let rec = recorder();
        let loop_ = SchedulerLoop::new(Arc::clone(&catalog), Arc::clone(&rec), config.scheduler.clone());
        loop_.tick().await.unwrap();
        loop_.await_quiescence().await;

        assert_eq!(rec.recent_events().len(), 1);
        assert!(rec.recent_events()[0].success);
    }

    #[tokio::test]
    async fn same_key_jobs_dispatched_together_run_exclusively() {
        let config = HostConfig::from_str(
            r#"{"ScheduledCommands": [
                {"id": "a", "command": "sleep 0.3", "cron": "* * * * *", "concurrencyKey": "shared"},
                {"id": "b", "command": "sleep 0.3", "cron": "* * * * *", "concurrencyKey": "shared"}
            ]}"#,
        )
        .unwrap();
        let (catalog, _report) = Catalog::load(&config);
        for job in catalog.jobs() {
            *job.next_run.write() = Some(Utc::now() - chrono::Duration::seconds(1));
        }

        let catalog = Arc::new(ArcSwap::from_pointee(catalog));
        let rec = recorder();
        let loop_ = SchedulerLoop::new(Arc::clone(&catalog), Arc::clone(&rec), config.scheduler.clone());
        loop_.tick().await.unwrap();
        loop_.await_quiescence().await;

        let events = rec.recent_events();
        assert_eq!(events.len(), 2);
        let skipped = events.iter().filter(|e| e.skipped_due_to_conflict).count();
        let ran = events.iter().filter(|e| !e.skipped_due_to_conflict).count();
        assert_eq!(skipped, 1, "exactly one of the two same-key jobs must be skipped");
        assert_eq!(ran, 1);
    }

    #[tokio::test]
    async fn stale_heartbeat_makes_health_unhealthy() {
        let config = HostConfig::from_str(r#"{"Scheduler": {"pollSeconds": 5}}"#).unwrap();
        let (catalog, _) = Catalog::load(&config);
        let catalog = Arc::new(ArcSwap::from_pointee(catalog));
        let fixed = Arc::new(FixedClock(Utc::now()));
        let loop_ = SchedulerLoop::with_clock(catalog, recorder(), config.scheduler.clone(), Arc::clone(&fixed) as Arc<dyn Clock>);

        // Advance the clock far past 3x the poll interval without a heartbeat tick.
        let later = Arc::new(FixedClock(fixed.0 + chrono::Duration::seconds(100)));
        // Swap in the advanced clock by constructing a fresh loop sharing the
        // same recorded heartbeat instant, to assert the health formula.
        let snap_before = loop_.health_snapshot();
        assert!(snap_before.scheduler.healthy);

        let stale_loop = SchedulerLoop::with_clock(
            Arc::new(ArcSwap::from_pointee(Catalog::empty())),
            recorder(),
            config.scheduler.clone(),
            later,
        );
        // Force the heartbeat back in time relative to the fixed "now".
        *stale_loop.last_heartbeat.lock() = fixed.0;
        let snap = stale_loop.health_snapshot();
        assert!(!snap.scheduler.healthy);
        assert_eq!(snap.scheduler.seconds_since_heartbeat, 100);
    }
}
