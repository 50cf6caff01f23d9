//! The Execution Recorder: a bounded ring buffer of execution events, per-job
//! consecutive-failure counters, and fire-and-forget alert dispatch.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::supervisor::ExecutionEvent;

/// Cap on the in-memory recent-events buffer (§3 RecentBuffer).
pub const RING_BUFFER_CAPACITY: usize = 5_000;

/// One of the three alert kinds the Recorder can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertType {
    Failure,
    ConsecutiveFailures(u32),
    SlowRun,
}

impl AlertType {
    fn token(&self) -> String {
        match self {
            AlertType::Failure => "Failure".to_string(),
            AlertType::ConsecutiveFailures(n) => format!("Consecutive failures ({n})"),
            AlertType::SlowRun => "Slow run".to_string(),
        }
    }
}

/// Consumed by the Recorder to deliver alerts. Must not block and must not
/// propagate errors back into the caller — failures are swallowed
/// internally (`AlertSinkError`, §7).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// An [`AlertSink`] that just logs — the default when no external transport
/// is configured.
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn notify(&self, subject: &str, body: &str) {
        tracing::warn!(%subject, %body, "alert");
    }
}

/// Fans a single `notify` call out to a fixed list of sinks. Ground truth for
/// the "dynamic-dispatch notifier chain -> tagged sink function value"
/// redesign: composition here is a plain wrapper, not an extensible registry.
pub struct FanOutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanOutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        FanOutAlertSink { sinks }
    }
}

#[async_trait]
impl AlertSink for FanOutAlertSink {
    async fn notify(&self, subject: &str, body: &str) {
        for sink in &self.sinks {
            sink.notify(subject, body).await;
        }
    }
}

/// Token-substitution context for alert templates (§6).
pub struct AlertContext<'a> {
    pub alert_type: AlertType,
    pub event: &'a ExecutionEvent,
    pub consecutive_failures: u32,
    pub custom_message: Option<&'a str>,
}

fn substitute(template: &str, ctx: &AlertContext<'_>) -> String {
    template
        .replace("${AlertType}", &ctx.alert_type.token())
        .replace("${CommandId}", &ctx.event.command_id)
        .replace("${Command}", &ctx.event.command)
        .replace("${StartUtc}", &ctx.event.start_utc.to_rfc3339())
        .replace("${EndUtc}", &ctx.event.end_utc.to_rfc3339())
        .replace(
            "${ExitCode}",
            &ctx.event
                .exit_code
                .map_or("none".to_string(), |c| c.to_string()),
        )
        .replace("${DurationMs}", &ctx.event.duration_ms().to_string())
        .replace("${Error}", ctx.event.error.as_deref().unwrap_or(""))
        .replace(
            "${ConsecutiveFailures}",
            &ctx.consecutive_failures.to_string(),
        )
        .replace("${CustomMessage}", ctx.custom_message.unwrap_or(""))
}

const DEFAULT_SUBJECT_TEMPLATE: &str = "[${AlertType}] ${CommandId}";
const DEFAULT_BODY_TEMPLATE: &str =
    "Command: ${Command}\nStart: ${StartUtc}\nEnd: ${EndUtc}\nExit code: ${ExitCode}\nError: ${Error}\n${CustomMessage}";

/// Appends execution events to a bounded ring buffer, tracks per-job
/// consecutive-failure counts, and fires alerts through an injected sink.
pub struct ExecutionRecorder {
    buffer: Mutex<VecDeque<ExecutionEvent>>,
    failure_counters: DashMap<String, u32>,
    sink: Arc<dyn AlertSink>,
    slow_run_threshold_ms: i64,
    consecutive_failure_alert_threshold: u32,
}

impl ExecutionRecorder {
    pub fn new(
        sink: Arc<dyn AlertSink>,
        slow_run_threshold_ms: i64,
        consecutive_failure_alert_threshold: u32,
    ) -> Self {
        ExecutionRecorder {
            buffer: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            failure_counters: DashMap::new(),
            sink,
            slow_run_threshold_ms,
            consecutive_failure_alert_threshold,
        }
    }

    /// Record one execution. Never blocks the caller on alert delivery.
    pub fn record(&self, event: ExecutionEvent, alert_on_fail: bool, custom_message: Option<String>) {
        self.push(event.clone());

        if event.skipped_due_to_conflict {
            return;
        }

        if event.success {
            self.failure_counters.remove(&event.command_id);
            if event.duration_ms() >= self.slow_run_threshold_ms {
                self.fire_alert(AlertType::SlowRun, &event, 0, custom_message.as_deref());
            }
            return;
        }

        let n = {
            let mut counter = self.failure_counters.entry(event.command_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        if alert_on_fail {
            self.fire_alert(AlertType::Failure, &event, n, custom_message.as_deref());
        }
        if n == self.consecutive_failure_alert_threshold {
            self.fire_alert(
                AlertType::ConsecutiveFailures(n),
                &event,
                n,
                custom_message.as_deref(),
            );
        }
    }

    fn push(&self, event: ExecutionEvent) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= RING_BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    fn fire_alert(
        &self,
        alert_type: AlertType,
        event: &ExecutionEvent,
        consecutive_failures: u32,
        custom_message: Option<&str>,
    ) {
        let ctx = AlertContext {
            alert_type,
            event,
            consecutive_failures,
            custom_message,
        };
        let subject = substitute(DEFAULT_SUBJECT_TEMPLATE, &ctx);
        let body = substitute(DEFAULT_BODY_TEMPLATE, &ctx);
        let sink = Arc::clone(&self.sink);
        // Fire-and-forget: the recorder does not await delivery.
        tokio::spawn(async move {
            sink.notify(&subject, &body).await;
        });
    }

    /// Newest-first snapshot of the recent-events buffer.
    pub fn recent_events(&self) -> Vec<ExecutionEvent> {
        self.buffer.lock().iter().rev().cloned().collect()
    }

    pub fn failure_count(&self, job_id: &str) -> u32 {
        self.failure_counters.get(job_id).map(|v| *v).unwrap_or(0)
    }

    pub fn failure_counters_snapshot(&self) -> Vec<(String, u32)> {
        self.failure_counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
