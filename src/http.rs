//! Minimal read-only HTTP surface (`http-api` feature): `/health` mirrors the
//! [`crate::scheduler::HealthSnapshot`] as JSON, `/metrics` exposes the
//! Prometheus text format. The dashboard/API proper is out of scope (§1);
//! this is only the core's two documented interface points.

use axum::{response::IntoResponse, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::scheduler::{HealthSnapshot, SchedulerLoop};

#[derive(Serialize)]
struct HealthSnapshotJson {
    version: String,
    now_utc: String,
    scheduler_healthy: bool,
    last_heartbeat: String,
    seconds_since_heartbeat: i64,
    consecutive_errors: u32,
    poll_interval_seconds: u64,
    job_count: usize,
    recent_event_count: usize,
}

impl From<HealthSnapshot> for HealthSnapshotJson {
    fn from(s: HealthSnapshot) -> Self {
        HealthSnapshotJson {
            version: s.version,
            now_utc: s.now_utc.to_rfc3339(),
            scheduler_healthy: s.scheduler.healthy,
            last_heartbeat: s.scheduler.last_heartbeat.to_rfc3339(),
            seconds_since_heartbeat: s.scheduler.seconds_since_heartbeat,
            consecutive_errors: s.scheduler.consecutive_errors,
            poll_interval_seconds: s.scheduler.poll_interval_seconds,
            job_count: s.schedule.len(),
            recent_event_count: s.recent_events.len(),
        }
    }
}

async fn health(scheduler: axum::extract::State<Arc<SchedulerLoop>>) -> impl IntoResponse {
    let snapshot: HealthSnapshotJson = scheduler.health_snapshot().into();
    axum::Json(snapshot)
}

#[cfg(feature = "metrics")]
async fn metrics_endpoint() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}

/// Build the router. Caller is responsible for binding and serving it.
pub fn router(scheduler: Arc<SchedulerLoop>) -> Router {
    let router = Router::new().route("/health", get(health));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_endpoint));

    router.with_state(scheduler)
}

/// Serve the router until `shutdown` fires, per this codebase's graceful
/// shutdown idiom (a watch channel rather than a signal handler directly).
pub async fn serve(
    addr: std::net::SocketAddr,
    scheduler: Arc<SchedulerLoop>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health/metrics endpoint listening");
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
