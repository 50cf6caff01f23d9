//! Optional Prometheus metrics surface (`metrics` feature).
//!
//! Ambient observability kept thin per the out-of-scope HTTP/dashboard
//! boundary (§1): this crate only exposes the gauges/counters/histograms a
//! scrape-based exporter needs, not a dashboard.

use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

pub struct Metrics {
    pub registry: Registry,
    pub runs_total: IntCounterVec,
    pub jobs_active: IntGauge,
    pub run_duration_ms: HistogramVec,
    pub loop_errors_total: prometheus::IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();

        let runs_total = IntCounterVec::new(
            prometheus::Opts::new("cronhost_runs_total", "Total job executions by outcome"),
            &["outcome"],
        )
        .expect("valid metric");
        let jobs_active = IntGauge::new(
            "cronhost_jobs_active",
            "Number of executions currently in flight",
        )
        .expect("valid metric");
        let run_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "cronhost_run_duration_ms",
                "Execution duration in milliseconds",
            ),
            &["job_id"],
        )
        .expect("valid metric");
        let loop_errors_total = prometheus::IntCounter::new(
            "cronhost_loop_errors_total",
            "Total unexpected scheduler loop errors",
        )
        .expect("valid metric");

        registry
            .register(Box::new(runs_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(jobs_active.clone()))
            .expect("register metric");
        registry
            .register(Box::new(run_duration_ms.clone()))
            .expect("register metric");
        registry
            .register(Box::new(loop_errors_total.clone()))
            .expect("register metric");

        Metrics {
            registry,
            runs_total,
            jobs_active,
            run_duration_ms,
            loop_errors_total,
        }
    })
}

/// Render the current metric set in the Prometheus text exposition format.
pub fn render() -> String {
    let m = metrics();
    let families = m.registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buf)
        .expect("encode metrics");
    String::from_utf8(buf).expect("metrics are valid utf8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremented_counters_show_up_in_the_rendered_text() {
        let m = metrics();
        m.runs_total.with_label_values(&["success"]).inc();
        m.loop_errors_total.inc();
        let rendered = render();
        assert!(rendered.contains("cronhost_runs_total"));
        assert!(rendered.contains("cronhost_loop_errors_total"));
    }
}
