//! The Job Catalog: validated, immutable snapshots of the schedulable set.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::resolve_zone;
use crate::config::{HostConfig, JobSpec};
use crate::cron::CronSchedule;

/// A single schedulable job, normalized and validated for inclusion in a
/// [`Catalog`]. Immutable for the lifetime of the catalog that owns it.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub cron: CronSchedule,
    pub zone: Tz,
    pub zone_id: String,
    pub enabled: bool,
    pub max_runtime: Option<Duration>,
    pub allow_parallel: bool,
    pub concurrency_key: String,
    pub capture_output: bool,
    pub quiet_start: bool,
    pub alert_on_fail: bool,
    pub custom_alert_message: Option<String>,
    /// Most recently computed next-run instant, seeded at load time and
    /// subsequently owned and advanced by the scheduler loop.
    pub next_run: RwLock<Option<DateTime<Utc>>>,
}

impl Job {
    pub fn snapshot_next_run(&self) -> Option<DateTime<Utc>> {
        *self.next_run.read()
    }
}

/// Why a given job entry did not make it into the active (validEnabled) set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobIssue {
    InvalidCron { id: String, reason: String },
    ZoneFallback { id: String, requested: String },
    Disabled { id: String },
}

/// Per-load validation summary, produced alongside every [`Catalog`].
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub total: usize,
    pub valid_enabled: usize,
    pub disabled: usize,
    pub invalid_cron: usize,
    pub zone_fallbacks: usize,
    pub issues: Vec<JobIssue>,
    /// Set when the input was non-empty but produced zero runnable jobs.
    pub warning_no_active_jobs: bool,
}

/// An immutable, atomically-swappable snapshot of the schedulable set.
#[derive(Debug, Clone)]
pub struct Catalog {
    jobs: Arc<Vec<Job>>,
}

impl Catalog {
    pub fn empty() -> Self {
        Catalog {
            jobs: Arc::new(Vec::new()),
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn find(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Build a validated catalog from a configuration document. Never fails
    /// on a single bad job entry — those are classified `invalid` and
    /// excluded, recorded in the returned [`ValidationReport`].
    pub fn load(config: &HostConfig) -> (Catalog, ValidationReport) {
        let mut report = ValidationReport::default();
        let mut jobs = Vec::with_capacity(config.scheduled_commands.len());
        let mut seen_ids: HashSet<String> = HashSet::new();

        report.total = config.scheduled_commands.len();

        for spec in &config.scheduled_commands {
            let id = normalize_id(spec, &mut seen_ids);

            let zone_id = spec
                .zone
                .clone()
                .unwrap_or_else(|| config.scheduler.default_time_zone.clone());
            let resolution = resolve_zone(&zone_id);
            if resolution.fell_back_to_utc {
                report.zone_fallbacks += 1;
                report.issues.push(JobIssue::ZoneFallback {
                    id: id.clone(),
                    requested: zone_id.clone(),
                });
            }

            let cron = match CronSchedule::parse(&spec.cron) {
                Ok(c) => c,
                Err(e) => {
                    report.invalid_cron += 1;
                    report.issues.push(JobIssue::InvalidCron {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !spec.enabled {
                report.disabled += 1;
                report.issues.push(JobIssue::Disabled { id: id.clone() });
            } else {
                report.valid_enabled += 1;
            }

            let concurrency_key = spec.concurrency_key.clone().unwrap_or_else(|| id.clone());

            jobs.push(Job {
                id,
                command: spec.command.clone(),
                cron,
                zone: resolution.zone,
                zone_id,
                enabled: spec.enabled,
                max_runtime: spec.max_runtime,
                allow_parallel: spec.allow_parallel,
                concurrency_key,
                capture_output: spec.capture_output,
                quiet_start: spec.quiet_start,
                alert_on_fail: spec.alert_on_fail,
                custom_alert_message: spec.custom_alert_message.clone(),
                next_run: RwLock::new(None),
            });
        }

        if report.total > 0 && report.valid_enabled == 0 {
            report.warning_no_active_jobs = true;
        }

        (
            Catalog {
                jobs: Arc::new(jobs),
            },
            report,
        )
    }
}

/// Assigns a unique id to a job entry: the configured `id`, or `command` if
/// absent, disambiguated with a numeric suffix on collision so a catalog
/// never silently drops a duplicate entry.
fn normalize_id(spec: &JobSpec, seen: &mut HashSet<String>) -> String {
    let base = spec
        .id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| spec.command.clone());

    if seen.insert(base.clone()) {
        return base;
    }

    let mut n = 2;
    loop {
        let candidate = format!("{base}#{n}");
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    fn cfg(json: &str) -> HostConfig {
        HostConfig::from_str(json).unwrap()
    }

    #[test]
    fn classifies_valid_enabled_disabled_invalid() {
        let config = cfg(
            r#"{"ScheduledCommands": [
                {"command": "a", "cron": "* * * * *", "enabled": true},
                {"command": "b", "cron": "* * * * *", "enabled": false},
                {"command": "c", "cron": "bogus", "enabled": true}
            ]}"#,
        );
        let (catalog, report) = Catalog::load(&config);
        assert_eq!(report.total, 3);
        assert_eq!(report.valid_enabled, 1);
        assert_eq!(report.disabled, 1);
        assert_eq!(report.invalid_cron, 1);
        assert_eq!(catalog.jobs().len(), 2); // invalid job excluded entirely
    }

    #[test]
    fn defaults_id_from_command_and_zone_from_scheduler() {
        let config = cfg(
            r#"{"Scheduler": {"defaultTimeZone": "Asia/Tokyo"},
                "ScheduledCommands": [{"command": "echo hi", "cron": "* * * * *"}]}"#,
        );
        let (catalog, _report) = Catalog::load(&config);
        let job = &catalog.jobs()[0];
        assert_eq!(job.id, "echo hi");
        assert_eq!(job.zone_id, "Asia/Tokyo");
        assert_eq!(job.concurrency_key, "echo hi");
    }

    #[test]
    fn zero_valid_enabled_on_nonempty_input_is_a_warning_not_a_failure() {
        let config = cfg(
            r#"{"ScheduledCommands": [{"command": "a", "cron": "* * * * *", "enabled": false}]}"#,
        );
        let (_catalog, report) = Catalog::load(&config);
        assert!(report.warning_no_active_jobs);
    }

    #[test]
    fn unknown_zone_falls_back_and_is_recorded() {
        let config = cfg(
            r#"{"ScheduledCommands": [{"command": "a", "cron": "* * * * *", "zone": "Not/AZone"}]}"#,
        );
        let (catalog, report) = Catalog::load(&config);
        assert_eq!(report.zone_fallbacks, 1);
        assert_eq!(catalog.jobs()[0].zone, Tz::UTC);
    }
}
