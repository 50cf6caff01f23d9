//! JSON configuration document: schema, loading, and defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

fn default_poll_seconds() -> u64 {
    5
}

fn default_zone() -> String {
    "UTC".to_string()
}

fn default_max_parallelism() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_slow_run_threshold_ms() -> u64 {
    300_000
}

fn default_consecutive_failure_threshold() -> u32 {
    3
}

/// The `Scheduler` section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    #[serde(rename = "pollSeconds", default = "default_poll_seconds")]
    pub poll_seconds: u64,
    #[serde(rename = "defaultTimeZone", default = "default_zone")]
    pub default_time_zone: String,
    #[serde(rename = "maxParallelism", default = "default_max_parallelism")]
    pub max_parallelism: usize,
    #[serde(rename = "stderrImpliesFailure", default = "default_true")]
    pub stderr_implies_failure: bool,
    #[serde(rename = "slowRunThresholdMs", default = "default_slow_run_threshold_ms")]
    pub slow_run_threshold_ms: u64,
    #[serde(
        rename = "consecutiveFailureAlertThreshold",
        default = "default_consecutive_failure_threshold"
    )]
    pub consecutive_failure_alert_threshold: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        SchedulerSection {
            poll_seconds: default_poll_seconds(),
            default_time_zone: default_zone(),
            max_parallelism: default_max_parallelism(),
            stderr_implies_failure: default_true(),
            slow_run_threshold_ms: default_slow_run_threshold_ms(),
            consecutive_failure_alert_threshold: default_consecutive_failure_threshold(),
        }
    }
}

impl SchedulerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds)
    }
}

/// One entry in `ScheduledCommands`, as it appears in the raw config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Option<String>,
    pub command: String,
    pub cron: String,
    pub zone: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "maxRuntime", with = "humantime_serde::option", default)]
    pub max_runtime: Option<Duration>,
    #[serde(rename = "allowParallel", default)]
    pub allow_parallel: bool,
    #[serde(rename = "concurrencyKey")]
    pub concurrency_key: Option<String>,
    #[serde(rename = "captureOutput", default)]
    pub capture_output: bool,
    #[serde(rename = "quietStart", default)]
    pub quiet_start: bool,
    #[serde(rename = "alertOnFail", default = "default_true")]
    pub alert_on_fail: bool,
    #[serde(rename = "customAlertMessage")]
    pub custom_alert_message: Option<String>,
}

/// Opaque passthrough for the `Monitoring` section; the core never interprets
/// it directly, it is consumed only by the external alert-sink wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringSection {
    #[serde(flatten)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    #[serde(rename = "Scheduler")]
    pub scheduler: SchedulerSection,
    #[serde(rename = "ScheduledCommands")]
    pub scheduled_commands: Vec<JobSpec>,
    #[serde(rename = "Monitoring")]
    pub monitoring: Option<MonitoringSection>,
}

impl HostConfig {
    /// Load and parse the configuration document from a file. Does not
    /// validate job entries — that is the Catalog loader's job (§4.3).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation of the ambient scheduler settings. Per-job
    /// validation happens in the catalog loader, which must not fail the
    /// whole load on a single bad job.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.poll_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "Scheduler.pollSeconds must be >= 1".to_string(),
            ));
        }
        if self.scheduler.max_parallelism == 0 {
            return Err(ConfigError::InvalidValue(
                "Scheduler.maxParallelism must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_document() {
        let cfg = HostConfig::from_str("{}").unwrap();
        assert_eq!(cfg.scheduler.poll_seconds, 5);
        assert_eq!(cfg.scheduler.default_time_zone, "UTC");
        assert_eq!(cfg.scheduler.max_parallelism, 1);
        assert!(cfg.scheduled_commands.is_empty());
    }

    #[test]
    fn parses_job_entries() {
        let text = r#"{
            "Scheduler": {"pollSeconds": 10, "maxParallelism": 4},
            "ScheduledCommands": [
                {"command": "echo hi", "cron": "* * * * *"}
            ]
        }"#;
        let cfg = HostConfig::from_str(text).unwrap();
        assert_eq!(cfg.scheduler.poll_seconds, 10);
        assert_eq!(cfg.scheduled_commands.len(), 1);
        assert_eq!(cfg.scheduled_commands[0].command, "echo hi");
        assert!(cfg.scheduled_commands[0].id.is_none());
    }

    #[test]
    fn rejects_zero_poll_seconds() {
        let text = r#"{"Scheduler": {"pollSeconds": 0}}"#;
        assert!(HostConfig::from_str(text).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(HostConfig::from_str("not json").is_err());
    }
}
