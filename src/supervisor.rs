//! The Process Supervisor: spawns a job's shell command, optionally captures
//! its streams, enforces a runtime deadline, and distinguishes a
//! shutdown-cancel from a timeout-kill.

use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::catalog::Job;

#[cfg(unix)]
const SHELL: &str = "/bin/sh";
#[cfg(unix)]
const SHELL_ARG: &str = "-c";
#[cfg(windows)]
const SHELL: &str = "cmd.exe";
#[cfg(windows)]
const SHELL_ARG: &str = "/c";

/// One completed (or skipped) attempt to run a job. Immutable after
/// creation and appended verbatim to the Execution Recorder.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub command_id: String,
    pub command: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub skipped_due_to_conflict: bool,
    pub error: Option<String>,
}

impl ExecutionEvent {
    pub fn duration_ms(&self) -> i64 {
        (self.end_utc - self.start_utc).num_milliseconds().max(0)
    }

    /// Build the event for an attempt that never spawned a process because
    /// its concurrency key was busy (§4.4).
    pub fn skipped(job: &Job, at: DateTime<Utc>) -> Self {
        ExecutionEvent {
            command_id: job.id.clone(),
            command: job.command.clone(),
            start_utc: at,
            end_utc: at,
            exit_code: None,
            success: true,
            skipped_due_to_conflict: true,
            error: None,
        }
    }
}

enum Outcome {
    Normal(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    Timeout,
    Shutdown,
}

/// Run a job's command to completion, racing its `maxRuntime` deadline (if
/// any) and the process-wide shutdown signal. Always returns an
/// [`ExecutionEvent`]; never panics on process-management failures.
pub async fn run(job: &Job, mut shutdown: watch::Receiver<bool>, stderr_implies_failure: bool) -> ExecutionEvent {
    let start_utc = Utc::now();

    let mut command = build_command(&job.command, job.capture_output);
    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            let end_utc = Utc::now();
            tracing::error!(job = %job.id, error = %e, "failed to spawn command");
            return ExecutionEvent {
                command_id: job.id.clone(),
                command: job.command.clone(),
                start_utc,
                end_utc,
                exit_code: None,
                success: false,
                skipped_due_to_conflict: false,
                error: Some(format!("spawn failure: {e}")),
            };
        }
    };

    let stdout_handle = child.stdout.take().map(|s| tokio::spawn(read_all(s)));
    let stderr_handle = child.stderr.take().map(|s| tokio::spawn(read_all(s)));

    let deadline = async {
        match job.max_runtime {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        biased;
        result = child.wait() => match result {
            Ok(status) => Outcome::Normal(status),
            Err(e) => Outcome::WaitFailed(e),
        },
        _ = wait_for_shutdown(&mut shutdown) => Outcome::Shutdown,
        _ = deadline => Outcome::Timeout,
    };

    match outcome {
        Outcome::Normal(status) => {
            let stdout = collect(stdout_handle).await;
            let stderr = collect(stderr_handle).await;
            let end_utc = Utc::now();
            let exit_code = status.code();
            let mut success = status.success();
            let mut error = None;

            if job.capture_output && !stderr.is_empty() {
                if !stdout.is_empty() {
                    tracing::info!(job = %job.id, stdout = %stdout, "job stdout");
                }
                tracing::error!(job = %job.id, stderr = %stderr, "job stderr");
                if stderr_implies_failure {
                    success = false;
                    error = Some("stderr output with captureOutput enabled".to_string());
                }
            } else if job.capture_output && !stdout.is_empty() {
                tracing::info!(job = %job.id, stdout = %stdout, "job stdout");
            }

            if !success && error.is_none() {
                error = Some(format!("exit code {}", exit_code.map_or("none".to_string(), |c| c.to_string())));
            }

            if !success {
                tracing::warn!(job = %job.id, exit_code = ?exit_code, "job failed");
            }

            ExecutionEvent {
                command_id: job.id.clone(),
                command: job.command.clone(),
                start_utc,
                end_utc,
                exit_code,
                success,
                skipped_due_to_conflict: false,
                error,
            }
        }
        Outcome::WaitFailed(e) => {
            let end_utc = Utc::now();
            tracing::error!(job = %job.id, error = %e, "failed waiting on child process");
            ExecutionEvent {
                command_id: job.id.clone(),
                command: job.command.clone(),
                start_utc,
                end_utc,
                exit_code: None,
                success: false,
                skipped_due_to_conflict: false,
                error: Some(format!("wait failure: {e}")),
            }
        }
        Outcome::Timeout => {
            kill_process_tree(&mut child).await;
            let end_utc = Utc::now();
            tracing::warn!(job = %job.id, "job exceeded maxRuntime and was killed");
            ExecutionEvent {
                command_id: job.id.clone(),
                command: job.command.clone(),
                start_utc,
                end_utc,
                exit_code: None,
                success: false,
                skipped_due_to_conflict: false,
                error: Some("timeout".to_string()),
            }
        }
        Outcome::Shutdown => {
            kill_process_tree(&mut child).await;
            let end_utc = Utc::now();
            tracing::info!(job = %job.id, "job terminated for shutdown");
            ExecutionEvent {
                command_id: job.id.clone(),
                command: job.command.clone(),
                start_utc,
                end_utc,
                exit_code: None,
                success: true,
                skipped_due_to_conflict: false,
                error: None,
            }
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(h) => h.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn build_command(command_str: &str, capture_output: bool) -> Command {
    let mut cmd = Command::new(SHELL);
    cmd.arg(SHELL_ARG).arg(command_str);
    cmd.stdin(Stdio::null());
    if capture_output {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    cmd
}

#[cfg(unix)]
async fn kill_process_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as i32, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(Duration::from_secs(3), child.wait())
        .await
        .is_err()
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }
        let _ = child.kill().await;
    }
}

#[cfg(not(unix))]
async fn kill_process_tree(child: &mut Child) {
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Job;
    use crate::cron::CronSchedule;
    use chrono_tz::Tz;
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn test_job(command: &str, max_runtime: Option<Duration>, capture_output: bool) -> Job {
        Job {
            id: "test".to_string(),
            command: command.to_string(),
            cron: CronSchedule::parse("* * * * *").unwrap(),
            zone: Tz::UTC,
            zone_id: "UTC".to_string(),
            enabled: true,
            max_runtime,
            allow_parallel: true,
            concurrency_key: "test".to_string(),
            capture_output,
            quiet_start: false,
            alert_on_fail: true,
            custom_alert_message: None,
            next_run: RwLock::new(None),
        }
    }

    #[tokio::test]
    async fn successful_command_is_recorded_success() {
        let (_tx, rx) = watch::channel(false);
        let job = test_job("exit 0", None, false);
        let event = run(&job, rx, true).await;
        assert!(event.success);
        assert_eq!(event.exit_code, Some(0));
        assert!(!event.skipped_due_to_conflict);
    }

    #[tokio::test]
    async fn nonzero_exit_is_recorded_failure() {
        let (_tx, rx) = watch::channel(false);
        let job = test_job("exit 7", None, false);
        let event = run(&job, rx, true).await;
        assert!(!event.success);
        assert_eq!(event.exit_code, Some(7));
    }

    #[tokio::test]
    async fn captured_stderr_marks_failure_by_default_policy() {
        let (_tx, rx) = watch::channel(false);
        let job = test_job("echo oops 1>&2", None, true);
        let event = run(&job, rx, true).await;
        assert!(!event.success);
        assert_eq!(event.exit_code, Some(0));
    }

    #[tokio::test]
    async fn captured_stderr_is_benign_when_policy_disabled() {
        let (_tx, rx) = watch::channel(false);
        let job = test_job("echo oops 1>&2", None, true);
        let event = run(&job, rx, false).await;
        assert!(event.success);
    }

    #[tokio::test]
    async fn timeout_kills_and_records_failure() {
        let (_tx, rx) = watch::channel(false);
        let job = test_job("sleep 3600", Some(Duration::from_millis(100)), false);
        let start = std::time::Instant::now();
        let event = run(&job, rx, true).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!event.success);
        assert_eq!(event.error.as_deref(), Some("timeout"));
        assert_eq!(event.exit_code, None);
    }

    #[tokio::test]
    async fn shutdown_kills_and_records_non_failing() {
        let (tx, rx) = watch::channel(false);
        let job = Arc::new(test_job("sleep 60", None, false));
        let handle = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { run(&job, rx, true).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let event = handle.await.unwrap();
        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.exit_code, None);
    }
}
