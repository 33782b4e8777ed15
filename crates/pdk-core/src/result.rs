//! Step and job results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of one step execution.
///
/// Exit code `0` is success; `-1` marks a failure before the command ever
/// ran (missing input, tool not found, cancellation); anything else is the
/// child's actual exit code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Exit code used for failures that happen before execution.
pub const PRE_EXEC_FAILURE: i32 = -1;

impl StepResult {
    /// A successful result with captured output.
    pub fn success(
        step_name: impl Into<String>,
        exit_code: i32,
        stdout: String,
        stderr: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finished(step_name, true, exit_code, stdout, stderr, started_at)
    }

    /// A failed result carrying the child's exit code and output.
    pub fn failure(
        step_name: impl Into<String>,
        exit_code: i32,
        stdout: String,
        stderr: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finished(step_name, false, exit_code, stdout, stderr, started_at)
    }

    /// A failure that happened before the command ran. The error text
    /// lands in stderr so it reaches every sink the same way child
    /// output does.
    pub fn pre_exec_failure(step_name: impl Into<String>, error: impl std::fmt::Display) -> Self {
        let now = Utc::now();
        Self {
            step_name: step_name.into(),
            success: false,
            exit_code: PRE_EXEC_FAILURE,
            stdout: String::new(),
            stderr: error.to_string(),
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
        }
    }

    /// A synthetic successful result for a filtered-out step.
    pub fn skipped(step_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_name: step_name.into(),
            success: true,
            exit_code: 0,
            stdout: format!("skipped: {}", reason.into()),
            stderr: String::new(),
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
        }
    }

    fn finished(
        step_name: impl Into<String>,
        success: bool,
        exit_code: i32,
        stdout: String,
        stderr: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration = (finished_at - started_at).to_std().unwrap_or(Duration::ZERO);
        Self {
            step_name: step_name.into(),
            success,
            exit_code,
            stdout,
            stderr,
            started_at,
            finished_at,
            duration,
        }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_name: String,
    /// True iff every step succeeded or had continue-on-error.
    pub success: bool,
    pub steps: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl JobResult {
    pub fn new(
        job_name: impl Into<String>,
        success: bool,
        steps: Vec<StepResult>,
        started_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration = (finished_at - started_at).to_std().unwrap_or(Duration::ZERO);
        Self {
            job_name: job_name.into(),
            success,
            steps,
            started_at,
            finished_at,
            duration,
            error,
        }
    }
}

/// Outcome of a whole pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline_name: String,
    pub success: bool,
    pub jobs: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl PipelineResult {
    pub fn new(
        pipeline_name: impl Into<String>,
        jobs: Vec<JobResult>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let success = jobs.iter().all(|j| j.success);
        let finished_at = Utc::now();
        let duration = (finished_at - started_at).to_std().unwrap_or(Duration::ZERO);
        Self {
            pipeline_name: pipeline_name.into(),
            success,
            jobs,
            started_at,
            finished_at,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_exec_failure_uses_sentinel_exit_code() {
        let result = StepResult::pre_exec_failure("compile", "missing input 'command'");
        assert!(!result.success);
        assert_eq!(result.exit_code, PRE_EXEC_FAILURE);
        assert!(result.stderr.contains("missing input"));
    }

    #[test]
    fn skipped_steps_report_success_with_reason() {
        let result = StepResult::skipped("deploy", "filtered out by --step");
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("filtered out"));
    }

    #[test]
    fn duration_matches_timestamps() {
        let started = Utc::now();
        let result = StepResult::success("s", 0, String::new(), String::new(), started);
        let span = (result.finished_at - result.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let diff = span.abs_diff(result.duration);
        assert!(diff < Duration::from_millis(10));
    }

    #[test]
    fn empty_pipeline_succeeds() {
        let result = PipelineResult::new("empty", vec![], Utc::now());
        assert!(result.success);
        assert!(result.jobs.is_empty());
    }
}
