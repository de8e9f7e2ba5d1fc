//! # Job Execution State Machine
//!
//! ## State Diagram
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌────────┐  in_progress   ┌─────────────┐  succeeded  ┌───────────┐  │
//! │   │ QUEUED │───────────────►│ IN_PROGRESS │────────────►│ SUCCEEDED │  │
//! │   └───┬────┘                └──┬───────▲──┘             └───────────┘  │
//! │       │                        │       │ in_progress    ┌───────────┐  │
//! │       │ succeeded/failed/      │       └────────────────│  FAILED   │  │
//! │       │ rejected               │ failed ───────────────►└───────────┘  │
//! │       └────────────────────────┤ rejected ─────────────►┌───────────┐  │
//! │                                │                        │ REJECTED  │  │
//! │                                │                        └───────────┘  │
//! │   server cancellation from any non-terminal state ─────►┌───────────┐  │
//! │                                                         │ CANCELED  │  │
//! │                                                         └───────────┘  │
//! │                                                                         │
//! │   Terminal states never change again from the device side.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Confirmed vs Requested
//!
//! A device-side transition is two steps. `begin_transition` validates the
//! move against the most recently *requested* status and records it with its
//! token; `confirm` commits it when the service accepts; `abandon` drops it on
//! rejection or timeout. Validating against the requested status is what makes
//! a second `succeeded()` fail immediately, before the first one is answered.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Job Status
// =============================================================================

/// Execution status as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
    Rejected,
    Removed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::TimedOut => "TIMED_OUT",
            JobStatus::Rejected => "REJECTED",
            JobStatus::Removed => "REMOVED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    /// Only `Queued` and `InProgress` can still change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }

    /// Whether the device may request a move from `self` to `to`.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (
                JobStatus::Queued | JobStatus::InProgress,
                JobStatus::InProgress | JobStatus::Succeeded | JobStatus::Failed | JobStatus::Rejected
            )
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Job Execution
// =============================================================================

/// One execution of a job on one thing.
#[derive(Debug, Clone, PartialEq)]
pub struct JobExecution {
    thing_name: String,
    job_id: String,
    document: Value,
    status: JobStatus,
    requested: Vec<(String, JobStatus)>,
    version_number: Option<u64>,
    execution_number: Option<u64>,
}

impl JobExecution {
    pub fn new(
        thing_name: impl Into<String>,
        job_id: impl Into<String>,
        status: JobStatus,
        document: Value,
    ) -> Self {
        JobExecution {
            thing_name: thing_name.into(),
            job_id: job_id.into(),
            document,
            status,
            requested: Vec::new(),
            version_number: None,
            execution_number: None,
        }
    }

    pub fn with_numbers(mut self, version_number: Option<u64>, execution_number: Option<u64>) -> Self {
        self.version_number = version_number;
        self.execution_number = execution_number;
        self
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The `operation` field of the job document, used to route jobs to
    /// handlers.
    pub fn operation(&self) -> Option<&str> {
        self.document.get("operation").and_then(Value::as_str)
    }

    /// Last status confirmed by the service.
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Most recently requested status, or the confirmed one when nothing is
    /// in flight.
    pub fn effective_status(&self) -> JobStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.requested
            .last()
            .map(|(_, status)| *status)
            .unwrap_or(self.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Version the next update should carry as `expectedVersion`.
    pub fn expected_version(&self) -> Option<u64> {
        self.version_number
    }

    pub fn execution_number(&self) -> Option<u64> {
        self.execution_number
    }

    pub fn pending_tokens(&self) -> impl Iterator<Item = &str> {
        self.requested.iter().map(|(token, _)| token.as_str())
    }

    // -------------------------------------------------------------------------
    // Device-initiated transitions
    // -------------------------------------------------------------------------

    /// Validates and records a requested move to `to` under `token`.
    ///
    /// Leaves the execution unchanged on error.
    pub fn begin_transition(&mut self, token: impl Into<String>, to: JobStatus) -> CoreResult<()> {
        let from = self.effective_status();
        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                job_id: self.job_id.clone(),
                from,
                to,
            });
        }
        self.requested.push((token.into(), to));
        Ok(())
    }

    /// Commits the transition recorded under `token`.
    ///
    /// Returns the new confirmed status, or `None` for an unknown token.
    pub fn confirm(&mut self, token: &str, version_number: Option<u64>) -> Option<JobStatus> {
        let index = self.requested.iter().position(|(t, _)| t == token)?;
        let (_, status) = self.requested.remove(index);
        if !self.status.is_terminal() {
            self.status = status;
        }
        if let Some(version) = version_number {
            self.version_number = Some(version);
        }
        Some(self.status)
    }

    /// Drops the transition recorded under `token` without applying it.
    pub fn abandon(&mut self, token: &str) -> bool {
        let before = self.requested.len();
        self.requested.retain(|(t, _)| t != token);
        self.requested.len() != before
    }

    // -------------------------------------------------------------------------
    // Service-initiated changes
    // -------------------------------------------------------------------------

    /// Takes the service's view of the execution, as carried by a rejected
    /// update or a describe response. Outstanding requests are kept; they
    /// resolve on their own.
    ///
    /// No-op (returns false) once terminal: a late response can never move a
    /// finished execution.
    pub fn adopt(&mut self, status: JobStatus, version_number: Option<u64>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if let Some(version) = version_number {
            self.version_number = Some(version);
        }
        true
    }

    /// Marks the execution canceled. No-op (returns false) once terminal.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Canceled;
        true
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> JobExecution {
        JobExecution::new(
            "pump",
            "job-1",
            JobStatus::Queued,
            json!({ "operation": "reboot" }),
        )
        .with_numbers(Some(1), Some(1))
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&JobStatus::InProgress).unwrap(), "\"IN_PROGRESS\"");
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"TIMED_OUT\"").unwrap(),
            JobStatus::TimedOut
        );
        assert_eq!(JobStatus::Canceled.to_string(), "CANCELED");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        for status in [
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Rejected,
            JobStatus::Canceled,
            JobStatus::TimedOut,
            JobStatus::Removed,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(JobStatus::InProgress));
        }
    }

    #[test]
    fn test_happy_path() {
        let mut job = job();
        assert_eq!(job.operation(), Some("reboot"));

        job.begin_transition("t1", JobStatus::InProgress).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.effective_status(), JobStatus::InProgress);
        assert_eq!(job.confirm("t1", Some(2)), Some(JobStatus::InProgress));

        job.begin_transition("t2", JobStatus::Succeeded).unwrap();
        assert_eq!(job.confirm("t2", Some(3)), Some(JobStatus::Succeeded));
        assert!(job.is_terminal());
        assert_eq!(job.expected_version(), Some(3));
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut job = job();
        job.begin_transition("t1", JobStatus::Failed).unwrap();
        job.confirm("t1", None);

        let before = job.clone();
        for to in [
            JobStatus::InProgress,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Queued,
        ] {
            let err = job.begin_transition("again", to).unwrap_err();
            assert!(matches!(
                err,
                CoreError::InvalidTransition { from: JobStatus::Failed, .. }
            ));
        }
        assert_eq!(job, before);
    }

    #[test]
    fn test_second_terminal_call_fails_before_response() {
        let mut job = job();
        job.begin_transition("t1", JobStatus::Succeeded).unwrap();
        let err = job.begin_transition("t2", JobStatus::Succeeded).unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidTransition {
                job_id: "job-1".to_string(),
                from: JobStatus::Succeeded,
                to: JobStatus::Succeeded,
            }
        );
        assert_eq!(job.pending_tokens().collect::<Vec<_>>(), vec!["t1"]);
    }

    #[test]
    fn test_abandon_restores_previous_effective_status() {
        let mut job = job();
        job.begin_transition("t1", JobStatus::Succeeded).unwrap();
        assert!(job.abandon("t1"));
        assert!(!job.abandon("t1"));
        assert_eq!(job.effective_status(), JobStatus::Queued);
        assert!(job.begin_transition("t2", JobStatus::InProgress).is_ok());
    }

    #[test]
    fn test_repeated_in_progress_allowed() {
        let mut job = job();
        job.begin_transition("t1", JobStatus::InProgress).unwrap();
        job.begin_transition("t2", JobStatus::InProgress).unwrap();
        job.confirm("t1", Some(2));
        job.confirm("t2", Some(3));
        assert_eq!(job.status(), JobStatus::InProgress);
    }

    #[test]
    fn test_cancel_and_adopt() {
        let mut job = job();
        job.begin_transition("t1", JobStatus::InProgress).unwrap();
        assert!(job.cancel());
        assert!(!job.cancel());
        assert_eq!(job.status(), JobStatus::Canceled);

        // A late accept cannot move a canceled job
        assert_eq!(job.confirm("t1", None), Some(JobStatus::Canceled));

        let mut other = self::job();
        assert!(other.adopt(JobStatus::Canceled, Some(9)));
        assert!(other.is_terminal());
        assert_eq!(other.expected_version(), Some(9));
        assert!(other.begin_transition("t", JobStatus::Succeeded).is_err());
    }

    #[test]
    fn test_adopt_never_leaves_terminal_state() {
        let mut job = job();
        job.begin_transition("t1", JobStatus::InProgress).unwrap();
        job.begin_transition("t2", JobStatus::Succeeded).unwrap();
        job.confirm("t2", Some(3));

        // The earlier request is rejected after the terminal accept
        job.abandon("t1");
        assert!(!job.adopt(JobStatus::InProgress, Some(2)));
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.expected_version(), Some(3));
        assert!(job.begin_transition("t3", JobStatus::Succeeded).is_err());
    }

    #[test]
    fn test_unknown_token_confirm() {
        let mut job = job();
        assert_eq!(job.confirm("missing", Some(5)), None);
        assert_eq!(job.expected_version(), Some(1));
    }
}
