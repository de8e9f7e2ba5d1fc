//! Jobs service emulation: per-thing execution lists, `notify` and
//! `notify-next` announcements, versioned status updates.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use tether_core::topics::{JobRequest, ResponseStatus, Topics};
use tether_core::JobStatus;

use super::{now_secs, Outgoing};
use crate::protocol::{
    decode, DescribeRequest, ExecutionState, JobExecutionData, JobSummary, JobUpdateAccepted,
    JobUpdateRequest, JobsChanged, NextExecution, PendingExecutions, PendingJobs, StatusDetails,
    TokenEnvelope,
};

/// A job execution as the service stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub job_id: String,
    pub document: Value,
    pub status: JobStatus,
    pub status_details: Option<StatusDetails>,
    pub version_number: u64,
    pub execution_number: u64,
}

#[derive(Debug, Clone)]
struct JobRecord {
    job_id: String,
    document: Value,
    status: JobStatus,
    status_details: Option<StatusDetails>,
    version_number: u64,
    execution_number: u64,
    queued_at: i64,
    last_updated_at: i64,
}

impl JobRecord {
    fn is_pending(&self) -> bool {
        !self.status.is_terminal()
    }

    fn data(&self, thing_name: &str, include_document: bool) -> JobExecutionData {
        JobExecutionData {
            job_id: self.job_id.clone(),
            thing_name: Some(thing_name.to_string()),
            job_document: include_document.then(|| self.document.clone()),
            status: self.status,
            status_details: self.status_details.clone(),
            queued_at: Some(self.queued_at),
            last_updated_at: Some(self.last_updated_at),
            version_number: Some(self.version_number),
            execution_number: Some(self.execution_number),
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            queued_at: Some(self.queued_at),
            last_updated_at: Some(self.last_updated_at),
            version_number: Some(self.version_number),
            execution_number: Some(self.execution_number),
        }
    }

    fn execution_state(&self) -> ExecutionState {
        ExecutionState {
            status: self.status,
            status_details: self.status_details.clone(),
            version_number: Some(self.version_number),
        }
    }
}

#[derive(Debug, Default)]
struct ThingJobs {
    executions: Vec<JobRecord>,
    /// Job id last announced on `notify-next`.
    announced_next: Option<String>,
}

impl ThingJobs {
    /// In-progress executions first, then queued, each oldest first.
    fn next(&self) -> Option<&JobRecord> {
        self.executions
            .iter()
            .find(|j| j.status == JobStatus::InProgress)
            .or_else(|| {
                self.executions
                    .iter()
                    .find(|j| j.status == JobStatus::Queued)
            })
    }

    fn find(&self, job_id: &str) -> Option<&JobRecord> {
        self.executions.iter().find(|j| j.job_id == job_id)
    }

    fn find_mut(&mut self, job_id: &str) -> Option<&mut JobRecord> {
        self.executions.iter_mut().find(|j| j.job_id == job_id)
    }

    fn pending(&self) -> PendingJobs {
        let mut pending = PendingJobs::default();
        for job in &self.executions {
            match job.status {
                JobStatus::Queued => pending.queued.push(job.summary()),
                JobStatus::InProgress => pending.in_progress.push(job.summary()),
                _ => {}
            }
        }
        pending
    }
}

#[derive(Debug, Default)]
pub(super) struct JobStore {
    things: HashMap<String, ThingJobs>,
}

impl JobStore {
    pub(super) fn snapshot(&self, thing_name: &str, job_id: &str) -> Option<JobSnapshot> {
        let job = self.things.get(thing_name)?.find(job_id)?;
        Some(JobSnapshot {
            job_id: job.job_id.clone(),
            document: job.document.clone(),
            status: job.status,
            status_details: job.status_details.clone(),
            version_number: job.version_number,
            execution_number: job.execution_number,
        })
    }

    pub(super) fn create(
        &mut self,
        topics: &Topics,
        thing_name: &str,
        job_id: &str,
        document: Value,
    ) -> Vec<Outgoing> {
        let now = now_secs();
        let jobs = self.things.entry(thing_name.to_string()).or_default();
        jobs.executions.push(JobRecord {
            job_id: job_id.to_string(),
            document,
            status: JobStatus::Queued,
            status_details: None,
            version_number: 1,
            execution_number: 1,
            queued_at: now,
            last_updated_at: now,
        });
        notifications(topics, thing_name, jobs)
    }

    pub(super) fn cancel(
        &mut self,
        topics: &Topics,
        thing_name: &str,
        job_id: &str,
    ) -> Option<Vec<Outgoing>> {
        let jobs = self.things.get_mut(thing_name)?;
        let job = jobs.find_mut(job_id).filter(|j| j.is_pending())?;
        job.status = JobStatus::Canceled;
        job.version_number += 1;
        job.last_updated_at = now_secs();
        Some(notifications(topics, thing_name, jobs))
    }

    pub(super) fn handle(
        &mut self,
        topics: &Topics,
        thing_name: &str,
        request: &JobRequest,
        payload: &[u8],
    ) -> Vec<Outgoing> {
        let jobs = self.things.entry(thing_name.to_string()).or_default();
        let respond = Responder {
            topics,
            thing_name,
            request,
        };

        match request {
            JobRequest::GetPending => {
                let Ok(body) = decode::<DescribeRequest>(payload) else {
                    return vec![respond.invalid(payload)];
                };
                let pending = jobs.pending();
                vec![respond.accepted(&PendingExecutions {
                    in_progress_jobs: pending.in_progress,
                    queued_jobs: pending.queued,
                    timestamp: Some(now_secs()),
                    client_token: Some(body.client_token),
                })]
            }
            JobRequest::GetNext => {
                let Ok(body) = decode::<DescribeRequest>(payload) else {
                    return vec![respond.invalid(payload)];
                };
                vec![respond.accepted(&NextExecution {
                    execution: jobs
                        .next()
                        .map(|j| j.data(thing_name, body.include_job_document)),
                    timestamp: Some(now_secs()),
                    client_token: Some(body.client_token),
                })]
            }
            JobRequest::Describe(job_id) => {
                let Ok(body) = decode::<DescribeRequest>(payload) else {
                    return vec![respond.invalid(payload)];
                };
                match jobs.find(job_id) {
                    Some(job) => vec![respond.accepted(&NextExecution {
                        execution: Some(job.data(thing_name, body.include_job_document)),
                        timestamp: Some(now_secs()),
                        client_token: Some(body.client_token),
                    })],
                    None => vec![respond.not_found(job_id, Some(body.client_token))],
                }
            }
            JobRequest::Update(job_id) => {
                let Ok(body) = decode::<JobUpdateRequest>(payload) else {
                    return vec![respond.invalid(payload)];
                };
                let token = Some(body.client_token.clone());
                let Some(job) = jobs.find_mut(job_id) else {
                    return vec![respond.not_found(job_id, token)];
                };

                if body.expected_version.is_some_and(|v| v != job.version_number) {
                    return vec![respond.rejected(
                        "VersionMismatch",
                        "expectedVersion does not match the current version",
                        token,
                        Some(job.execution_state()),
                    )];
                }
                if !job.status.can_transition_to(body.status) {
                    let message = format!(
                        "Cannot update execution from {} to {}",
                        job.status, body.status
                    );
                    return vec![respond.rejected(
                        "InvalidStateTransition",
                        &message,
                        token,
                        Some(job.execution_state()),
                    )];
                }

                job.status = body.status;
                if body.status_details.is_some() {
                    job.status_details = body.status_details;
                }
                job.version_number += 1;
                job.last_updated_at = now_secs();

                let accepted = JobUpdateAccepted {
                    execution_state: body
                        .include_job_execution_state
                        .then(|| job.execution_state()),
                    timestamp: Some(now_secs()),
                    client_token: token,
                };
                let mut out = vec![respond.accepted(&accepted)];
                out.extend(notifications(topics, thing_name, jobs));
                out
            }
        }
    }
}

/// `notify` with the pending list, plus `notify-next` when the next
/// execution changed since the last announcement.
fn notifications(topics: &Topics, thing_name: &str, jobs: &mut ThingJobs) -> Vec<Outgoing> {
    let timestamp = Some(now_secs());
    let mut out = vec![Outgoing::json(
        topics.jobs_notify(thing_name),
        &json!(JobsChanged {
            jobs: jobs.pending(),
            timestamp,
        }),
    )];

    let next_id = jobs.next().map(|j| j.job_id.clone());
    if next_id != jobs.announced_next {
        let next = NextExecution {
            execution: jobs.next().map(|j| j.data(thing_name, true)),
            timestamp,
            client_token: None,
        };
        out.push(Outgoing::json(topics.jobs_notify_next(thing_name), &json!(next)));
        jobs.announced_next = next_id;
    }
    out
}

struct Responder<'a> {
    topics: &'a Topics,
    thing_name: &'a str,
    request: &'a JobRequest,
}

impl Responder<'_> {
    fn topic(&self, status: ResponseStatus) -> String {
        self.topics.job_response(self.thing_name, self.request, status)
    }

    fn accepted<T: Serialize>(&self, body: &T) -> Outgoing {
        Outgoing::json(self.topic(ResponseStatus::Accepted), &json!(body))
    }

    fn rejected(
        &self,
        code: &str,
        message: &str,
        token: Option<String>,
        execution_state: Option<ExecutionState>,
    ) -> Outgoing {
        let mut body = json!({
            "code": code,
            "message": message,
            "timestamp": now_secs(),
        });
        if let Some(token) = token {
            body["clientToken"] = Value::String(token);
        }
        if let Some(state) = execution_state {
            body["executionState"] = json!(state);
        }
        Outgoing::json(self.topic(ResponseStatus::Rejected), &body)
    }

    fn not_found(&self, job_id: &str, token: Option<String>) -> Outgoing {
        let message = format!("Job execution not found: {}", job_id);
        self.rejected("ResourceNotFound", &message, token, None)
    }

    fn invalid(&self, payload: &[u8]) -> Outgoing {
        let token = decode::<TokenEnvelope>(payload)
            .ok()
            .and_then(|t| t.client_token);
        self.rejected("InvalidRequest", "Malformed request", token, None)
    }
}
