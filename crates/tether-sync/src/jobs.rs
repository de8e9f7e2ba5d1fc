//! # Job Executor
//!
//! Receives job executions for subscribed things, hands each one to exactly
//! one handler, and drives its status through the jobs service.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Job Executor                                  │
//! │                                                                         │
//! │   subscribe_to_jobs(pump, "reboot") ──► handler rx                      │
//! │   start_job_notifications(pump)     ──► notify-next + $next/get         │
//! │                                                                         │
//! │   notify-next { execution }                                             │
//! │        │                                                                │
//! │        ▼  (thing, job, execution#) not yet delivered                    │
//! │   ┌──────────────┐  operation == "reboot"  ┌─────────────────────┐     │
//! │   │  JobExecution│────────────────────────►│ handler("reboot")   │     │
//! │   │  QUEUED      │  otherwise              ├─────────────────────┤     │
//! │   └──────────────┘────────────────────────►│ handler(any)        │     │
//! │                                            └──────────┬──────────┘     │
//! │                                                       │ Job            │
//! │   job.in_progress() ──► <jobId>/update  ◄─────────────┘                │
//! │   job.succeeded()   ──► <jobId>/update  (fails fast once terminal)     │
//! │                                                                         │
//! │   update/rejected { executionState: CANCELED } ──► adopt, JobCanceled  │
//! │   notify { pending lists without the job }     ──► cancel, JobCanceled │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Like the shadow synchronizer this is plain data owned by the router task.
//! [`Job`] handles talk back to it through a command channel.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tether_core::topics::{JobRequest, JobTopic, ResponseStatus, Topics};
use tether_core::validation::{validate_job_id, validate_thing_name};
use tether_core::{ClientToken, CoreError, CorrelationRegistry, JobExecution, JobStatus, Resolution};

use crate::connector::{OutboundPublish, Qos};
use crate::error::{SyncError, SyncResult};
use crate::events::{ClientEvent, PendingOperation};
use crate::protocol::{
    decode, encode, DescribeRequest, ExecutionState, JobExecutionData, JobUpdateAccepted,
    JobUpdateRequest, JobsChanged, NextExecution, RejectedBody, StatusDetails,
};

/// Receives delivered jobs, or the error that stopped a lookup.
pub type JobReceiver = mpsc::UnboundedReceiver<SyncResult<Job>>;

// =============================================================================
// Job Handle
// =============================================================================

/// Request from a [`Job`] handle to the executor.
pub(crate) enum JobCommand {
    Update {
        thing_name: String,
        job_id: String,
        status: JobStatus,
        details: Option<StatusDetails>,
        reply: oneshot::Sender<SyncResult<PendingOperation<ExecutionState>>>,
    },
}

/// One delivered job execution.
#[derive(Debug, Clone)]
pub struct Job {
    thing_name: String,
    job_id: String,
    document: Value,
    execution_number: Option<u64>,
    commands: mpsc::Sender<JobCommand>,
}

impl Job {
    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The document's `operation` field.
    pub fn operation(&self) -> Option<&str> {
        self.document.get("operation").and_then(Value::as_str)
    }

    pub fn execution_number(&self) -> Option<u64> {
        self.execution_number
    }

    pub async fn in_progress(&self, details: Option<StatusDetails>) -> SyncResult<ExecutionState> {
        self.update(JobStatus::InProgress, details).await
    }

    pub async fn succeeded(&self, details: Option<StatusDetails>) -> SyncResult<ExecutionState> {
        self.update(JobStatus::Succeeded, details).await
    }

    pub async fn failed(&self, details: Option<StatusDetails>) -> SyncResult<ExecutionState> {
        self.update(JobStatus::Failed, details).await
    }

    pub async fn rejected(&self, details: Option<StatusDetails>) -> SyncResult<ExecutionState> {
        self.update(JobStatus::Rejected, details).await
    }

    /// Requests `status` and waits for the service's answer.
    pub async fn update(
        &self,
        status: JobStatus,
        details: Option<StatusDetails>,
    ) -> SyncResult<ExecutionState> {
        self.send_update(status, details).await?.wait().await
    }

    /// Requests `status` without waiting for the answer.
    ///
    /// An illegal transition fails here with `SyncError::InvalidTransition`,
    /// before anything is published.
    pub async fn send_update(
        &self,
        status: JobStatus,
        details: Option<StatusDetails>,
    ) -> SyncResult<PendingOperation<ExecutionState>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(JobCommand::Update {
                thing_name: self.thing_name.clone(),
                job_id: self.job_id.clone(),
                status,
                details,
                reply,
            })
            .await
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)?
    }
}

// =============================================================================
// Executor
// =============================================================================

struct Handler {
    operation: Option<String>,
    tx: mpsc::UnboundedSender<SyncResult<Job>>,
}

#[derive(Default)]
struct ThingJobs {
    handlers: Vec<Handler>,
    notifications: bool,
    executions: HashMap<String, JobExecution>,
    delivered: HashSet<(String, u64)>,
}

impl ThingJobs {
    fn fail_handlers(&mut self, error: &SyncError) {
        self.handlers.retain(|h| h.tx.send(Err(error.clone())).is_ok());
    }
}

pub struct JobExecutor {
    topics: Topics,
    operation_timeout: Duration,
    things: BTreeMap<String, ThingJobs>,
    updates: CorrelationRegistry<ExecutionState>,
    describes: CorrelationRegistry<Option<JobExecutionData>>,
    next_requests: CorrelationRegistry<()>,
    update_targets: HashMap<String, String>,
    commands: mpsc::Sender<JobCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl JobExecutor {
    pub(crate) fn new(
        topics: Topics,
        operation_timeout: Duration,
        commands: mpsc::Sender<JobCommand>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        JobExecutor {
            topics,
            operation_timeout,
            things: BTreeMap::new(),
            updates: CorrelationRegistry::new(),
            describes: CorrelationRegistry::new(),
            next_requests: CorrelationRegistry::new(),
            update_targets: HashMap::new(),
            commands,
            events,
        }
    }

    /// Tracking entry for a thing, plus the filters to subscribe when the
    /// thing is new.
    fn thing_entry(&mut self, thing_name: &str) -> SyncResult<(&mut ThingJobs, Vec<String>)> {
        validate_thing_name(thing_name)?;
        let mut filters = Vec::new();
        if !self.things.contains_key(thing_name) {
            filters = self.topics.job_response_filters(thing_name);
            filters.push(self.topics.jobs_notify(thing_name));
        }
        let jobs = self.things.entry(thing_name.to_string()).or_default();
        Ok((jobs, filters))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Adds a handler for `thing_name`. With `operation` set it only receives
    /// jobs whose document names that operation.
    ///
    /// Returns the filters to subscribe and the handler's receiver.
    pub fn subscribe(
        &mut self,
        thing_name: &str,
        operation: Option<&str>,
    ) -> SyncResult<(Vec<String>, JobReceiver)> {
        let commands = self.commands.clone();
        let (jobs, filters) = self.thing_entry(thing_name)?;
        let (tx, rx) = mpsc::unbounded_channel();
        jobs.handlers.push(Handler {
            operation: operation.map(str::to_string),
            tx,
        });
        info!(thing_name = %thing_name, operation = ?operation, "Job handler registered");

        // Executions that arrived before any handler could take them
        let held: Vec<String> = jobs.executions.keys().cloned().collect();
        for job_id in held {
            deliver(thing_name, jobs, &job_id, &commands);
        }
        Ok((filters, rx))
    }

    /// Starts following `notify-next`. Returns the filters to subscribe and a
    /// `$next/get` request for whatever is already pending.
    pub fn start_notifications(
        &mut self,
        thing_name: &str,
        now: Instant,
    ) -> SyncResult<(Vec<String>, ClientToken, OutboundPublish)> {
        let notify_next = self.topics.jobs_notify_next(thing_name);
        let (jobs, mut filters) = self.thing_entry(thing_name)?;
        if !jobs.notifications {
            jobs.notifications = true;
            filters.push(notify_next);
        }
        info!(thing_name = %thing_name, "Job notifications started");
        let (token, publish) = self.next_request(thing_name, now)?;
        Ok((filters, token, publish))
    }

    /// Stops following `notify-next`. Returns the filters to unsubscribe.
    pub fn stop_notifications(&mut self, thing_name: &str) -> Vec<String> {
        match self.things.get_mut(thing_name) {
            Some(jobs) if jobs.notifications => {
                jobs.notifications = false;
                info!(thing_name = %thing_name, "Job notifications stopped");
                vec![self.topics.jobs_notify_next(thing_name)]
            }
            _ => Vec::new(),
        }
    }

    /// `$next/get` for every thing with notifications started. Sent after each
    /// connect so nothing announced while offline is missed.
    pub fn on_connect(&mut self, now: Instant) -> Vec<(ClientToken, OutboundPublish)> {
        let started: Vec<String> = self
            .things
            .iter()
            .filter(|(_, jobs)| jobs.notifications)
            .map(|(name, _)| name.clone())
            .collect();

        let mut out = Vec::with_capacity(started.len());
        for thing_name in started {
            match self.next_request(&thing_name, now) {
                Ok(request) => out.push(request),
                Err(e) => warn!(thing_name = %thing_name, error = %e, "Could not request next job"),
            }
        }
        out
    }

    fn next_request(
        &mut self,
        thing_name: &str,
        now: Instant,
    ) -> SyncResult<(ClientToken, OutboundPublish)> {
        let token = ClientToken::generate();
        let payload = encode(&DescribeRequest {
            client_token: token.to_string(),
            include_job_document: true,
            execution_number: None,
        })?;
        self.next_requests
            .register(token.as_str(), thing_name, now + self.operation_timeout, |_| {})?;
        let topic = self.topics.job_request(thing_name, &JobRequest::GetNext);
        Ok((token, publish(topic, payload)))
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Validates and records a status change for a delivered job, returning
    /// the publish and its pending outcome.
    pub(crate) fn update_status(
        &mut self,
        thing_name: &str,
        job_id: &str,
        status: JobStatus,
        details: Option<StatusDetails>,
        now: Instant,
    ) -> SyncResult<(OutboundPublish, PendingOperation<ExecutionState>)> {
        let unknown = || CoreError::UnknownJob {
            thing_name: thing_name.to_string(),
            job_id: job_id.to_string(),
        };
        let execution = self
            .things
            .get_mut(thing_name)
            .and_then(|jobs| jobs.executions.get_mut(job_id))
            .ok_or_else(unknown)?;

        let token = ClientToken::generate();
        // Concurrent updates would race each other's version numbers
        let expected_version = match execution.pending_tokens().next() {
            None => execution.expected_version(),
            Some(_) => None,
        };
        let payload = encode(&JobUpdateRequest {
            status,
            status_details: details,
            expected_version,
            execution_number: execution.execution_number(),
            include_job_execution_state: true,
            client_token: token.to_string(),
        })?;

        execution.begin_transition(token.as_str(), status)?;

        let (pending, outcome) = PendingOperation::new(token.clone());
        if let Err(e) = self.updates.register(
            token.as_str(),
            thing_name,
            now + self.operation_timeout,
            move |resolution| {
                let _ = outcome.send(resolution);
            },
        ) {
            execution.abandon(token.as_str());
            return Err(e.into());
        }
        self.update_targets
            .insert(token.to_string(), job_id.to_string());

        debug!(
            thing_name = %thing_name,
            job_id = %job_id,
            status = %status,
            expected_version = ?expected_version,
            "Job status update issued"
        );
        let topic = self
            .topics
            .job_request(thing_name, &JobRequest::Update(job_id.to_string()));
        Ok((publish(topic, payload), pending))
    }

    /// Requests the service's view of one execution. Returns the filters to
    /// subscribe when the thing is new, the publish and its pending outcome.
    pub fn describe(
        &mut self,
        thing_name: &str,
        job_id: &str,
        now: Instant,
    ) -> SyncResult<(Vec<String>, OutboundPublish, PendingOperation<Option<JobExecutionData>>)> {
        validate_job_id(job_id)?;
        let (_, filters) = self.thing_entry(thing_name)?;

        let token = ClientToken::generate();
        let payload = encode(&DescribeRequest {
            client_token: token.to_string(),
            include_job_document: true,
            execution_number: None,
        })?;
        let (pending, outcome) = PendingOperation::new(token.clone());
        self.describes.register(
            token.as_str(),
            thing_name,
            now + self.operation_timeout,
            move |resolution| {
                let _ = outcome.send(resolution);
            },
        )?;

        let topic = self
            .topics
            .job_request(thing_name, &JobRequest::Describe(job_id.to_string()));
        Ok((filters, publish(topic, payload), pending))
    }

    /// Forgets a request that never reached the connection.
    pub fn withdraw(&mut self, token: &ClientToken) {
        let token = token.as_str();
        if let Some(thing_name) = self.updates.owner_of(token).map(str::to_string) {
            self.updates.withdraw(token);
            self.abandon_update(&thing_name, token);
        }
        self.describes.withdraw(token);
        self.next_requests.withdraw(token);
    }

    /// Fails a request the offline queue discarded before it was sent.
    /// Next-job lookups are asked again on connect, so those only settle.
    pub fn fail_dropped(&mut self, token: &str) -> bool {
        if let Some(thing_name) = self.updates.owner_of(token).map(str::to_string) {
            warn!(thing_name = %thing_name, token = %token, "Job status update dropped while offline");
            self.abandon_update(&thing_name, token);
            return self.updates.resolve(token, Resolution::Dropped);
        }
        self.describes.resolve(token, Resolution::Dropped)
            || self.next_requests.resolve(token, Resolution::Dropped)
    }

    fn abandon_update(&mut self, thing_name: &str, token: &str) {
        let Some(job_id) = self.update_targets.remove(token) else {
            return;
        };
        if let Some(execution) = self.execution_mut(thing_name, &job_id) {
            execution.abandon(token);
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Applies one jobs-service message for `thing_name`.
    pub fn handle_message(&mut self, thing_name: &str, topic: &JobTopic, payload: &[u8]) {
        if !self.things.contains_key(thing_name) {
            debug!(thing_name = %thing_name, "Jobs message for untracked thing");
            return;
        }
        match topic {
            JobTopic::NotifyNext => self.on_notify_next(thing_name, payload),
            JobTopic::Notify => self.on_notify(thing_name, payload),
            JobTopic::Response(JobRequest::GetNext, status) => {
                self.on_next_response(thing_name, *status, payload)
            }
            JobTopic::Response(JobRequest::Update(job_id), ResponseStatus::Accepted) => {
                self.on_update_accepted(thing_name, job_id, payload)
            }
            JobTopic::Response(JobRequest::Update(job_id), ResponseStatus::Rejected) => {
                self.on_update_rejected(thing_name, job_id, payload)
            }
            JobTopic::Response(JobRequest::Describe(job_id), status) => {
                self.on_describe_response(thing_name, job_id, *status, payload)
            }
            JobTopic::Response(JobRequest::GetPending, _) | JobTopic::Request(_) => {}
        }
    }

    fn on_notify_next(&mut self, thing_name: &str, payload: &[u8]) {
        if !self.things.get(thing_name).is_some_and(|j| j.notifications) {
            return;
        }
        match decode::<NextExecution>(payload) {
            Ok(NextExecution {
                execution: Some(data),
                ..
            }) => self.track(thing_name, data),
            Ok(_) => debug!(thing_name = %thing_name, "No pending jobs"),
            Err(e) => warn!(thing_name = %thing_name, error = %e, "Ignoring malformed notify-next"),
        }
    }

    fn on_next_response(&mut self, thing_name: &str, status: ResponseStatus, payload: &[u8]) {
        match status {
            ResponseStatus::Accepted => {
                let body: NextExecution = match decode(payload) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(thing_name = %thing_name, error = %e, "Ignoring malformed next job");
                        return;
                    }
                };
                let Some(token) = body.client_token.as_deref() else {
                    return;
                };
                if !self.next_requests.resolve(token, Resolution::Accepted(())) {
                    debug!(thing_name = %thing_name, "Next job response for unknown token");
                    return;
                }
                if let Some(data) = body.execution {
                    self.track(thing_name, data);
                }
            }
            ResponseStatus::Rejected => {
                let Ok(body) = decode::<RejectedBody>(payload) else {
                    return;
                };
                let Some(token) = body.client_token.as_deref() else {
                    return;
                };
                if !self.next_requests.resolve(token, Resolution::Rejected(body.rejection.clone())) {
                    return;
                }
                warn!(thing_name = %thing_name, rejection = %body.rejection, "Next job lookup rejected");
                if let Some(jobs) = self.things.get_mut(thing_name) {
                    jobs.fail_handlers(&body.rejection.into());
                }
            }
        }
    }

    /// Records an execution from the service and delivers it when new.
    fn track(&mut self, thing_name: &str, data: JobExecutionData) {
        let commands = self.commands.clone();
        let Some(jobs) = self.things.get_mut(thing_name) else {
            return;
        };

        let replace = match jobs.executions.get_mut(&data.job_id) {
            Some(known) if known.execution_number() == data.execution_number => {
                // Service view wins when nothing of ours is in flight
                if known.pending_tokens().next().is_none() && !known.is_terminal() {
                    known.adopt(data.status, data.version_number);
                }
                false
            }
            _ => true,
        };
        if replace {
            let execution = JobExecution::new(
                thing_name,
                data.job_id.clone(),
                data.status,
                data.job_document.unwrap_or(Value::Null),
            )
            .with_numbers(data.version_number, data.execution_number);
            jobs.executions.insert(data.job_id.clone(), execution);
        }

        deliver(thing_name, jobs, &data.job_id, &commands);
    }

    fn on_notify(&mut self, thing_name: &str, payload: &[u8]) {
        let body: JobsChanged = match decode(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(thing_name = %thing_name, error = %e, "Ignoring malformed notify");
                return;
            }
        };
        let Some(jobs) = self.things.get_mut(thing_name) else {
            return;
        };

        for execution in jobs.executions.values_mut() {
            if execution.effective_status().is_terminal() || body.jobs.contains(execution.job_id()) {
                continue;
            }
            if execution.cancel() {
                info!(thing_name = %thing_name, job_id = %execution.job_id(), "Job canceled by service");
                let _ = self.events.send(ClientEvent::JobCanceled {
                    thing_name: thing_name.to_string(),
                    job_id: execution.job_id().to_string(),
                });
            }
        }
    }

    fn on_update_accepted(&mut self, thing_name: &str, job_id: &str, payload: &[u8]) {
        let body: JobUpdateAccepted = match decode(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(thing_name = %thing_name, job_id = %job_id, error = %e, "Ignoring malformed update response");
                return;
            }
        };
        let Some(token) = body
            .client_token
            .as_deref()
            .filter(|t| self.updates.contains(t))
        else {
            debug!(thing_name = %thing_name, job_id = %job_id, "Update response for unknown token");
            return;
        };
        let token = token.to_string();
        self.update_targets.remove(&token);

        let version = body.execution_state.as_ref().and_then(|s| s.version_number);
        let confirmed = self
            .execution_mut(thing_name, job_id)
            .and_then(|execution| execution.confirm(&token, version));
        let Some(confirmed) = confirmed else {
            self.updates.resolve(&token, Resolution::Closed);
            return;
        };

        info!(thing_name = %thing_name, job_id = %job_id, status = %confirmed, "Job status updated");
        let state = body.execution_state.unwrap_or(ExecutionState {
            status: confirmed,
            status_details: None,
            version_number: None,
        });
        self.updates.resolve(&token, Resolution::Accepted(state));
    }

    fn on_update_rejected(&mut self, thing_name: &str, job_id: &str, payload: &[u8]) {
        let body: RejectedBody = match decode(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(thing_name = %thing_name, job_id = %job_id, error = %e, "Ignoring malformed rejection");
                return;
            }
        };
        let Some(token) = body
            .client_token
            .as_deref()
            .filter(|t| self.updates.contains(t))
        else {
            return;
        };
        let token = token.to_string();
        self.update_targets.remove(&token);

        warn!(
            thing_name = %thing_name,
            job_id = %job_id,
            code = %body.rejection.code,
            message = %body.rejection.message,
            "Job status update rejected"
        );
        if let Some(execution) = self.execution_mut(thing_name, job_id) {
            execution.abandon(&token);
        }
        if let Some(state) = &body.execution_state {
            self.adopt(thing_name, job_id, state.status, state.version_number);
        }
        self.updates
            .resolve(&token, Resolution::Rejected(body.rejection));
    }

    fn on_describe_response(
        &mut self,
        thing_name: &str,
        job_id: &str,
        status: ResponseStatus,
        payload: &[u8],
    ) {
        match status {
            ResponseStatus::Accepted => {
                let Ok(body) = decode::<NextExecution>(payload) else {
                    warn!(thing_name = %thing_name, job_id = %job_id, "Ignoring malformed describe response");
                    return;
                };
                let Some(token) = body.client_token.clone() else {
                    return;
                };
                if !self.describes.contains(&token) {
                    return;
                }
                if let Some(data) = &body.execution {
                    if data.status.is_terminal() {
                        self.adopt(thing_name, job_id, data.status, data.version_number);
                    }
                }
                self.describes
                    .resolve(&token, Resolution::Accepted(body.execution));
            }
            ResponseStatus::Rejected => {
                let Ok(body) = decode::<RejectedBody>(payload) else {
                    return;
                };
                if let Some(token) = body.client_token.as_deref() {
                    self.describes
                        .resolve(token, Resolution::Rejected(body.rejection));
                }
            }
        }
    }

    /// Takes the service's status for a tracked execution.
    fn adopt(&mut self, thing_name: &str, job_id: &str, status: JobStatus, version: Option<u64>) {
        let Some(execution) = self.execution_mut(thing_name, job_id) else {
            return;
        };
        if !execution.adopt(status, version) {
            debug!(thing_name = %thing_name, job_id = %job_id, status = %status, "Ignoring service status for finished job");
            return;
        }
        debug!(thing_name = %thing_name, job_id = %job_id, status = %status, "Adopted service job status");

        if status == JobStatus::Canceled {
            let _ = self.events.send(ClientEvent::JobCanceled {
                thing_name: thing_name.to_string(),
                job_id: job_id.to_string(),
            });
        }
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Times out every request whose deadline has passed. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut count = 0;
        for expired in self.updates.sweep(now) {
            warn!(thing_name = %expired.owner, token = %expired.token, "Job status update timed out");
            self.abandon_update(&expired.owner, &expired.token);
            count += 1;
        }
        count += self.describes.sweep(now).len();
        for expired in self.next_requests.sweep(now) {
            warn!(thing_name = %expired.owner, "Next job lookup timed out");
            if let Some(jobs) = self.things.get_mut(&expired.owner) {
                jobs.fail_handlers(&SyncError::Timeout);
            }
            count += 1;
        }
        count
    }

    /// Resolves everything outstanding as closed.
    pub fn close_all(&mut self) {
        for expired in self.updates.close_all() {
            self.abandon_update(&expired.owner, &expired.token);
        }
        self.describes.close_all();
        self.next_requests.close_all();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_tracking(&self, thing_name: &str) -> bool {
        self.things.contains_key(thing_name)
    }

    pub fn execution(&self, thing_name: &str, job_id: &str) -> Option<&JobExecution> {
        self.things.get(thing_name)?.executions.get(job_id)
    }

    fn execution_mut(&mut self, thing_name: &str, job_id: &str) -> Option<&mut JobExecution> {
        self.things.get_mut(thing_name)?.executions.get_mut(job_id)
    }

    /// Things with handlers or notifications.
    pub fn things(&self) -> Vec<String> {
        self.things.keys().cloned().collect()
    }

    /// Tracked executions that have not reached a terminal status.
    pub fn active_jobs(&self) -> usize {
        self.things
            .values()
            .flat_map(|jobs| jobs.executions.values())
            .filter(|execution| !execution.is_terminal())
            .count()
    }

    pub fn pending(&self) -> usize {
        self.updates.len() + self.describes.len() + self.next_requests.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.updates.next_deadline(),
            self.describes.next_deadline(),
            self.next_requests.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Hands a tracked execution to its handler unless it is terminal or was
/// already delivered. Without a matching handler it stays held.
fn deliver(thing_name: &str, jobs: &mut ThingJobs, job_id: &str, commands: &mpsc::Sender<JobCommand>) {
    let Some(execution) = jobs.executions.get(job_id) else {
        return;
    };
    let key = (job_id.to_string(), execution.execution_number().unwrap_or(0));
    if execution.is_terminal() || jobs.delivered.contains(&key) {
        return;
    }

    jobs.handlers.retain(|h| !h.tx.is_closed());
    let operation = execution.operation();
    let handler = jobs
        .handlers
        .iter()
        .find(|h| h.operation.is_some() && h.operation.as_deref() == operation)
        .or_else(|| jobs.handlers.iter().find(|h| h.operation.is_none()));
    let Some(handler) = handler else {
        debug!(thing_name = %thing_name, job_id = %job_id, operation = ?operation, "No handler for job yet");
        return;
    };

    let job = Job {
        thing_name: thing_name.to_string(),
        job_id: job_id.to_string(),
        document: execution.document().clone(),
        execution_number: execution.execution_number(),
        commands: commands.clone(),
    };
    if handler.tx.send(Ok(job)).is_ok() {
        info!(thing_name = %thing_name, job_id = %job_id, operation = ?operation, "Job delivered");
        jobs.delivered.insert(key);
    }
}

fn publish(topic: String, payload: Vec<u8>) -> OutboundPublish {
    OutboundPublish {
        topic,
        payload,
        qos: Qos::AtLeastOnce,
        retain: false,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
