//! # Service Wire Payloads
//!
//! JSON bodies exchanged with the shadow and jobs services.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Shadow Service                                     │
//! │                                                                         │
//! │  device ───► shadow/update  { state, clientToken, version? }           │
//! │  device ◄─── update/accepted { state, metadata, version, timestamp,    │
//! │                                clientToken }                           │
//! │  device ◄─── update/rejected { code: 409, message, clientToken }       │
//! │  device ◄─── update/delta    { state, metadata, version, timestamp }   │
//! │                                                                         │
//! │                      Jobs Service                                       │
//! │                                                                         │
//! │  device ◄─── jobs/notify-next { execution?, timestamp }                │
//! │  device ◄─── jobs/notify      { jobs: { QUEUED: [..], IN_PROGRESS } }  │
//! │  device ───► <jobId>/update   { status, statusDetails, expectedVersion,│
//! │                                 clientToken }                          │
//! │  device ◄─── update/accepted  { executionState, timestamp, clientToken}│
//! │  device ◄─── update/rejected  { code: "VersionMismatch", message,      │
//! │                                 executionState?, clientToken }         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Field names are camelCase on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use tether_core::{JobStatus, Rejection};

use crate::error::{SyncError, SyncResult};

/// Status detail map attached to job updates.
pub type StatusDetails = BTreeMap<String, String>;

// =============================================================================
// Helpers
// =============================================================================

/// Decodes a payload, mapping failures to `InvalidMessage`.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(payload).map_err(|e| SyncError::InvalidMessage(e.to_string()))
}

/// Encodes a payload.
pub fn encode<T: Serialize>(body: &T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(body)?)
}

/// Just the `clientToken`, for routing before full decoding.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEnvelope {
    #[serde(default)]
    pub client_token: Option<String>,
}

/// Any `*/rejected` body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedBody {
    #[serde(flatten)]
    pub rejection: Rejection,

    #[serde(default)]
    pub client_token: Option<String>,

    /// Jobs service only: the execution as the service sees it.
    #[serde(default)]
    pub execution_state: Option<ExecutionState>,
}

// =============================================================================
// Shadow Payloads
// =============================================================================

/// Body of `shadow/get`, `shadow/update` and `shadow/delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,

    pub client_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Body of `get/accepted`, `update/accepted` and `delete/accepted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowAccepted {
    #[serde(default)]
    pub state: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Body of `update/delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowDelta {
    pub version: u64,

    #[serde(default)]
    pub timestamp: Option<i64>,

    pub state: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

// =============================================================================
// Job Payloads
// =============================================================================

/// A job execution as described by the jobs service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionData {
    pub job_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thing_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_document: Option<Value>,

    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<StatusDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<u64>,
}

/// Body of `jobs/notify-next` and `$next/get/accepted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<JobExecutionData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Entry in a pending-jobs list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<u64>,
}

/// Pending jobs grouped by status, as carried by `jobs/notify`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingJobs {
    #[serde(rename = "QUEUED", default, skip_serializing_if = "Vec::is_empty")]
    pub queued: Vec<JobSummary>,

    #[serde(rename = "IN_PROGRESS", default, skip_serializing_if = "Vec::is_empty")]
    pub in_progress: Vec<JobSummary>,
}

impl PendingJobs {
    pub fn contains(&self, job_id: &str) -> bool {
        self.queued
            .iter()
            .chain(self.in_progress.iter())
            .any(|job| job.job_id == job_id)
    }
}

/// Body of `jobs/notify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsChanged {
    #[serde(default)]
    pub jobs: PendingJobs,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Body of `jobs/get/accepted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExecutions {
    #[serde(default)]
    pub in_progress_jobs: Vec<JobSummary>,

    #[serde(default)]
    pub queued_jobs: Vec<JobSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Body of `jobs/get`, `$next/get` and `<jobId>/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeRequest {
    pub client_token: String,

    #[serde(default)]
    pub include_job_document: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<u64>,
}

/// Body of `<jobId>/update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateRequest {
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<StatusDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<u64>,

    #[serde(default)]
    pub include_job_execution_state: bool,

    pub client_token: String,
}

/// Execution state echoed in update responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<StatusDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<u64>,
}

/// Body of `<jobId>/update/accepted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateAccepted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<ExecutionState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}
