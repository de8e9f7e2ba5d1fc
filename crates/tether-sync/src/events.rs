//! # Client Events
//!
//! Everything a [`DeviceClient`](crate::device::DeviceClient) reports to its
//! caller, plus the awaitable handle returned by correlated operations.
//!
//! ```text
//!   session:  connect │ reconnect │ offline │ error │ message │ close
//!   shadows:  status  │ delta     │ foreign-state-change
//!   jobs:     job-canceled
//! ```

use serde_json::Value;
use tokio::sync::oneshot;

use tether_core::topics::ShadowOperation;
use tether_core::{ClientToken, Resolution};

use crate::connector::InboundMessage;
use crate::error::{SyncError, SyncResult};

/// A caller-facing event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connect,
    Reconnect,
    Offline,
    Error(SyncError),
    /// A publish on a non-service topic the caller subscribed to.
    Message(InboundMessage),
    /// A shadow operation finished.
    Status(ShadowStatus),
    /// Desired state diverged from reported state.
    Delta(DeltaEvent),
    /// Another writer updated a registered shadow.
    ForeignStateChange(ForeignStateChange),
    /// The jobs service canceled an execution this client was tracking.
    JobCanceled { thing_name: String, job_id: String },
    Close,
}

/// Accepted body of a shadow operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowResponse {
    /// Full document for `get`, the applied patch for `update`, `null` for
    /// `delete`.
    pub state: Value,
    pub version: Option<u64>,
    pub timestamp: Option<i64>,
}

/// Outcome of one shadow operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowStatus {
    pub thing_name: String,
    pub operation: ShadowOperation,
    pub client_token: ClientToken,
    pub resolution: Resolution<ShadowResponse>,
}

impl ShadowStatus {
    /// `accepted`, `rejected`, `timeout`, `closed` or `dropped`.
    pub fn status_type(&self) -> &'static str {
        self.resolution.kind()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    pub thing_name: String,
    pub state: Value,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignStateChange {
    pub thing_name: String,
    /// The accepted update as published by the service.
    pub state: Value,
    pub version: Option<u64>,
}

// =============================================================================
// Pending Operation
// =============================================================================

/// A request that has been sent and is waiting on its correlated response.
///
/// Dropping it does not cancel the request; the outcome is still reported
/// through the event stream where one applies.
#[derive(Debug)]
pub struct PendingOperation<T> {
    token: ClientToken,
    outcome: oneshot::Receiver<Resolution<T>>,
}

impl<T> PendingOperation<T> {
    pub(crate) fn new(token: ClientToken) -> (Self, oneshot::Sender<Resolution<T>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingOperation {
                token,
                outcome: rx,
            },
            tx,
        )
    }

    pub fn token(&self) -> &ClientToken {
        &self.token
    }

    /// Waits for the raw resolution.
    pub async fn resolution(self) -> Resolution<T> {
        self.outcome.await.unwrap_or(Resolution::Closed)
    }

    /// Waits for the outcome, mapping anything but `Accepted` to an error.
    pub async fn wait(self) -> SyncResult<T> {
        match self.resolution().await {
            Resolution::Accepted(value) => Ok(value),
            Resolution::Rejected(rejection) => Err(rejection.into()),
            Resolution::Timeout => Err(SyncError::Timeout),
            Resolution::Closed => Err(SyncError::Closed),
            Resolution::Dropped => Err(SyncError::RequestDropped),
        }
    }
}
