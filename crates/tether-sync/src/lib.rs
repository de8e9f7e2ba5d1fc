//! # tether-sync: Device Session, Shadows and Jobs for Tether
//!
//! This crate connects a device to the broker and keeps its shadows and job
//! executions in step with the cloud services.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Device Client Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 DeviceClient (cloneable handle)                  │  │
//! │  │       ThingShadows ─┐   Jobs ─┐   publish / subscribe ─┐        │  │
//! │  └─────────────────────┼─────────┼───────────────────────┼─────────┘  │
//! │                        ▼         ▼                       │             │
//! │  ┌──────────────────────────────────────────────┐        │             │
//! │  │              Router task (device.rs)          │        │             │
//! │  │                                               │        │             │
//! │  │  ┌────────────────────┐ ┌──────────────────┐ │        │             │
//! │  │  │ ShadowSynchronizer │ │   JobExecutor    │ │        │             │
//! │  │  │ get/update/delete  │ │ notify-next      │ │        │             │
//! │  │  │ deltas, versions   │ │ status updates   │ │        │             │
//! │  │  └────────────────────┘ └──────────────────┘ │        │             │
//! │  │        CorrelationRegistry (tether-core)      │        │             │
//! │  └──────────────────────┬───────────────────────┘        │             │
//! │                         ▼                                ▼             │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    Session actor (session.rs)                    │  │
//! │  │  backoff reconnect • resubscribe • offline queue • drain pacing  │  │
//! │  └──────────────────────────────┬───────────────────────────────────┘  │
//! │                                 ▼                                       │
//! │                 Connector / Link (rumqttc, or MemoryBroker)             │
//! │                                                                         │
//! │  EVENTS (to the caller):                                               │
//! │  • connect / reconnect / offline / close                               │
//! │  • status / delta / foreign-state-change                               │
//! │  • job-canceled / message / error                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`device`] - `DeviceClient`, its shadow and job handles, the router task
//! - [`session`] - Reconnecting MQTT session actor
//! - [`queue`] - Bounded offline publish queue
//! - [`shadow`] - `ShadowSynchronizer`
//! - [`jobs`] - `JobExecutor` and the `Job` handle given to handlers
//! - [`connector`] - `Connector`/`Link` seam and the rumqttc implementation
//! - [`protocol`] - Service payload types
//! - [`events`] - Caller-facing events and `PendingOperation`
//! - [`config`] - Client configuration (TOML + env)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use serde_json::json;
//! use tether_sync::{ClientConfig, DeviceClient, RegisterOptions};
//!
//! let config = ClientConfig::load(None)?;
//! let (client, mut events) = DeviceClient::connect(config)?;
//!
//! let shadows = client.shadows();
//! shadows.register("lamp", RegisterOptions::default()).await?;
//! let accepted = shadows
//!     .update("lamp", json!({ "reported": { "on": true } }))
//!     .await?
//!     .wait()
//!     .await?;
//! println!("lamp at version {:?}", accepted.version);
//!
//! let mut jobs = client.jobs().subscribe_to_jobs("lamp", None).await?;
//! client.jobs().start_job_notifications("lamp").await?;
//! while let Some(Ok(job)) = jobs.recv().await {
//!     job.in_progress(None).await?;
//!     job.succeeded(None).await?;
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connector;
pub mod device;
pub mod error;
pub mod events;
pub mod jobs;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod shadow;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ClientConfig, Protocol};
pub use connector::{Connector, InboundMessage, MqttConnector, OutboundPublish, Qos};
pub use device::{ClientStatus, DeviceClient, Jobs, ThingShadows};
pub use error::{SyncError, SyncResult};
pub use events::{
    ClientEvent, DeltaEvent, ForeignStateChange, PendingOperation, ShadowResponse, ShadowStatus,
};
pub use jobs::{Job, JobExecutor, JobReceiver};
pub use protocol::{ExecutionState, JobExecutionData, StatusDetails};
pub use queue::DropPolicy;
pub use session::{
    ConnectionState, PublishOptions, PublishReceipt, Session, SessionEvent, SessionHandle,
    SessionStats,
};
pub use shadow::{RegisterOptions, ShadowSynchronizer};
