//! # tether-core: Pure Protocol Logic for Tether
//!
//! This crate is the **heart** of Tether. It contains the device-side
//! synchronization rules as pure data structures and functions with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Tether Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Caller (device application)                  │   │
//! │  │    register ──► update/get/delete ──► job.in_progress ...      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ handles + events                       │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tether-sync (tokio, MQTT)                    │   │
//! │  │    Session actor, ShadowSynchronizer, JobExecutor              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tether-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐          │   │
//! │  │   │  topics  │ │  state   │ │  shadow  │ │ registry │          │   │
//! │  │   │  build   │ │  merge   │ │ versions │ │  tokens  │          │   │
//! │  │   │  parse   │ │  delta   │ │  stale   │ │ deadlines│          │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────┘          │   │
//! │  │   ┌──────────┐ ┌──────────┐                                     │   │
//! │  │   │   jobs   │ │validation│                                     │   │
//! │  │   │  status  │ │  names   │                                     │   │
//! │  │   └──────────┘ └──────────┘                                     │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS • TIME IS PASSED IN          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`topics`] - Shadow/job topic construction, parsing and filter matching
//! - [`state`] - JSON state-tree merge and delta computation
//! - [`shadow`] - `ShadowDocument` with monotonic version tracking
//! - [`registry`] - `CorrelationRegistry` for outstanding request tokens
//! - [`jobs`] - `JobStatus` and the `JobExecution` state machine
//! - [`token`] - Client token generation
//! - [`validation`] - Identifier validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tether_core::shadow::{ShadowDocument, VersionCheck};
//!
//! let mut doc = ShadowDocument::new("lamp");
//! assert_eq!(doc.check_version(3), VersionCheck::Newer);
//! doc.apply_update(3, &json!({ "desired": { "on": true } }));
//!
//! // A redelivered or reordered response can never roll the document back
//! assert_eq!(doc.check_version(2), VersionCheck::Stale);
//! assert_eq!(doc.version(), Some(3));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod jobs;
pub mod registry;
pub mod shadow;
pub mod state;
pub mod token;
pub mod topics;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use jobs::{JobExecution, JobStatus};
pub use registry::{CorrelationRegistry, Rejection, Resolution};
pub use shadow::{ShadowDocument, VersionCheck};
pub use token::ClientToken;
pub use topics::{
    topic_matches, JobRequest, JobTopic, ResponseStatus, ShadowOperation, ShadowTopic, ThingTopic,
    TopicKind, Topics,
};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default reserved topic prefix used by the cloud shadow and jobs services.
pub const DEFAULT_TOPIC_PREFIX: &str = "$aws";

/// Maximum length of a client token accepted by the services.
pub const MAX_CLIENT_TOKEN_LEN: usize = 64;

/// Maximum length of a thing name.
pub const MAX_THING_NAME_LEN: usize = 128;

/// Maximum length of a job id.
pub const MAX_JOB_ID_LEN: usize = 64;
