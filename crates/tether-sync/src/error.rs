//! # Sync Error Types
//!
//! Error types for session, shadow and job operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Rejected (code/msg)    │ │
//! │  │  MissingClientId│  │  Disconnected   │  │  InvalidMessage         │ │
//! │  │  InvalidUrl     │  │  Transport      │  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Operation     │  │    Caller       │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Timeout        │  │  InvalidTrans.  │  │  ChannelError           │ │
//! │  │  Closed         │  │  InvalidInput   │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Timeout ("no answer arrived") is never folded into Rejected           │
//! │  ("the service said no").                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tether_core::{CoreError, Rejection};

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible client failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing client id.
    #[error("Client ID not configured")]
    MissingClientId,

    /// Invalid endpoint URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config or credential file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the broker connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected and offline queueing is disabled.
    #[error("Disconnected from broker")]
    Disconnected,

    /// Connect attempt timed out.
    #[error("Connection timeout after {0} seconds")]
    ConnectTimeout(u64),

    /// Error on an established connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request was discarded by the full offline queue before it was sent.
    #[error("Request dropped by the full offline queue")]
    RequestDropped,

    /// The reconnection policy ran out of attempts.
    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The service rejected the request.
    #[error("Rejected by service ({code}): {message}")]
    Rejected {
        code: String,
        message: String,
        /// Server-side version when the service reported one.
        version: Option<u64>,
    },

    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Operation Errors
    // =========================================================================
    /// No response arrived before the operation deadline.
    #[error("Operation timed out waiting for a response")]
    Timeout,

    /// The session or document was closed before the operation completed.
    #[error("Closed before the operation completed")]
    Closed,

    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Illegal job transition or duplicate token.
    #[error("Invalid operation: {0}")]
    InvalidTransition(CoreError),

    /// Bad thing name, job id, topic or similar.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation on a shadow that was never registered.
    #[error("Shadow not registered: {0}")]
    NotRegistered(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal client error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client is shutting down.
    #[error("Client is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<Rejection> for SyncError {
    fn from(rejection: Rejection) -> Self {
        SyncError::Rejected {
            code: rejection.code,
            message: rejection.message,
            version: rejection.version,
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::InvalidInput(v.to_string()),
            CoreError::InvalidTopic(t) => SyncError::InvalidInput(format!("topic {}", t)),
            other => SyncError::InvalidTransition(other),
        }
    }
}

impl From<tether_core::ValidationError> for SyncError {
    fn from(err: tether_core::ValidationError) -> Self {
        SyncError::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<rumqttc::ClientError> for SyncError {
    fn from(err: rumqttc::ClientError) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for SyncError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        use rumqttc::ConnectionError;
        match err {
            ConnectionError::ConnectionRefused(code) => {
                SyncError::ConnectionFailed(format!("refused by broker: {:?}", code))
            }
            ConnectionError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::Transport(other.to_string()),
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if this error is recoverable and the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Connect and operation timeouts
    /// - Temporary disconnections
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Service rejections (resync first, then decide)
    /// - Invalid transitions
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::ConnectTimeout(_)
                | SyncError::Transport(_)
                | SyncError::RequestDropped
                | SyncError::Timeout
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingClientId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error came from the protocol layer.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::Rejected { .. }
                | SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
        )
    }

    /// Returns true for a shadow `409` or jobs `VersionMismatch` rejection.
    pub fn is_version_conflict(&self) -> bool {
        match self {
            SyncError::Rejected { code, .. } => code == "409" || code == "VersionMismatch",
            _ => false,
        }
    }
}
