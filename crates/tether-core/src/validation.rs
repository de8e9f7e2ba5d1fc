//! # Validation Module
//!
//! Identifier validation for thing names, job ids, client ids and tokens.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Caller API (tether-sync handles)                             │
//! │  ├── THIS MODULE: names are checked before a topic is built            │
//! │  └── Bad input fails the call, nothing is published                    │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Topic builder                                                │
//! │  └── Only validated names ever reach the wire                          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Cloud service                                                │
//! │  └── Rejects anything else with a protocol error                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Names end up as MQTT topic levels, so the MQTT wildcard characters `+` and
//! `#` and the level separator `/` are never allowed.
//!
//! ## Usage
//! ```rust
//! use tether_core::validation::{validate_thing_name, validate_job_id};
//!
//! validate_thing_name("greenhouse-7").unwrap();
//! validate_job_id("firmware_2024").unwrap();
//! assert!(validate_thing_name("a/b").is_err());
//! ```

use crate::error::ValidationError;
use crate::{MAX_CLIENT_TOKEN_LEN, MAX_JOB_ID_LEN, MAX_THING_NAME_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length of an MQTT client identifier accepted by the broker.
pub const MAX_CLIENT_ID_LEN: usize = 128;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a thing (device) name.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - Only alphanumerics, `-`, `_` and `:`
pub fn validate_thing_name(name: &str) -> ValidationResult<()> {
    validate_identifier("thing_name", name, MAX_THING_NAME_LEN, |c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':'
    })
}

/// Validates a job id.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Only alphanumerics, `-` and `_`
///
/// `$next` is a reserved alias and is not a valid job id.
pub fn validate_job_id(job_id: &str) -> ValidationResult<()> {
    validate_identifier("job_id", job_id, MAX_JOB_ID_LEN, |c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_'
    })
}

/// Validates a client token.
///
/// Tokens are echoed back verbatim by the services, so anything printable
/// is accepted as long as it fits.
pub fn validate_client_token(token: &str) -> ValidationResult<()> {
    validate_identifier("client_token", token, MAX_CLIENT_TOKEN_LEN, |c| {
        !c.is_control()
    })
}

/// Validates an MQTT client id.
pub fn validate_client_id(client_id: &str) -> ValidationResult<()> {
    validate_identifier("client_id", client_id, MAX_CLIENT_ID_LEN, |c| {
        !c.is_control() && c != '+' && c != '#' && c != '/'
    })
}

/// Validates a topic the caller publishes to.
///
/// Publish topics must be non-empty and must not contain wildcards.
pub fn validate_publish_topic(topic: &str) -> ValidationResult<()> {
    if topic.is_empty() {
        return Err(ValidationError::Required {
            field: "topic".to_string(),
        });
    }
    if topic.contains(['+', '#']) {
        return Err(ValidationError::InvalidFormat {
            field: "topic".to_string(),
            reason: "wildcards are not allowed in publish topics".to_string(),
        });
    }
    Ok(())
}

/// Validates a subscription filter.
///
/// `#` may only appear as the whole last level, `+` only as a whole level.
pub fn validate_topic_filter(filter: &str) -> ValidationResult<()> {
    if filter.is_empty() {
        return Err(ValidationError::Required {
            field: "topic_filter".to_string(),
        });
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let is_last = index + 1 == levels.len();
        let bad_hash = level.contains('#') && (*level != "#" || !is_last);
        let bad_plus = level.contains('+') && *level != "+";
        if bad_hash || bad_plus {
            return Err(ValidationError::InvalidFormat {
                field: "topic_filter".to_string(),
                reason: format!("misplaced wildcard in level '{}'", level),
            });
        }
    }
    Ok(())
}

fn validate_identifier(
    field: &str,
    value: &str,
    max: usize,
    allowed: impl Fn(char) -> bool,
) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    if let Some(bad) = value.chars().find(|c| !allowed(*c)) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("character '{}' is not allowed", bad.escape_default()),
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
