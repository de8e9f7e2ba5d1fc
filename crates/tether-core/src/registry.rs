//! # Correlation Registry
//!
//! Maps outstanding client tokens to the callback waiting on their response.
//!
//! ## Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   register(token, deadline, cb)                                         │
//! │            │                                                            │
//! │            ▼                                                            │
//! │      ┌───────────┐  resolve(token, ..)   ┌──────────────────────────┐  │
//! │      │  PENDING  │──────────────────────►│ cb(Accepted | Rejected)  │  │
//! │      └─────┬─────┘                       └──────────────────────────┘  │
//! │            │ sweep(now), now ≥ deadline  ┌──────────────────────────┐  │
//! │            ├────────────────────────────►│ cb(Timeout)              │  │
//! │            │ close_all / close_owner     ┌──────────────────────────┐  │
//! │            └────────────────────────────►│ cb(Closed)               │  │
//! │                                          └──────────────────────────┘  │
//! │                                                                         │
//! │   Each path removes the entry first, so a callback runs at most once.   │
//! │   A late or duplicated response for a removed token is a no-op.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry owns no clock. Deadlines and `now` are supplied by the caller,
//! which keeps it deterministic under test.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Resolution Types
// =============================================================================

/// A service-side refusal of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Numeric codes (shadow service) are stored in their decimal form.
    #[serde(deserialize_with = "code_as_string")]
    pub code: String,

    #[serde(default)]
    pub message: String,

    /// Current server version, when the service reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Rejection {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Rejection {
            code: code.into(),
            message: message.into(),
            version: None,
        }
    }

    /// True for the shadow `409` and the jobs `VersionMismatch` codes.
    pub fn is_version_conflict(&self) -> bool {
        self.code == "409" || self.code == "VersionMismatch"
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

fn code_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Number(i64),
        Text(String),
    }

    Ok(match Code::deserialize(deserializer)? {
        Code::Number(n) => n.to_string(),
        Code::Text(s) => s,
    })
}

/// How a registered request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Accepted(T),
    Rejected(Rejection),
    /// No response arrived before the deadline.
    Timeout,
    /// The owning session or document went away first.
    Closed,
    /// The request was discarded locally and never reached the service.
    Dropped,
}

impl<T> Resolution<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Resolution::Accepted(_))
    }

    /// Short name used in status events: `accepted`, `rejected`, `timeout`,
    /// `closed`, `dropped`.
    pub fn kind(&self) -> &'static str {
        match self {
            Resolution::Accepted(_) => "accepted",
            Resolution::Rejected(_) => "rejected",
            Resolution::Timeout => "timeout",
            Resolution::Closed => "closed",
            Resolution::Dropped => "dropped",
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

type Callback<T> = Box<dyn FnOnce(Resolution<T>) + Send + Sync>;

struct Entry<T> {
    owner: String,
    deadline: Instant,
    callback: Callback<T>,
}

/// A token removed from the registry without a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub token: String,
    pub owner: String,
}

/// Outstanding requests keyed by client token.
///
/// `owner` groups entries (a thing name, or thing/job pair) so they can be
/// closed together when their owner is torn down.
pub struct CorrelationRegistry<T> {
    entries: HashMap<String, Entry<T>>,
}

impl<T> Default for CorrelationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CorrelationRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.entries.len())
            .finish()
    }
}

impl<T> CorrelationRegistry<T> {
    pub fn new() -> Self {
        CorrelationRegistry {
            entries: HashMap::new(),
        }
    }

    /// Records `on_resolve` against `token` until `deadline`.
    ///
    /// Fails with `DuplicateToken` while the same token is outstanding.
    pub fn register<F>(
        &mut self,
        token: impl Into<String>,
        owner: impl Into<String>,
        deadline: Instant,
        on_resolve: F,
    ) -> CoreResult<()>
    where
        F: FnOnce(Resolution<T>) + Send + Sync + 'static,
    {
        let token = token.into();
        if self.entries.contains_key(&token) {
            return Err(CoreError::DuplicateToken(token));
        }
        self.entries.insert(
            token,
            Entry {
                owner: owner.into(),
                deadline,
                callback: Box::new(on_resolve),
            },
        );
        Ok(())
    }

    /// Resolves `token` with `resolution`.
    ///
    /// Returns false for unknown tokens (late, duplicate or foreign).
    pub fn resolve(&mut self, token: &str, resolution: Resolution<T>) -> bool {
        match self.entries.remove(token) {
            Some(entry) => {
                (entry.callback)(resolution);
                true
            }
            None => false,
        }
    }

    /// Drops `token` without running its callback. For requests that never
    /// reached the wire.
    pub fn withdraw(&mut self, token: &str) -> bool {
        self.entries.remove(token).is_some()
    }

    /// Times out every entry whose deadline is at or before `now`.
    ///
    /// Expired entries are returned in deadline order.
    pub fn sweep(&mut self, now: Instant) -> Vec<Expired> {
        let mut due: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(token, entry)| (entry.deadline, token.clone()))
            .collect();
        due.sort();

        self.finish(due.into_iter().map(|(_, token)| token), || {
            Resolution::Timeout
        })
    }

    /// Resolves every entry with `Closed`.
    pub fn close_all(&mut self) -> Vec<Expired> {
        let tokens: Vec<String> = self.entries.keys().cloned().collect();
        self.finish(tokens.into_iter(), || Resolution::Closed)
    }

    /// Resolves every entry belonging to `owner` with `Closed`.
    pub fn close_owner(&mut self, owner: &str) -> Vec<Expired> {
        let tokens: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(token, _)| token.clone())
            .collect();
        self.finish(tokens.into_iter(), || Resolution::Closed)
    }

    fn finish(
        &mut self,
        tokens: impl Iterator<Item = String>,
        resolution: impl Fn() -> Resolution<T>,
    ) -> Vec<Expired> {
        let mut expired = Vec::new();
        for token in tokens {
            if let Some(entry) = self.entries.remove(&token) {
                (entry.callback)(resolution());
                expired.push(Expired {
                    token,
                    owner: entry.owner,
                });
            }
        }
        expired
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    pub fn owner_of(&self, token: &str) -> Option<&str> {
        self.entries.get(token).map(|entry| entry.owner.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of outstanding entries for `owner`.
    pub fn pending_for(&self, owner: &str) -> usize {
        self.entries.values().filter(|e| e.owner == owner).count()
    }

    /// Earliest deadline among outstanding entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
