//! # Shadow Document
//!
//! The locally known copy of one named shadow.
//!
//! ## Version Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Stale-Update Suppression                            │
//! │                                                                         │
//! │   last seen: v7                                                         │
//! │                                                                         │
//! │   accepted v8  ──► Newer  ──► merged, last seen = v8                    │
//! │   accepted v8  ──► Stale  ──► ignored (redelivery)                      │
//! │   delta    v6  ──► Stale  ──► ignored (reordered across reconnect)      │
//! │   delete   v9  ──► Newer  ──► state cleared, last seen stays v9         │
//! │                                                                         │
//! │   The server is the only source of version numbers. The local copy     │
//! │   never moves to a lower version than one it has already seen.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{json, Value};

use crate::state;

/// Result of comparing an incoming version against the last seen one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Strictly greater than anything seen, or nothing seen yet.
    Newer,
    /// Less than or equal to the last seen version.
    Stale,
}

/// Local view of a shadow's `desired`/`reported` trees and version.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowDocument {
    name: String,
    version: Option<u64>,
    desired: Value,
    reported: Value,
    discard_stale: bool,
    in_flight: usize,
}

impl ShadowDocument {
    pub fn new(name: impl Into<String>) -> Self {
        ShadowDocument {
            name: name.into(),
            version: None,
            desired: Value::Null,
            reported: Value::Null,
            discard_stale: true,
            in_flight: 0,
        }
    }

    /// Controls whether stale documents are dropped (the default) or merged
    /// anyway. The version floor never moves down either way.
    pub fn with_discard_stale(mut self, discard_stale: bool) -> Self {
        self.discard_stale = discard_stale;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest version observed from the server.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn desired(&self) -> &Value {
        &self.desired
    }

    pub fn reported(&self) -> &Value {
        &self.reported
    }

    /// The `{ desired, reported }` state object, omitting empty sides.
    pub fn state(&self) -> Value {
        let mut out = json!({});
        if !state::is_empty(&self.desired) {
            out["desired"] = self.desired.clone();
        }
        if !state::is_empty(&self.reported) {
            out["reported"] = self.reported.clone();
        }
        out
    }

    /// Part of `desired` not yet reflected in `reported`.
    pub fn delta(&self) -> Option<Value> {
        state::delta(&self.desired, &self.reported)
    }

    pub fn check_version(&self, version: u64) -> VersionCheck {
        match self.version {
            Some(last) if version <= last => VersionCheck::Stale,
            _ => VersionCheck::Newer,
        }
    }

    /// Raises the version floor without touching state.
    pub fn observe_version(&mut self, version: u64) {
        self.version = Some(self.version.map_or(version, |last| last.max(version)));
    }

    // -------------------------------------------------------------------------
    // In-flight tracking
    // -------------------------------------------------------------------------

    /// Marks a locally issued update as sent but not yet accepted.
    pub fn begin_update(&mut self) {
        self.in_flight += 1;
    }

    /// Marks one in-flight update as resolved (accepted, rejected or timed out).
    pub fn end_update(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    // -------------------------------------------------------------------------
    // Applying server documents
    // -------------------------------------------------------------------------

    fn admit(&mut self, version: u64) -> bool {
        let fresh = self.check_version(version) == VersionCheck::Newer;
        self.observe_version(version);
        fresh || !self.discard_stale
    }

    /// Applies a `get/accepted` document. The full state replaces local state.
    ///
    /// Returns false when the document was stale and dropped.
    pub fn apply_get(&mut self, version: u64, state: &Value) -> bool {
        if !self.admit(version) {
            return false;
        }
        self.desired = state.get("desired").cloned().unwrap_or(Value::Null);
        self.reported = state.get("reported").cloned().unwrap_or(Value::Null);
        true
    }

    /// Applies an `update/accepted` document by merging its partial state.
    pub fn apply_update(&mut self, version: u64, state: &Value) -> bool {
        if !self.admit(version) {
            return false;
        }
        if let Some(desired) = state.get("desired") {
            state::merge(&mut self.desired, desired);
        }
        if let Some(reported) = state.get("reported") {
            state::merge(&mut self.reported, reported);
        }
        true
    }

    /// Applies an `update/delta` document. Delta state is a subtree of
    /// `desired`.
    ///
    /// A delta carries the version of the update that produced it, so a delta
    /// equal to the last seen version is still admitted.
    pub fn apply_delta(&mut self, version: u64, delta: &Value) -> bool {
        let fresh = self.version.map_or(true, |last| version >= last);
        self.observe_version(version);
        if !fresh && self.discard_stale {
            return false;
        }
        state::merge(&mut self.desired, delta);
        true
    }

    /// Applies a `delete/accepted`. State is cleared, the version floor is kept.
    pub fn apply_delete(&mut self, version: Option<u64>) -> bool {
        if let Some(version) = version {
            if !self.admit(version) {
                return false;
            }
        }
        self.desired = Value::Null;
        self.reported = Value::Null;
        true
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_accepts_any_version() {
        let doc = ShadowDocument::new("lamp");
        assert_eq!(doc.version(), None);
        assert_eq!(doc.check_version(0), VersionCheck::Newer);
        assert_eq!(doc.state(), json!({}));
    }

    #[test]
    fn test_update_merges_and_advances_version() {
        let mut doc = ShadowDocument::new("lamp");
        assert!(doc.apply_update(1, &json!({ "desired": { "value": 5 } })));
        assert!(doc.apply_update(2, &json!({ "reported": { "value": 5 } })));
        assert_eq!(doc.version(), Some(2));
        assert_eq!(
            doc.state(),
            json!({ "desired": { "value": 5 }, "reported": { "value": 5 } })
        );
        assert_eq!(doc.delta(), None);
    }

    #[test]
    fn test_stale_and_duplicate_documents_are_ignored() {
        let mut doc = ShadowDocument::new("lamp");
        assert!(doc.apply_update(5, &json!({ "desired": { "value": 5 } })));
        assert!(!doc.apply_update(5, &json!({ "desired": { "value": 99 } })));
        assert!(!doc.apply_update(3, &json!({ "desired": { "value": 3 } })));
        assert!(!doc.apply_delta(4, &json!({ "value": 4 })));
        assert_eq!(doc.desired(), &json!({ "value": 5 }));
        assert_eq!(doc.version(), Some(5));
    }

    #[test]
    fn test_delta_shares_version_with_its_update() {
        let mut doc = ShadowDocument::new("lamp");
        assert!(doc.apply_update(6, &json!({ "desired": { "level": 2 } })));
        assert!(doc.apply_delta(6, &json!({ "level": 2 })));
        assert!(!doc.apply_delta(5, &json!({ "level": 1 })));
        assert_eq!(doc.desired(), &json!({ "level": 2 }));
    }

    #[test]
    fn test_stale_merge_allowed_when_not_discarding() {
        let mut doc = ShadowDocument::new("lamp").with_discard_stale(false);
        doc.apply_update(5, &json!({ "desired": { "value": 5 } }));
        assert!(doc.apply_update(3, &json!({ "desired": { "other": 1 } })));
        assert_eq!(doc.desired(), &json!({ "value": 5, "other": 1 }));
        assert_eq!(doc.version(), Some(5));
    }

    #[test]
    fn test_get_replaces_state() {
        let mut doc = ShadowDocument::new("lamp");
        doc.apply_update(1, &json!({ "desired": { "a": 1, "b": 2 } }));
        doc.apply_get(4, &json!({ "desired": { "a": 9 }, "reported": { "a": 1 } }));
        assert_eq!(doc.desired(), &json!({ "a": 9 }));
        assert_eq!(doc.delta(), Some(json!({ "a": 9 })));
    }

    #[test]
    fn test_delete_keeps_version_floor() {
        let mut doc = ShadowDocument::new("lamp");
        doc.apply_update(7, &json!({ "desired": { "a": 1 } }));
        assert!(doc.apply_delete(Some(8)));
        assert_eq!(doc.state(), json!({}));
        assert_eq!(doc.version(), Some(8));
        assert_eq!(doc.check_version(8), VersionCheck::Stale);
        assert!(doc.apply_delete(None));
    }

    #[test]
    fn test_observe_version_never_lowers() {
        let mut doc = ShadowDocument::new("lamp");
        doc.observe_version(10);
        doc.observe_version(4);
        assert_eq!(doc.version(), Some(10));
    }

    #[test]
    fn test_in_flight_counter() {
        let mut doc = ShadowDocument::new("lamp");
        doc.begin_update();
        doc.begin_update();
        doc.end_update();
        assert_eq!(doc.in_flight(), 1);
        doc.end_update();
        doc.end_update();
        assert_eq!(doc.in_flight(), 0);
    }

    #[test]
    fn test_monotonic_under_reordering() {
        let mut doc = ShadowDocument::new("lamp");
        let arrivals = [3u64, 1, 4, 2, 6, 5, 6];
        let mut highest = 0;
        for v in arrivals {
            doc.apply_update(v, &json!({ "reported": { "v": v } }));
            highest = highest.max(v);
            assert_eq!(doc.version(), Some(highest));
            assert_eq!(doc.reported()["v"], json!(highest));
        }
    }
}
