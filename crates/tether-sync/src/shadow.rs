//! # Shadow Synchronizer
//!
//! Keeps the local copy of every registered shadow in step with the service
//! and correlates get/update/delete requests with their responses.
//!
//! ## Message Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Shadow Synchronizer                              │
//! │                                                                         │
//! │   update(lamp, patch)                                                   │
//! │        │  token T, version = last seen                                  │
//! │        ▼                                                                │
//! │   ┌──────────┐   publish    ┌──────────────┐                            │
//! │   │ registry │─────────────►│ shadow/update│                            │
//! │   │ T ► lamp │              └──────────────┘                            │
//! │   └────┬─────┘                                                          │
//! │        │                                                                │
//! │   update/accepted {T}  ──► merge, resolve T, Status(accepted)          │
//! │   update/accepted {-}  ──► merge, ForeignStateChange                   │
//! │   update/rejected {T}  ──► resolve T, Status(rejected)                 │
//! │   update/delta         ──► merge into desired, Delta                   │
//! │   deadline passed      ──► resolve T, Status(timeout)                  │
//! │                                                                         │
//! │   Every document passes the version check first. Stale documents       │
//! │   change nothing and raise no events.                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The synchronizer is plain data. It is owned by the client's router task,
//! which hands it parsed service messages and publishes what it returns.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::topics::{ResponseStatus, ShadowOperation, ShadowTopic, Topics};
use tether_core::validation::validate_thing_name;
use tether_core::{ClientToken, CorrelationRegistry, Resolution, ShadowDocument};

use crate::config::ShadowSection;
use crate::connector::{OutboundPublish, Qos};
use crate::error::{SyncError, SyncResult};
use crate::events::{
    ClientEvent, DeltaEvent, ForeignStateChange, PendingOperation, ShadowResponse, ShadowStatus,
};
use crate::protocol::{decode, encode, RejectedBody, ShadowAccepted, ShadowDelta, ShadowRequest};

/// How many settled tokens are remembered to recognise redelivered responses.
const RECENT_TOKENS: usize = 128;

/// Per-shadow registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Do not subscribe to `update/delta` and raise no delta events.
    pub ignore_deltas: bool,
    /// Overrides `shadow.discard_stale` for this shadow.
    pub discard_stale: Option<bool>,
    /// Overrides `shadow.enable_versioning` for this shadow.
    pub enable_versioning: Option<bool>,
}

impl RegisterOptions {
    pub fn ignore_deltas() -> Self {
        RegisterOptions {
            ignore_deltas: true,
            ..Default::default()
        }
    }
}

struct Registered {
    document: ShadowDocument,
    ignore_deltas: bool,
    versioning: bool,
}

struct InFlight {
    thing_name: String,
    operation: ShadowOperation,
}

/// A request ready to publish plus the handle that resolves with its outcome.
pub type ShadowRequestOut = (OutboundPublish, PendingOperation<ShadowResponse>);

pub struct ShadowSynchronizer {
    topics: Topics,
    operation_timeout: Duration,
    enable_versioning: bool,
    discard_stale: bool,
    shadows: BTreeMap<String, Registered>,
    registry: CorrelationRegistry<ShadowResponse>,
    in_flight: HashMap<String, InFlight>,
    recent: VecDeque<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ShadowSynchronizer {
    pub fn new(
        topics: Topics,
        settings: &ShadowSection,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        ShadowSynchronizer {
            topics,
            operation_timeout: settings.operation_timeout(),
            enable_versioning: settings.enable_versioning,
            discard_stale: settings.discard_stale,
            shadows: BTreeMap::new(),
            registry: CorrelationRegistry::new(),
            in_flight: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_TOKENS),
            events,
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers a shadow. Returns the filters to subscribe, empty when the
    /// name was already registered.
    pub fn register(&mut self, thing_name: &str, options: RegisterOptions) -> SyncResult<Vec<String>> {
        validate_thing_name(thing_name)?;
        if self.shadows.contains_key(thing_name) {
            debug!(thing_name = %thing_name, "Shadow already registered");
            return Ok(Vec::new());
        }

        let discard_stale = options.discard_stale.unwrap_or(self.discard_stale);
        let versioning = options.enable_versioning.unwrap_or(self.enable_versioning);
        self.shadows.insert(
            thing_name.to_string(),
            Registered {
                document: ShadowDocument::new(thing_name).with_discard_stale(discard_stale),
                ignore_deltas: options.ignore_deltas,
                versioning,
            },
        );

        info!(
            thing_name = %thing_name,
            ignore_deltas = options.ignore_deltas,
            versioning,
            "Shadow registered"
        );
        Ok(self.topics.shadow_filters(thing_name, !options.ignore_deltas))
    }

    /// Forgets a shadow. Its pending operations resolve as closed. Returns the
    /// filters to unsubscribe.
    pub fn unregister(&mut self, thing_name: &str) -> SyncResult<Vec<String>> {
        let registered = self
            .shadows
            .remove(thing_name)
            .ok_or_else(|| SyncError::NotRegistered(thing_name.to_string()))?;

        for expired in self.registry.close_owner(thing_name) {
            self.in_flight.remove(&expired.token);
        }

        info!(thing_name = %thing_name, "Shadow unregistered");
        Ok(self
            .topics
            .shadow_filters(thing_name, !registered.ignore_deltas))
    }

    pub fn is_registered(&self, thing_name: &str) -> bool {
        self.shadows.contains_key(thing_name)
    }

    pub fn names(&self) -> Vec<String> {
        self.shadows.keys().cloned().collect()
    }

    /// The local document of a registered shadow.
    pub fn document(&self, thing_name: &str) -> Option<&ShadowDocument> {
        self.shadows.get(thing_name).map(|r| &r.document)
    }

    /// Outstanding requests across all shadows.
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.next_deadline()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn get(&mut self, thing_name: &str, now: Instant) -> SyncResult<ShadowRequestOut> {
        self.request(thing_name, ShadowOperation::Get, None, now)
    }

    /// Builds an update carrying `patch` (`{ desired?, reported? }`).
    pub fn update(&mut self, thing_name: &str, patch: Value, now: Instant) -> SyncResult<ShadowRequestOut> {
        if !patch.is_object() {
            return Err(SyncError::InvalidInput(
                "shadow update state must be a JSON object".to_string(),
            ));
        }
        self.request(thing_name, ShadowOperation::Update, Some(patch), now)
    }

    pub fn delete(&mut self, thing_name: &str, now: Instant) -> SyncResult<ShadowRequestOut> {
        self.request(thing_name, ShadowOperation::Delete, None, now)
    }

    fn request(
        &mut self,
        thing_name: &str,
        operation: ShadowOperation,
        state: Option<Value>,
        now: Instant,
    ) -> SyncResult<ShadowRequestOut> {
        let registered = self
            .shadows
            .get_mut(thing_name)
            .ok_or_else(|| SyncError::NotRegistered(thing_name.to_string()))?;

        let token = ClientToken::generate();
        let version = match operation {
            ShadowOperation::Update if registered.versioning => registered.document.version(),
            _ => None,
        };
        let payload = encode(&ShadowRequest {
            state,
            client_token: token.to_string(),
            version,
        })?;

        let (pending, outcome) = PendingOperation::new(token.clone());
        let events = self.events.clone();
        let status_thing = thing_name.to_string();
        let status_token = token.clone();
        self.registry.register(
            token.as_str(),
            thing_name,
            now + self.operation_timeout,
            move |resolution: Resolution<ShadowResponse>| {
                let _ = events.send(ClientEvent::Status(ShadowStatus {
                    thing_name: status_thing,
                    operation,
                    client_token: status_token,
                    resolution: resolution.clone(),
                }));
                let _ = outcome.send(resolution);
            },
        )?;

        if operation == ShadowOperation::Update {
            registered.document.begin_update();
        }
        self.in_flight.insert(
            token.to_string(),
            InFlight {
                thing_name: thing_name.to_string(),
                operation,
            },
        );

        debug!(
            thing_name = %thing_name,
            operation = %operation,
            token = %token,
            version = ?version,
            "Shadow request issued"
        );

        let publish = OutboundPublish {
            topic: self.topics.shadow_request(thing_name, operation),
            payload,
            qos: Qos::AtLeastOnce,
            retain: false,
        };
        Ok((publish, pending))
    }

    /// Forgets a request that never reached the connection. Its handle reads
    /// as closed and no status event is raised.
    pub fn withdraw(&mut self, token: &ClientToken) {
        self.registry.withdraw(token.as_str());
        self.settle(token.as_str());
    }

    /// Fails a request the offline queue discarded before it was sent.
    /// Returns false when the token is not one of ours.
    pub fn fail_dropped(&mut self, token: &str) -> bool {
        let Some(thing_name) = self.registry.owner_of(token).map(str::to_string) else {
            return false;
        };
        warn!(thing_name = %thing_name, token = %token, "Shadow request dropped while offline");
        self.settle(token);
        self.registry.resolve(token, Resolution::Dropped)
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Applies one service message for `thing_name`.
    pub fn handle_message(&mut self, thing_name: &str, topic: &ShadowTopic, payload: &[u8]) {
        if !self.shadows.contains_key(thing_name) {
            debug!(thing_name = %thing_name, "Shadow message for unregistered thing");
            return;
        }
        match topic {
            ShadowTopic::Response(op, ResponseStatus::Accepted) => {
                self.on_accepted(thing_name, *op, payload)
            }
            ShadowTopic::Response(op, ResponseStatus::Rejected) => {
                self.on_rejected(thing_name, *op, payload)
            }
            ShadowTopic::Delta => self.on_delta(thing_name, payload),
            ShadowTopic::Request(_) => {}
        }
    }

    fn on_accepted(&mut self, thing_name: &str, op: ShadowOperation, payload: &[u8]) {
        let body: ShadowAccepted = match decode(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(thing_name = %thing_name, error = %e, "Ignoring malformed shadow response");
                return;
            }
        };

        let token = body.client_token.clone();
        match token.as_deref() {
            Some(token) if self.registry.contains(token) => {
                self.settle(token);
                let applied = match self.shadows.get_mut(thing_name) {
                    Some(registered) => apply_accepted(&mut registered.document, op, &body),
                    None => false,
                };
                if !applied {
                    debug!(
                        thing_name = %thing_name,
                        operation = %op,
                        version = ?body.version,
                        "Stale response, local state kept"
                    );
                }
                self.registry.resolve(
                    token,
                    Resolution::Accepted(ShadowResponse {
                        state: body.state,
                        version: body.version,
                        timestamp: body.timestamp,
                    }),
                );
            }
            Some(token) if self.recent.iter().any(|t| t == token) => {
                debug!(thing_name = %thing_name, token = %token, "Duplicate shadow response");
            }
            _ if op == ShadowOperation::Update => self.on_foreign_update(thing_name, body),
            _ => {
                debug!(thing_name = %thing_name, operation = %op, "Response for unknown token");
            }
        }
    }

    fn on_foreign_update(&mut self, thing_name: &str, body: ShadowAccepted) {
        let Some(registered) = self.shadows.get_mut(thing_name) else {
            return;
        };
        let Some(version) = body.version else {
            debug!(thing_name = %thing_name, "Foreign update without version ignored");
            return;
        };
        if !registered.document.apply_update(version, &body.state) {
            debug!(thing_name = %thing_name, version, "Discarding stale foreign update");
            return;
        }

        info!(thing_name = %thing_name, version, "Shadow changed by another writer");
        let _ = self
            .events
            .send(ClientEvent::ForeignStateChange(ForeignStateChange {
                thing_name: thing_name.to_string(),
                state: body.state,
                version: Some(version),
            }));
    }

    fn on_rejected(&mut self, thing_name: &str, op: ShadowOperation, payload: &[u8]) {
        let body: RejectedBody = match decode(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(thing_name = %thing_name, error = %e, "Ignoring malformed rejection");
                return;
            }
        };
        let Some(token) = body
            .client_token
            .as_deref()
            .filter(|t| self.registry.contains(t))
        else {
            debug!(thing_name = %thing_name, operation = %op, "Rejection for unknown token");
            return;
        };
        let token = token.to_string();

        self.settle(&token);
        // The service leaves the version out; report the last one seen here
        let mut rejection = body.rejection;
        if rejection.version.is_none() {
            rejection.version = self
                .shadows
                .get(thing_name)
                .and_then(|registered| registered.document.version());
        }
        warn!(
            thing_name = %thing_name,
            operation = %op,
            code = %rejection.code,
            message = %rejection.message,
            version = ?rejection.version,
            "Shadow operation rejected"
        );
        self.registry
            .resolve(&token, Resolution::Rejected(rejection));
    }

    fn on_delta(&mut self, thing_name: &str, payload: &[u8]) {
        let Some(registered) = self.shadows.get_mut(thing_name) else {
            return;
        };
        if registered.ignore_deltas {
            return;
        }
        let body: ShadowDelta = match decode(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(thing_name = %thing_name, error = %e, "Ignoring malformed delta");
                return;
            }
        };
        if !registered.document.apply_delta(body.version, &body.state) {
            debug!(thing_name = %thing_name, version = body.version, "Discarding stale delta");
            return;
        }

        let _ = self.events.send(ClientEvent::Delta(DeltaEvent {
            thing_name: thing_name.to_string(),
            state: body.state,
            version: body.version,
        }));
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Times out every request whose deadline has passed. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired = self.registry.sweep(now);
        for entry in &expired {
            warn!(thing_name = %entry.owner, token = %entry.token, "Shadow operation timed out");
            self.settle(&entry.token);
        }
        expired.len()
    }

    /// Resolves everything outstanding as closed.
    pub fn close_all(&mut self) {
        for expired in self.registry.close_all() {
            self.settle(&expired.token);
        }
    }

    /// Clears in-flight bookkeeping for a token that is leaving the registry.
    fn settle(&mut self, token: &str) {
        let Some(in_flight) = self.in_flight.remove(token) else {
            return;
        };
        if in_flight.operation == ShadowOperation::Update {
            if let Some(registered) = self.shadows.get_mut(&in_flight.thing_name) {
                registered.document.end_update();
            }
        }
        if self.recent.len() == RECENT_TOKENS {
            self.recent.pop_front();
        }
        self.recent.push_back(token.to_string());
    }
}

/// Applies an accepted response for one of our own requests.
fn apply_accepted(document: &mut ShadowDocument, op: ShadowOperation, body: &ShadowAccepted) -> bool {
    match (op, body.version) {
        (ShadowOperation::Get, Some(version)) => document.apply_get(version, &body.state),
        (ShadowOperation::Update, Some(version)) => document.apply_update(version, &body.state),
        (ShadowOperation::Delete, version) => document.apply_delete(version),
        (_, None) => false,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::topics::ResponseStatus::{Accepted, Rejected};

    fn setup() -> (ShadowSynchronizer, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sync = ShadowSynchronizer::new(Topics::default(), &ShadowSection::default(), tx);
        (sync, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn sent(publish: &OutboundPublish) -> Value {
        serde_json::from_slice(&publish.payload).unwrap()
    }

    fn bytes(body: Value) -> Vec<u8> {
        body.to_string().into_bytes()
    }

    #[test]
    fn test_register_returns_filters_once() {
        let (mut sync, _rx) = setup();
        let filters = sync.register("lamp", RegisterOptions::default()).unwrap();
        assert_eq!(filters.len(), 7);
        assert!(filters.contains(&"$aws/things/lamp/shadow/update/delta".to_string()));
        assert!(sync.register("lamp", RegisterOptions::default()).unwrap().is_empty());

        let filters = sync.register("pump", RegisterOptions::ignore_deltas()).unwrap();
        assert_eq!(filters.len(), 6);
        assert_eq!(sync.names(), vec!["lamp", "pump"]);

        assert!(matches!(
            sync.register("bad/name", RegisterOptions::default()),
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_requests_on_unregistered_shadow_fail() {
        let (mut sync, _rx) = setup();
        let now = Instant::now();
        assert!(matches!(sync.get("lamp", now), Err(SyncError::NotRegistered(_))));
        assert!(matches!(sync.unregister("lamp"), Err(SyncError::NotRegistered(_))));
    }

    #[test]
    fn test_update_rejects_non_object_patch() {
        let (mut sync, _rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        let err = sync.update("lamp", json!(5), Instant::now()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        assert_eq!(sync.pending(), 0);
    }

    #[tokio::test]
    async fn test_update_accepted_merges_and_resolves() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();

        let (publish, pending) = sync
            .update("lamp", json!({ "reported": { "on": true } }), Instant::now())
            .unwrap();
        assert_eq!(publish.topic, "$aws/things/lamp/shadow/update");
        let body = sent(&publish);
        assert!(body.get("version").is_none());
        assert_eq!(sync.document("lamp").unwrap().in_flight(), 1);

        let token = pending.token().to_string();
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Update, Accepted),
            &bytes(json!({ "state": { "reported": { "on": true } }, "version": 3, "clientToken": token })),
        );

        let response = pending.wait().await.unwrap();
        assert_eq!(response.version, Some(3));
        let doc = sync.document("lamp").unwrap();
        assert_eq!(doc.version(), Some(3));
        assert_eq!(doc.reported(), &json!({ "on": true }));
        assert_eq!(doc.in_flight(), 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ClientEvent::Status(s) if s.status_type() == "accepted"));

        // Next update carries the last seen version
        let (publish, _pending) = sync
            .update("lamp", json!({ "reported": { "on": false } }), Instant::now())
            .unwrap();
        assert_eq!(sent(&publish)["version"], 3);
    }

    #[test]
    fn test_versioning_can_be_disabled_per_shadow() {
        let (mut sync, _rx) = setup();
        let options = RegisterOptions {
            enable_versioning: Some(false),
            ..Default::default()
        };
        sync.register("lamp", options).unwrap();
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Update, Accepted),
            &bytes(json!({ "state": {}, "version": 8 })),
        );
        let (publish, _pending) = sync
            .update("lamp", json!({ "reported": { "a": 1 } }), Instant::now())
            .unwrap();
        assert!(sent(&publish).get("version").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_response_resolves_once() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        let (_publish, pending) = sync
            .update("lamp", json!({ "reported": { "n": 1 } }), Instant::now())
            .unwrap();
        let payload = bytes(json!({
            "state": { "reported": { "n": 1 } },
            "version": 2,
            "clientToken": pending.token().as_str(),
        }));
        let topic = ShadowTopic::Response(ShadowOperation::Update, Accepted);
        sync.handle_message("lamp", &topic, &payload);
        sync.handle_message("lamp", &topic, &payload);

        assert!(pending.wait().await.is_ok());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "duplicate must not look foreign: {:?}", events);
    }

    #[tokio::test]
    async fn test_rejection_resolves_and_keeps_state() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        let (_publish, pending) = sync
            .update("lamp", json!({ "desired": { "on": true } }), Instant::now())
            .unwrap();
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Update, Rejected),
            &bytes(json!({ "code": 409, "message": "Version conflict", "clientToken": pending.token().as_str() })),
        );

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(&err, SyncError::Rejected { code, .. } if code == "409"));
        let doc = sync.document("lamp").unwrap();
        assert_eq!(doc.in_flight(), 0);
        assert_eq!(doc.desired(), &Value::Null);
        assert!(matches!(&drain(&mut rx)[0], ClientEvent::Status(s) if s.status_type() == "rejected"));
    }

    #[tokio::test]
    async fn test_rejection_reports_last_known_version() {
        let (mut sync, _rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Update, Accepted),
            &bytes(json!({ "state": { "reported": { "a": 1 } }, "version": 1 })),
        );

        let (_publish, pending) = sync
            .update("lamp", json!({ "reported": { "a": 2 } }), Instant::now())
            .unwrap();
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Update, Rejected),
            &bytes(json!({ "code": 409, "message": "Version conflict", "clientToken": pending.token().as_str() })),
        );
        let err = pending.wait().await.unwrap_err();
        assert!(err.is_version_conflict());
        assert!(matches!(err, SyncError::Rejected { version: Some(1), .. }));

        // A version sent by the service is kept as is
        let (_publish, pending) = sync.get("lamp", Instant::now()).unwrap();
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Get, Rejected),
            &bytes(json!({ "code": 409, "message": "Version conflict", "version": 4, "clientToken": pending.token().as_str() })),
        );
        assert!(matches!(
            pending.wait().await.unwrap_err(),
            SyncError::Rejected { version: Some(4), .. }
        ));
    }

    #[test]
    fn test_foreign_update_and_stale_suppression() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        let topic = ShadowTopic::Response(ShadowOperation::Update, Accepted);

        sync.handle_message("lamp", &topic, &bytes(json!({ "state": { "reported": { "a": 1 } }, "version": 5 })));
        sync.handle_message("lamp", &topic, &bytes(json!({ "state": { "reported": { "a": 0 } }, "version": 4 })));
        sync.handle_message("lamp", &topic, &bytes(json!({ "state": { "reported": { "a": 9 } }, "version": 5 })));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ClientEvent::ForeignStateChange(change) if change.version == Some(5)
        ));
        let doc = sync.document("lamp").unwrap();
        assert_eq!(doc.reported(), &json!({ "a": 1 }));
        assert_eq!(doc.version(), Some(5));
    }

    #[test]
    fn test_delta_events_follow_versions() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();

        sync.handle_message("lamp", &ShadowTopic::Delta, &bytes(json!({ "state": { "level": 2 }, "version": 4 })));
        sync.handle_message("lamp", &ShadowTopic::Delta, &bytes(json!({ "state": { "level": 1 }, "version": 3 })));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![ClientEvent::Delta(DeltaEvent {
                thing_name: "lamp".into(),
                state: json!({ "level": 2 }),
                version: 4,
            })]
        );
        assert_eq!(sync.document("lamp").unwrap().desired(), &json!({ "level": 2 }));
    }

    #[test]
    fn test_ignore_deltas_suppresses_events() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::ignore_deltas()).unwrap();
        sync.handle_message("lamp", &ShadowTopic::Delta, &bytes(json!({ "state": { "level": 2 }, "version": 4 })));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(sync.document("lamp").unwrap().version(), None);
    }

    #[tokio::test]
    async fn test_delete_keeps_version_floor() {
        let (mut sync, _rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Update, Accepted),
            &bytes(json!({ "state": { "reported": { "a": 1 } }, "version": 6 })),
        );

        let (publish, pending) = sync.delete("lamp", Instant::now()).unwrap();
        assert_eq!(publish.topic, "$aws/things/lamp/shadow/delete");
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Delete, Accepted),
            &bytes(json!({ "version": 7, "clientToken": pending.token().as_str() })),
        );
        pending.wait().await.unwrap();

        let doc = sync.document("lamp").unwrap();
        assert_eq!(doc.state(), json!({}));
        assert_eq!(doc.version(), Some(7));
    }

    #[tokio::test]
    async fn test_sweep_times_out() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        let start = Instant::now();
        let (_publish, pending) = sync.get("lamp", start).unwrap();
        let pending_token = pending.token().clone();

        assert_eq!(sync.sweep(start + Duration::from_secs(1)), 0);
        assert_eq!(sync.sweep(start + Duration::from_secs(11)), 1);
        assert_eq!(pending.wait().await.unwrap_err(), SyncError::Timeout);
        assert!(matches!(&drain(&mut rx)[0], ClientEvent::Status(s) if s.status_type() == "timeout"));

        // A late answer after the timeout changes nothing
        sync.handle_message(
            "lamp",
            &ShadowTopic::Response(ShadowOperation::Get, Accepted),
            &bytes(json!({
                "state": { "reported": { "on": true } },
                "version": 7,
                "clientToken": pending_token.as_str(),
            })),
        );
        assert!(drain(&mut rx).is_empty());
        assert_eq!(sync.pending(), 0);
        let doc = sync.document("lamp").unwrap();
        assert_eq!(doc.version(), None);
        assert_eq!(doc.reported(), &Value::Null);
    }

    #[tokio::test]
    async fn test_unregister_closes_pending() {
        let (mut sync, _rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        let (_publish, pending) = sync
            .update("lamp", json!({ "reported": { "a": 1 } }), Instant::now())
            .unwrap();
        let filters = sync.unregister("lamp").unwrap();
        assert_eq!(filters.len(), 7);
        assert_eq!(pending.resolution().await, Resolution::Closed);
        assert!(!sync.is_registered("lamp"));
    }

    #[tokio::test]
    async fn test_withdraw_skips_status_event() {
        let (mut sync, mut rx) = setup();
        sync.register("lamp", RegisterOptions::default()).unwrap();
        let (_publish, pending) = sync
            .update("lamp", json!({ "reported": { "a": 1 } }), Instant::now())
            .unwrap();
        sync.withdraw(pending.token());
        assert_eq!(sync.document("lamp").unwrap().in_flight(), 0);
        assert_eq!(pending.resolution().await, Resolution::Closed);
        assert!(drain(&mut rx).is_empty());
    }
}
