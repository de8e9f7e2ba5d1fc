//! Shadow service emulation: versioned documents, `409` on version
//! mismatch, deltas on desired changes.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use tether_core::state;
use tether_core::topics::{ResponseStatus, ShadowOperation, Topics};

use super::{now_secs, Outgoing};
use crate::protocol::{decode, ShadowRequest, TokenEnvelope};

/// A shadow as the service stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowSnapshot {
    pub desired: Value,
    pub reported: Value,
    pub version: u64,
    pub exists: bool,
}

#[derive(Debug, Default)]
struct ShadowRecord {
    desired: Value,
    reported: Value,
    version: u64,
    exists: bool,
}

impl ShadowRecord {
    /// Merges an update's `state` and bumps the version.
    fn apply(&mut self, update: &Value) -> u64 {
        if let Some(desired) = update.get("desired") {
            state::merge(&mut self.desired, desired);
        }
        if let Some(reported) = update.get("reported") {
            state::merge(&mut self.reported, reported);
        }
        self.version += 1;
        self.exists = true;
        self.version
    }

    fn delta(&self) -> Option<Value> {
        state::delta(&self.desired, &self.reported)
    }

    fn state(&self) -> Value {
        let mut out = Map::new();
        if !state::is_empty(&self.desired) {
            out.insert("desired".into(), self.desired.clone());
        }
        if !state::is_empty(&self.reported) {
            out.insert("reported".into(), self.reported.clone());
        }
        if let Some(delta) = self.delta() {
            out.insert("delta".into(), delta);
        }
        Value::Object(out)
    }
}

#[derive(Debug, Default)]
pub(super) struct ShadowStore {
    records: HashMap<String, ShadowRecord>,
}

impl ShadowStore {
    pub(super) fn snapshot(&self, thing_name: &str) -> Option<ShadowSnapshot> {
        self.records.get(thing_name).map(|r| ShadowSnapshot {
            desired: r.desired.clone(),
            reported: r.reported.clone(),
            version: r.version,
            exists: r.exists,
        })
    }

    pub(super) fn handle(
        &mut self,
        topics: &Topics,
        thing_name: &str,
        op: ShadowOperation,
        payload: &[u8],
    ) -> Vec<Outgoing> {
        let request: ShadowRequest = match decode(payload) {
            Ok(request) => request,
            Err(_) => {
                let token = decode::<TokenEnvelope>(payload)
                    .ok()
                    .and_then(|t| t.client_token);
                return vec![rejected(topics, thing_name, op, 400, "Invalid JSON", token)];
            }
        };
        let token = Some(request.client_token.clone());

        match op {
            ShadowOperation::Get => self.get(topics, thing_name, token),
            ShadowOperation::Update => self.update(topics, thing_name, &request),
            ShadowOperation::Delete => self.delete(topics, thing_name, token),
        }
    }

    fn get(&self, topics: &Topics, thing_name: &str, token: Option<String>) -> Vec<Outgoing> {
        match self.records.get(thing_name).filter(|r| r.exists) {
            Some(record) => vec![Outgoing::json(
                topics.shadow_response(thing_name, ShadowOperation::Get, ResponseStatus::Accepted),
                &json!({
                    "state": record.state(),
                    "metadata": {},
                    "version": record.version,
                    "timestamp": now_secs(),
                    "clientToken": token,
                }),
            )],
            None => vec![not_found(topics, thing_name, ShadowOperation::Get, token)],
        }
    }

    fn update(&mut self, topics: &Topics, thing_name: &str, request: &ShadowRequest) -> Vec<Outgoing> {
        let token = Some(request.client_token.clone());
        let Some(update) = request.state.as_ref().filter(|s| s.is_object()) else {
            return vec![rejected(
                topics,
                thing_name,
                ShadowOperation::Update,
                400,
                "Missing required node: state",
                token,
            )];
        };

        let record = self.records.entry(thing_name.to_string()).or_default();
        if let Some(expected) = request.version {
            if expected != record.version {
                return vec![rejected(
                    topics,
                    thing_name,
                    ShadowOperation::Update,
                    409,
                    "Version conflict",
                    token,
                )];
            }
        }

        announce_update(topics, thing_name, record, update, token)
    }

    fn delete(&mut self, topics: &Topics, thing_name: &str, token: Option<String>) -> Vec<Outgoing> {
        let Some(record) = self.records.get_mut(thing_name).filter(|r| r.exists) else {
            return vec![not_found(topics, thing_name, ShadowOperation::Delete, token)];
        };

        // The version survives deletion
        record.desired = Value::Null;
        record.reported = Value::Null;
        record.exists = false;
        record.version += 1;

        vec![Outgoing::json(
            topics.shadow_response(thing_name, ShadowOperation::Delete, ResponseStatus::Accepted),
            &json!({
                "version": record.version,
                "timestamp": now_secs(),
                "clientToken": token,
            }),
        )]
    }

    /// An update from some other writer. No version check, no client token.
    pub(super) fn write(&mut self, topics: &Topics, thing_name: &str, update: &Value) -> Vec<Outgoing> {
        let record = self.records.entry(thing_name.to_string()).or_default();
        announce_update(topics, thing_name, record, update, None)
    }

    pub(super) fn write_silently(&mut self, thing_name: &str, update: &Value) {
        self.records
            .entry(thing_name.to_string())
            .or_default()
            .apply(update);
    }
}

/// Applies an update and builds the accepted response plus any delta.
fn announce_update(
    topics: &Topics,
    thing_name: &str,
    record: &mut ShadowRecord,
    update: &Value,
    token: Option<String>,
) -> Vec<Outgoing> {
    let version = record.apply(update);
    let timestamp = now_secs();

    let mut accepted = json!({
        "state": update,
        "metadata": {},
        "version": version,
        "timestamp": timestamp,
    });
    if let Some(token) = token {
        accepted["clientToken"] = Value::String(token);
    }

    let mut out = vec![Outgoing::json(
        topics.shadow_response(thing_name, ShadowOperation::Update, ResponseStatus::Accepted),
        &accepted,
    )];

    if update.get("desired").is_some_and(Value::is_object) {
        if let Some(delta) = record.delta() {
            out.push(Outgoing::json(
                topics.shadow_delta(thing_name),
                &json!({
                    "version": version,
                    "timestamp": timestamp,
                    "state": delta,
                    "metadata": {},
                }),
            ));
        }
    }
    out
}

fn rejected(
    topics: &Topics,
    thing_name: &str,
    op: ShadowOperation,
    code: u16,
    message: &str,
    token: Option<String>,
) -> Outgoing {
    Outgoing::json(
        topics.shadow_response(thing_name, op, ResponseStatus::Rejected),
        &json!({ "code": code, "message": message, "clientToken": token }),
    )
}

fn not_found(
    topics: &Topics,
    thing_name: &str,
    op: ShadowOperation,
    token: Option<String>,
) -> Outgoing {
    let message = format!("No shadow exists with name: '{}'", thing_name);
    rejected(topics, thing_name, op, 404, &message, token)
}
