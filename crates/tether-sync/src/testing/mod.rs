//! # In-Memory Broker
//!
//! A single-process MQTT broker with shadow and jobs service emulation, for
//! exercising the client without a network.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         MemoryBroker                                    │
//! │                                                                         │
//! │  MemoryConnector ──► MemoryLink ──publish──► route() ──► subscribers    │
//! │                          ▲                      │                       │
//! │                          │                      ├──► watchers           │
//! │                          │                      │                       │
//! │                          │                      ▼                       │
//! │                          │          $aws/things/+/shadow/<op>           │
//! │                          │          $aws/things/+/jobs/...              │
//! │                          │                      │                       │
//! │                          │           ShadowStore / JobStore             │
//! │                          │                      │                       │
//! │                          └──── responses, deltas, notifications ◄──┘    │
//! │                                                                         │
//! │  Fault injection: refuse connects, drop a client, duplicate or          │
//! │  withhold service responses.                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscriptions are per connection (clean session): a reconnecting client
//! starts with none and has to resubscribe.

mod jobs_service;
mod shadow_service;

pub use jobs_service::JobSnapshot;
pub use shadow_service::ShadowSnapshot;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use tether_core::topics::{topic_matches, JobTopic, ShadowTopic, TopicKind, Topics};
use tether_core::JobStatus;

use crate::connector::{Connector, InboundMessage, Link, LinkEvent, OutboundPublish, Qos};
use crate::error::{SyncError, SyncResult};
use crate::protocol::StatusDetails;

use jobs_service::JobStore;
use shadow_service::ShadowStore;

/// A publish produced by an emulated service.
#[derive(Debug, Clone)]
struct Outgoing {
    topic: String,
    payload: Vec<u8>,
}

impl Outgoing {
    fn json(topic: String, body: &Value) -> Self {
        Outgoing {
            topic,
            payload: body.to_string().into_bytes(),
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Broker State
// =============================================================================

struct Connection {
    id: u64,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

type Recording = Arc<Mutex<Vec<InboundMessage>>>;

struct BrokerState {
    topics: Topics,
    connections: HashMap<String, Connection>,
    connect_counts: HashMap<String, usize>,
    next_connection: u64,
    refuse_connects: usize,
    duplicate_responses: bool,
    withhold_responses: bool,
    watchers: Vec<(String, Recording)>,
    shadows: ShadowStore,
    jobs: JobStore,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &[u8]) {
        for (client_id, connection) in &self.connections {
            if connection.filters.iter().any(|f| topic_matches(f, topic)) {
                let message = InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                };
                if connection.tx.send(LinkEvent::Message(message)).is_err() {
                    debug!(client_id = %client_id, "Dropping message for closed link");
                }
            }
        }

        for (filter, recording) in &self.watchers {
            if topic_matches(filter, topic) {
                lock(recording).push(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }

    /// Routes service output produced by a client request.
    fn respond(&mut self, outgoing: Vec<Outgoing>) {
        if self.withhold_responses {
            debug!(count = outgoing.len(), "Withholding service responses");
            return;
        }
        let copies = if self.duplicate_responses { 2 } else { 1 };
        for out in outgoing {
            for _ in 0..copies {
                self.route(&out.topic, &out.payload);
            }
        }
    }

    /// Routes service output that no client asked for.
    fn announce(&mut self, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            self.route(&out.topic, &out.payload);
        }
    }

    fn handle_publish(&mut self, topic: &str, payload: &[u8]) {
        self.route(topic, payload);

        let Ok(parsed) = self.topics.parse(topic) else {
            return;
        };
        let outgoing = match parsed.kind {
            TopicKind::Shadow(ShadowTopic::Request(op)) => {
                self.shadows
                    .handle(&self.topics, &parsed.thing_name, op, payload)
            }
            TopicKind::Job(JobTopic::Request(request)) => {
                self.jobs
                    .handle(&self.topics, &parsed.thing_name, &request, payload)
            }
            _ => return,
        };
        self.respond(outgoing);
    }

    fn disconnect(&mut self, client_id: &str, connection_id: u64) {
        if self
            .connections
            .get(client_id)
            .is_some_and(|c| c.id == connection_id)
        {
            self.connections.remove(client_id);
            debug!(client_id = %client_id, "Client disconnected");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Memory Broker
// =============================================================================

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates a broker serving the default `$aws` topic prefix.
    pub fn new() -> Self {
        Self::with_prefix(tether_core::DEFAULT_TOPIC_PREFIX)
    }

    pub fn with_prefix(prefix: &str) -> Self {
        MemoryBroker {
            inner: Arc::new(Mutex::new(BrokerState {
                topics: Topics::new(prefix),
                connections: HashMap::new(),
                connect_counts: HashMap::new(),
                next_connection: 0,
                refuse_connects: 0,
                duplicate_responses: false,
                withhold_responses: false,
                watchers: Vec::new(),
                shadows: ShadowStore::default(),
                jobs: JobStore::default(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.inner)
    }

    /// Connector that opens links for `client_id`.
    pub fn connector(&self, client_id: &str) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            client_id: client_id.to_string(),
        }
    }

    fn open(&self, client_id: &str) -> SyncResult<MemoryLink> {
        let mut state = self.state();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            debug!(client_id = %client_id, "Refusing connect");
            return Err(SyncError::ConnectionFailed(
                "connection refused by memory broker".into(),
            ));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (tx, rx) = mpsc::unbounded_channel();

        let previous = state.connections.insert(
            client_id.to_string(),
            Connection {
                id,
                filters: Vec::new(),
                tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous
                .tx
                .send(LinkEvent::Closed(Some("session taken over".into())));
        }
        *state.connect_counts.entry(client_id.to_string()).or_default() += 1;
        debug!(client_id = %client_id, connection = id, "Client connected");

        Ok(MemoryLink {
            broker: self.clone(),
            client_id: client_id.to_string(),
            connection_id: id,
            events: rx,
        })
    }

    // -------------------------------------------------------------------------
    // Fault Injection
    // -------------------------------------------------------------------------

    /// Refuses the next `count` connect attempts from any client.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state().refuse_connects = count;
    }

    /// Drops a client's connection as if the network failed.
    /// Returns false if the client was not connected.
    pub fn drop_client(&self, client_id: &str) -> bool {
        match self.state().connections.remove(client_id) {
            Some(connection) => {
                let _ = connection
                    .tx
                    .send(LinkEvent::Closed(Some("connection dropped by broker".into())));
                true
            }
            None => false,
        }
    }

    /// Delivers every service response twice.
    pub fn set_duplicate_responses(&self, enabled: bool) {
        self.state().duplicate_responses = enabled;
    }

    /// Processes service requests but never answers them.
    pub fn set_withhold_responses(&self, enabled: bool) {
        self.state().withhold_responses = enabled;
    }

    // -------------------------------------------------------------------------
    // Traffic
    // -------------------------------------------------------------------------

    /// Publishes from outside any client session.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        self.state().route(topic, &payload);
    }

    pub fn publish_json(&self, topic: &str, body: &Value) {
        self.publish(topic, body.to_string());
    }

    /// Records every message routed to `filter` from now on.
    pub fn watch(&self, filter: &str) -> Watcher {
        let recording = Recording::default();
        self.state()
            .watchers
            .push((filter.to_string(), Arc::clone(&recording)));
        Watcher { recording }
    }

    /// Live subscriptions of a client's current connection, in order.
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.state()
            .connections
            .get(client_id)
            .map(|c| c.filters.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state().connections.contains_key(client_id)
    }

    pub fn connect_count(&self, client_id: &str) -> usize {
        self.state()
            .connect_counts
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Shadow Service
    // -------------------------------------------------------------------------

    pub fn shadow(&self, thing_name: &str) -> Option<ShadowSnapshot> {
        self.state().shadows.snapshot(thing_name)
    }

    /// Updates a shadow as another writer would, announcing the accepted
    /// update and any delta.
    pub fn write_shadow(&self, thing_name: &str, state: Value) {
        let mut guard = self.state();
        let broker = &mut *guard;
        let outgoing = broker.shadows.write(&broker.topics, thing_name, &state);
        broker.announce(outgoing);
    }

    /// Updates a shadow without publishing anything, like a write the device
    /// never heard about.
    pub fn write_shadow_unannounced(&self, thing_name: &str, state: Value) {
        self.state().shadows.write_silently(thing_name, &state);
    }

    // -------------------------------------------------------------------------
    // Jobs Service
    // -------------------------------------------------------------------------

    /// Queues a job execution for a thing.
    pub fn create_job(&self, thing_name: &str, job_id: &str, document: Value) {
        let mut guard = self.state();
        let broker = &mut *guard;
        let outgoing = broker
            .jobs
            .create(&broker.topics, thing_name, job_id, document);
        broker.announce(outgoing);
    }

    /// Cancels a pending execution. Returns false if it was not pending.
    pub fn cancel_job(&self, thing_name: &str, job_id: &str) -> bool {
        let mut guard = self.state();
        let broker = &mut *guard;
        match broker.jobs.cancel(&broker.topics, thing_name, job_id) {
            Some(outgoing) => {
                broker.announce(outgoing);
                true
            }
            None => false,
        }
    }

    pub fn job(&self, thing_name: &str, job_id: &str) -> Option<JobSnapshot> {
        self.state().jobs.snapshot(thing_name, job_id)
    }

    pub fn job_status(&self, thing_name: &str, job_id: &str) -> Option<JobStatus> {
        self.job(thing_name, job_id).map(|job| job.status)
    }

    pub fn job_details(&self, thing_name: &str, job_id: &str) -> Option<StatusDetails> {
        self.job(thing_name, job_id).and_then(|job| job.status_details)
    }
}

/// Messages captured by [`MemoryBroker::watch`].
#[derive(Clone)]
pub struct Watcher {
    recording: Recording,
}

impl Watcher {
    pub fn messages(&self) -> Vec<InboundMessage> {
        lock(&self.recording).clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.recording)
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.recording)
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.recording).len()
    }
}

// =============================================================================
// Connector and Link
// =============================================================================

/// Opens [`MemoryLink`]s for one client id.
pub struct MemoryConnector {
    broker: MemoryBroker,
    client_id: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> SyncResult<Box<dyn Link>> {
        Ok(Box::new(self.broker.open(&self.client_id)?))
    }
}

pub struct MemoryLink {
    broker: MemoryBroker,
    client_id: String,
    connection_id: u64,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl MemoryLink {
    fn with_connection<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> SyncResult<T> {
        let mut state = self.broker.state();
        let current = state
            .connections
            .get(&self.client_id)
            .is_some_and(|c| c.id == self.connection_id);
        if !current {
            return Err(SyncError::Transport("connection closed".into()));
        }
        Ok(f(&mut state))
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn publish(&mut self, publish: &OutboundPublish) -> SyncResult<()> {
        self.with_connection(|state| state.handle_publish(&publish.topic, &publish.payload))
    }

    async fn subscribe(&mut self, filter: &str, _qos: Qos) -> SyncResult<()> {
        let client_id = self.client_id.clone();
        self.with_connection(|state| {
            if let Some(connection) = state.connections.get_mut(&client_id) {
                if !connection.filters.iter().any(|f| f == filter) {
                    connection.filters.push(filter.to_string());
                }
            }
        })
    }

    async fn unsubscribe(&mut self, filter: &str) -> SyncResult<()> {
        let client_id = self.client_id.clone();
        self.with_connection(|state| {
            if let Some(connection) = state.connections.get_mut(&client_id) {
                connection.filters.retain(|f| f != filter);
            }
        })
    }

    async fn next_event(&mut self) -> LinkEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| LinkEvent::Closed(Some("connection closed".into())))
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        self.broker
            .state()
            .disconnect(&self.client_id, self.connection_id);
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker
            .state()
            .disconnect(&self.client_id, self.connection_id);
    }
}

#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
