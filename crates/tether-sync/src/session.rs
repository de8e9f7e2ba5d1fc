//! # MQTT Session
//!
//! Broker session with automatic reconnection, resubscription and an offline
//! publish queue.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Session Connection States                            │
//! │                                                                         │
//! │  ┌────────────┐    spawn()     ┌────────────┐                          │
//! │  │Disconnected│ ─────────────► │ Connecting │ ◄──────────────┐         │
//! │  └────────────┘                └─────┬──────┘                │         │
//! │        ▲                   success   │   failure             │         │
//! │        │                       ┌─────┴──────┐                │         │
//! │        │                       ▼            ▼                │         │
//! │        │             ┌────────────┐  ┌─────────────────┐     │         │
//! │        │             │ Connected  │  │ OfflineQueueing │─────┘         │
//! │        │             └─────┬──────┘  └─────────────────┘  backoff      │
//! │        │                   │                 ▲            expired      │
//! │        │                   │ link lost       │            "reconnect"  │
//! │        │                   └─────────────────┘                         │
//! │        │                     "offline"                                 │
//! │        │  close() / retries exhausted                                  │
//! │        └─────────────────────────────────────────  "close"             │
//! │                                                                         │
//! │  ON EVERY CONNECT                                                      │
//! │  ────────────────                                                      │
//! │  1. Re-issue every subscription, in registration order                 │
//! │  2. Emit "connect"                                                     │
//! │  3. Drain the offline queue, one publish per drain tick                │
//! │                                                                         │
//! │  BACKOFF STRATEGY (Exponential with Jitter)                            │
//! │  ───────────────────────────────────────────                           │
//! │  Attempt 1: base (1s)                                                   │
//! │  Attempt 2: 2s                                                          │
//! │  Attempt 3: 4s                                                          │
//! │  ...                                                                    │
//! │  Max: 128s. Resets only after a connection outlives                    │
//! │  minimum_connection_secs.                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All session state lives in one task. Callers talk to it through a
//! [`SessionHandle`] and observe it through the [`SessionEvent`] stream.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tether_core::topics::topic_matches;
use tether_core::validation::{validate_publish_topic, validate_topic_filter};

use crate::config::ClientConfig;
use crate::connector::{Connector, InboundMessage, Link, LinkEvent, OutboundPublish, Qos};
use crate::error::{SyncError, SyncResult};
use crate::queue::{Enqueued, OfflineQueue};

// =============================================================================
// Session State
// =============================================================================

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Not connected and not buffering (closed, or queueing disabled).
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Not connected; publishes are buffered until the next connect.
    OfflineQueueing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::OfflineQueueing => write!(f, "offline-queueing"),
        }
    }
}

/// Lifecycle and traffic events, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection was established (initial or after reconnect).
    Connect,
    /// A reconnect attempt is starting.
    Reconnect,
    /// Connectivity was lost or could not be established.
    Offline,
    /// A transport error. The session keeps going unless it also closes.
    Error(SyncError),
    /// An inbound publish matching a live subscription.
    Message(InboundMessage),
    /// A queued publish was discarded to make room for a newer one.
    Dropped(OutboundPublish),
    /// The session stopped. Emitted exactly once.
    Close,
}

/// Publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: Qos,
    pub retain: bool,
}

impl PublishOptions {
    pub fn at_most_once() -> Self {
        PublishOptions {
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }

    pub fn at_least_once() -> Self {
        PublishOptions {
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// What happened to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    /// Handed to the connection.
    Sent,
    /// Buffered in the offline queue.
    Queued,
    /// Discarded because the bounded offline queue was full.
    Dropped,
}

/// Session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Successful connections, including the first.
    pub connects: u64,
    /// Reconnect attempts started.
    pub reconnect_attempts: u64,
    /// Publishes sent straight to the connection.
    pub sent: u64,
    /// Publishes placed in the offline queue.
    pub queued: u64,
    /// Publishes discarded by the queue bound.
    pub dropped: u64,
    /// Inbound messages delivered as events.
    pub delivered: u64,
    /// Inbound messages matching no live subscription.
    pub discarded: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Commands
// =============================================================================

type Reply<T> = oneshot::Sender<SyncResult<T>>;

enum Command {
    Publish {
        publish: OutboundPublish,
        reply: Reply<PublishReceipt>,
    },
    Subscribe {
        filter: String,
        qos: Qos,
        reply: Reply<()>,
    },
    Unsubscribe {
        filter: String,
        reply: Reply<()>,
    },
    SimulateNetworkFailure {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Subscription {
    filter: String,
    qos: Qos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkFlow {
    Keep,
    Lost,
    Close,
}

enum Attempt {
    Connected(Box<dyn Link>),
    Failed(SyncError),
    Closed,
}

// =============================================================================
// Session Handle
// =============================================================================

/// Handle for interacting with the session from other components.
#[derive(Clone)]
pub struct SessionHandle {
    client_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    stats: watch::Receiver<SessionStats>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("client_id", &self.client_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)?
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publishes `payload` to `topic`.
    ///
    /// While disconnected the publish is queued when offline queueing is on;
    /// otherwise this returns `SyncError::Disconnected`.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> SyncResult<PublishReceipt> {
        let topic = topic.into();
        validate_publish_topic(&topic)?;
        let publish = OutboundPublish {
            topic,
            payload: payload.into(),
            qos: options.qos,
            retain: options.retain,
        };
        self.request(|reply| Command::Publish { publish, reply }).await
    }

    /// Adds a subscription. Idempotent; survives reconnects.
    pub async fn subscribe(&self, filter: impl Into<String>, qos: Qos) -> SyncResult<()> {
        let filter = filter.into();
        validate_topic_filter(&filter)?;
        self.request(|reply| Command::Subscribe { filter, qos, reply })
            .await
    }

    /// Removes a subscription. Idempotent.
    pub async fn unsubscribe(&self, filter: impl Into<String>) -> SyncResult<()> {
        let filter = filter.into();
        self.request(|reply| Command::Unsubscribe { filter, reply })
            .await
    }

    /// Drops the current connection without a DISCONNECT, forcing the
    /// reconnect path. No-op while not connected.
    pub async fn simulate_network_failure(&self) -> SyncResult<()> {
        self.request(|reply| Command::SimulateNetworkFailure { reply })
            .await
    }

    /// Disconnects gracefully and stops the session. Further calls return
    /// `SyncError::Closed`.
    pub async fn close(&self) -> SyncResult<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns true if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Waits until the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> SyncResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Closed)
    }
}

// =============================================================================
// Session Actor
// =============================================================================

/// Session actor. Owns the link, the subscription list and the offline queue.
///
/// ## Usage
/// ```rust,ignore
/// let config = Arc::new(ClientConfig::load(None)?);
/// let connector = Arc::new(MqttConnector::new(config.clone()));
/// let (session, mut events) = Session::spawn(config, connector);
///
/// session.subscribe("sensors/#", Qos::AtLeastOnce).await?;
/// session.publish("sensors/temp", b"21.5".to_vec(), PublishOptions::default()).await?;
///
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// ```
pub struct Session {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    stats: watch::Sender<SessionStats>,
    subscriptions: Vec<Subscription>,
    queue: OfflineQueue,
    offline_announced: bool,
    close_reply: Option<Reply<()>>,
}

impl Session {
    /// Creates the session and spawns its background task. The first connect
    /// attempt starts immediately.
    ///
    /// Returns a handle for commands and the event receiver.
    pub fn spawn(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stats_tx, stats_rx) = watch::channel(SessionStats::default());

        let queue = OfflineQueue::new(
            config.session.offline_queue_max,
            config.session.offline_queue_drop,
        );

        let handle = SessionHandle {
            client_id: Arc::from(config.client_id()),
            commands: commands_tx,
            state: state_rx,
            stats: stats_rx,
        };

        let session = Session {
            config,
            connector,
            commands: commands_rx,
            events: events_tx,
            state: state_tx,
            stats: stats_tx,
            subscriptions: Vec::new(),
            queue,
            offline_announced: false,
            close_reply: None,
        };

        tokio::spawn(session.run());

        (handle, events_rx)
    }

    /// Main session loop.
    async fn run(mut self) {
        info!(client_id = %self.config.client_id(), "Session starting");

        let mut backoff = self.create_backoff();
        let max_attempts = self.config.session.max_reconnect_attempts;
        let mut failures = 0u32;
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                // Backoff has no elapsed-time limit, so this always yields
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.config.session.max_reconnect());
                debug!(?delay, attempt = failures + 1, "Waiting before reconnect");

                if self.wait(delay).await == Flow::Close {
                    break;
                }
                self.stats.send_modify(|s| s.reconnect_attempts += 1);
                self.emit(SessionEvent::Reconnect);
            }
            first_attempt = false;

            self.set_state(ConnectionState::Connecting);

            let link = match self.attempt_connect().await {
                Attempt::Connected(link) => link,
                Attempt::Failed(err) => {
                    failures += 1;
                    error!(error = %err, attempt = failures, "Failed to connect");
                    self.emit(SessionEvent::Error(err));
                    self.go_offline();

                    if max_attempts > 0 && failures >= max_attempts {
                        error!(max_attempts, "Max reconnection attempts reached");
                        self.emit(SessionEvent::Error(SyncError::RetriesExhausted {
                            attempts: failures,
                        }));
                        break;
                    }
                    continue;
                }
                Attempt::Closed => break,
            };

            failures = 0;
            let connected_at = Instant::now();

            match self.connected(link).await {
                Flow::Close => break,
                Flow::Continue => {
                    if connected_at.elapsed() >= self.config.session.minimum_connection() {
                        backoff.reset();
                    }
                    self.go_offline();
                }
            }
        }

        self.finish();
    }

    /// Runs one connect attempt while still serving commands.
    async fn attempt_connect(&mut self) -> Attempt {
        let connector = Arc::clone(&self.connector);
        let mut connect = connector.connect();

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(link) => Attempt::Connected(link),
                        Err(err) => Attempt::Failed(err),
                    };
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Attempt::Closed;
                    };
                    if self.handle_offline(command) == Flow::Close {
                        return Attempt::Closed;
                    }
                }
            }
        }
    }

    /// Sleeps for `delay` while still serving commands.
    async fn wait(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Flow::Close;
                    };
                    if self.handle_offline(command) == Flow::Close {
                        return Flow::Close;
                    }
                }
            }
        }
    }

    /// Serves one connection until it is lost or the session closes.
    async fn connected(&mut self, mut link: Box<dyn Link>) -> Flow {
        self.set_state(ConnectionState::Connected);
        self.stats.send_modify(|s| {
            s.connects += 1;
            s.last_connected_at = Some(Utc::now());
        });

        for subscription in self.subscriptions.clone() {
            if let Err(err) = link.subscribe(&subscription.filter, subscription.qos).await {
                warn!(filter = %subscription.filter, error = %err, "Resubscribe failed");
                self.emit(SessionEvent::Error(err));
                return Flow::Continue;
            }
        }

        info!(
            client_id = %self.config.client_id(),
            subscriptions = self.subscriptions.len(),
            queued = self.queue.len(),
            "Session connected"
        );
        self.offline_announced = false;
        self.emit(SessionEvent::Connect);

        let drain_interval = self.config.session.drain_interval();
        if drain_interval.is_zero() {
            while let Some(publish) = self.queue.pop() {
                if let Err(err) = link.publish(&publish).await {
                    self.queue.requeue_front(publish);
                    self.emit(SessionEvent::Error(err));
                    return Flow::Continue;
                }
                self.stats.send_modify(|s| s.sent += 1);
            }
        }

        let mut drain = tokio::time::interval(drain_interval.max(Duration::from_millis(1)));
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = link.next_event() => match event {
                    LinkEvent::Message(message) => self.deliver(message),
                    LinkEvent::Closed(reason) => {
                        warn!(reason = ?reason, "Connection lost");
                        if let Some(reason) = reason {
                            self.emit(SessionEvent::Error(SyncError::Transport(reason)));
                        }
                        return Flow::Continue;
                    }
                },

                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.handle_connected(link.as_mut(), command).await,
                        None => LinkFlow::Close,
                    };
                    match flow {
                        LinkFlow::Keep => {}
                        LinkFlow::Lost => return Flow::Continue,
                        LinkFlow::Close => {
                            if let Err(err) = link.disconnect().await {
                                debug!(error = %err, "Disconnect failed during close");
                            }
                            return Flow::Close;
                        }
                    }
                }

                _ = drain.tick(), if !self.queue.is_empty() => {
                    if let Some(publish) = self.queue.pop() {
                        if let Err(err) = link.publish(&publish).await {
                            self.queue.requeue_front(publish);
                            self.emit(SessionEvent::Error(err));
                            return Flow::Continue;
                        }
                        self.stats.send_modify(|s| s.sent += 1);
                        if self.queue.is_empty() {
                            debug!("Offline queue drained");
                        }
                    }
                }
            }
        }
    }

    // =========================================================================
    // Command Handling
    // =========================================================================

    fn handle_offline(&mut self, command: Command) -> Flow {
        match command {
            Command::Publish { publish, reply } => {
                let _ = reply.send(self.enqueue(publish));
            }
            Command::Subscribe { filter, qos, reply } => {
                self.record_subscription(filter, qos);
                let _ = reply.send(Ok(()));
            }
            Command::Unsubscribe { filter, reply } => {
                self.subscriptions.retain(|s| s.filter != filter);
                let _ = reply.send(Ok(()));
            }
            Command::SimulateNetworkFailure { reply } => {
                debug!("Network failure requested while not connected");
                let _ = reply.send(Ok(()));
            }
            Command::Close { reply } => {
                self.close_reply = Some(reply);
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    async fn handle_connected(&mut self, link: &mut dyn Link, command: Command) -> LinkFlow {
        match command {
            Command::Publish { publish, reply } => {
                // Keep wire order equal to enqueue order while draining
                if !self.queue.is_empty() {
                    let _ = reply.send(self.enqueue(publish));
                    return LinkFlow::Keep;
                }
                match link.publish(&publish).await {
                    Ok(()) => {
                        self.log_traffic("Published", &publish.topic, publish.payload.len());
                        self.stats.send_modify(|s| s.sent += 1);
                        let _ = reply.send(Ok(PublishReceipt::Sent));
                        LinkFlow::Keep
                    }
                    Err(err) => {
                        let _ = reply.send(self.enqueue(publish));
                        self.emit(SessionEvent::Error(err));
                        LinkFlow::Lost
                    }
                }
            }
            Command::Subscribe { filter, qos, reply } => {
                if !self.record_subscription(filter.clone(), qos) {
                    let _ = reply.send(Ok(()));
                    return LinkFlow::Keep;
                }
                let result = link.subscribe(&filter, qos).await;
                // Recorded either way; a failed subscribe is re-issued on reconnect
                let _ = reply.send(Ok(()));
                match result {
                    Ok(()) => {
                        debug!(filter = %filter, "Subscribed");
                        LinkFlow::Keep
                    }
                    Err(err) => {
                        self.emit(SessionEvent::Error(err));
                        LinkFlow::Lost
                    }
                }
            }
            Command::Unsubscribe { filter, reply } => {
                let before = self.subscriptions.len();
                self.subscriptions.retain(|s| s.filter != filter);
                if self.subscriptions.len() == before {
                    let _ = reply.send(Ok(()));
                    return LinkFlow::Keep;
                }
                let result = link.unsubscribe(&filter).await;
                let _ = reply.send(Ok(()));
                match result {
                    Ok(()) => LinkFlow::Keep,
                    Err(err) => {
                        self.emit(SessionEvent::Error(err));
                        LinkFlow::Lost
                    }
                }
            }
            Command::SimulateNetworkFailure { reply } => {
                warn!(client_id = %self.config.client_id(), "Simulating network failure");
                let _ = reply.send(Ok(()));
                LinkFlow::Lost
            }
            Command::Close { reply } => {
                self.close_reply = Some(reply);
                LinkFlow::Close
            }
        }
    }

    /// Records a subscription. Returns false when it already existed.
    fn record_subscription(&mut self, filter: String, qos: Qos) -> bool {
        match self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            Some(existing) => {
                existing.qos = qos;
                false
            }
            None => {
                self.subscriptions.push(Subscription { filter, qos });
                true
            }
        }
    }

    fn enqueue(&mut self, publish: OutboundPublish) -> SyncResult<PublishReceipt> {
        if !self.config.session.offline_queueing {
            return Err(SyncError::Disconnected);
        }
        match self.queue.push(publish) {
            Enqueued::Queued => {
                self.stats.send_modify(|s| s.queued += 1);
                Ok(PublishReceipt::Queued)
            }
            Enqueued::Displaced(displaced) => {
                self.stats.send_modify(|s| {
                    s.queued += 1;
                    s.dropped += 1;
                });
                debug!(topic = %displaced.topic, "Offline queue full, dropped oldest publish");
                self.emit(SessionEvent::Dropped(displaced));
                Ok(PublishReceipt::Queued)
            }
            Enqueued::Dropped => {
                self.stats.send_modify(|s| s.dropped += 1);
                Ok(PublishReceipt::Dropped)
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn deliver(&mut self, message: InboundMessage) {
        let live = self
            .subscriptions
            .iter()
            .any(|s| topic_matches(&s.filter, &message.topic));
        if !live {
            debug!(topic = %message.topic, "Discarding message without a live subscription");
            self.stats.send_modify(|s| s.discarded += 1);
            return;
        }

        self.log_traffic("Received", &message.topic, message.payload.len());
        self.stats.send_modify(|s| s.delivered += 1);
        self.emit(SessionEvent::Message(message));
    }

    fn log_traffic(&self, what: &str, topic: &str, bytes: usize) {
        if self.config.client.debug {
            info!(topic = %topic, bytes, "{}", what);
        } else {
            debug!(topic = %topic, bytes, "{}", what);
        }
    }

    fn go_offline(&mut self) {
        let state = if self.config.session.offline_queueing {
            ConnectionState::OfflineQueueing
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(state);

        if !self.offline_announced {
            self.offline_announced = true;
            self.emit(SessionEvent::Offline);
        }
    }

    fn finish(&mut self) {
        if !self.queue.is_empty() {
            warn!(pending = self.queue.len(), "Discarding offline queue on close");
            self.queue.clear();
        }
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Close);
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(Ok(()));
        }
        info!(client_id = %self.config.client_id(), "Session stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "Session state change");
            *current = state;
            true
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.session.base_reconnect(),
            max_interval: self.config.session.max_reconnect(),
            multiplier: 2.0,
            randomization_factor: self.config.session.reconnect_jitter,
            max_elapsed_time: None, // No limit on total time
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::testing::{init_tracing, MemoryBroker};

    fn test_config(client_id: &str) -> Arc<ClientConfig> {
        let mut config = ClientConfig::new("memory");
        config.client.id = client_id.to_string();
        config.endpoint.protocol = Protocol::Tcp;
        config.session.reconnect_jitter = 0.0;
        config.session.base_reconnect_ms = 100;
        config.session.max_reconnect_secs = 2;
        config.session.drain_interval_ms = 35;
        Arc::new(config)
    }

    fn spawn(
        broker: &MemoryBroker,
        config: Arc<ClientConfig>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let connector = Arc::new(broker.connector(config.client_id()));
        Session::spawn(config, connector)
    }

    /// Waits for the next event matching `pred`, returning everything skipped.
    async fn until(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("event stream ended; saw {:?}", seen);
    }

    fn message_payloads(events: &[SessionEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Message(m) => Some(m.payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::OfflineQueueing.to_string(), "offline-queueing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_roundtrip_message() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (session, mut events) = spawn(&broker, test_config("dev-1"));

        until(&mut events, |e| *e == SessionEvent::Connect).await;
        assert!(session.is_connected());

        session.subscribe("echo/#", Qos::AtLeastOnce).await.unwrap();
        let receipt = session
            .publish("echo/a", b"hi".to_vec(), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(receipt, PublishReceipt::Sent);

        let seen = until(&mut events, |e| matches!(e, SessionEvent::Message(_))).await;
        assert_eq!(message_payloads(&seen), vec![b"hi".to_vec()]);
        assert_eq!(session.stats().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_resubscribes_in_order() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (session, mut events) = spawn(&broker, test_config("dev-1"));
        until(&mut events, |e| *e == SessionEvent::Connect).await;

        for filter in ["a/1", "b/+", "c/#"] {
            session.subscribe(filter, Qos::AtLeastOnce).await.unwrap();
        }

        // Three consecutive unexpected disconnects, the next connects refused
        for round in 0..3 {
            broker.refuse_next_connects(round);
            assert!(broker.drop_client("dev-1"));
            let seen = until(&mut events, |e| *e == SessionEvent::Connect).await;
            assert!(seen.contains(&SessionEvent::Offline));
            assert!(seen.contains(&SessionEvent::Reconnect));
        }

        assert_eq!(broker.subscriptions("dev-1"), vec!["a/1", "b/+", "c/#"]);

        broker.publish("b/x", b"after".to_vec());
        let seen = until(&mut events, |e| matches!(e, SessionEvent::Message(_))).await;
        assert_eq!(message_payloads(&seen), vec![b"after".to_vec()]);

        let stats = session.stats();
        assert_eq!(stats.connects, 4);
        assert!(stats.reconnect_attempts >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_queue_flushes_in_order() {
        init_tracing();
        let broker = MemoryBroker::new();
        let watcher = broker.watch("q/#");
        let (session, mut events) = spawn(&broker, test_config("dev-1"));
        until(&mut events, |e| *e == SessionEvent::Connect).await;

        broker.refuse_next_connects(2);
        session.simulate_network_failure().await.unwrap();
        until(&mut events, |e| *e == SessionEvent::Offline).await;
        assert_eq!(session.state(), ConnectionState::OfflineQueueing);

        for n in 0..10u8 {
            let receipt = session
                .publish(format!("q/{}", n), vec![n], PublishOptions::at_least_once())
                .await
                .unwrap();
            assert_eq!(receipt, PublishReceipt::Queued);
        }

        until(&mut events, |e| *e == SessionEvent::Connect).await;
        // Publish during the drain lands behind the queue
        session
            .publish("q/late", vec![10], PublishOptions::at_least_once())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let received: Vec<u8> = watcher.payloads().into_iter().map(|p| p[0]).collect();
        assert_eq!(received, (0..=10).collect::<Vec<_>>());
        assert_eq!(session.stats().queued, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_queue_drops_oldest() {
        init_tracing();
        let broker = MemoryBroker::new();
        let watcher = broker.watch("q/#");
        let mut config = (*test_config("dev-1")).clone();
        config.session.offline_queue_max = 3;
        config.session.drain_interval_ms = 0;
        let (session, mut events) = spawn(&broker, Arc::new(config));
        until(&mut events, |e| *e == SessionEvent::Connect).await;

        broker.refuse_next_connects(1);
        session.simulate_network_failure().await.unwrap();
        until(&mut events, |e| *e == SessionEvent::Offline).await;

        for n in 0..5u8 {
            session
                .publish("q/x", vec![n], PublishOptions::default())
                .await
                .unwrap();
        }
        let seen = until(&mut events, |e| *e == SessionEvent::Connect).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let displaced: Vec<u8> = seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Dropped(publish) => Some(publish.payload[0]),
                _ => None,
            })
            .collect();
        assert_eq!(displaced, vec![0, 1]);
        let received: Vec<u8> = watcher.payloads().into_iter().map(|p| p[0]).collect();
        assert_eq!(received, vec![2, 3, 4]);
        assert_eq!(session.stats().dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_without_queueing_fails_when_offline() {
        init_tracing();
        let broker = MemoryBroker::new();
        let mut config = (*test_config("dev-1")).clone();
        config.session.offline_queueing = false;
        broker.refuse_next_connects(100);
        let (session, mut events) = spawn(&broker, Arc::new(config));

        until(&mut events, |e| *e == SessionEvent::Offline).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let err = session
            .publish("t", b"x".to_vec(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_subscribe_applied_on_connect() {
        init_tracing();
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(2);
        let (session, mut events) = spawn(&broker, test_config("dev-1"));

        until(&mut events, |e| *e == SessionEvent::Offline).await;
        session.subscribe("late/+", Qos::AtMostOnce).await.unwrap();
        session.subscribe("gone", Qos::AtMostOnce).await.unwrap();
        session.unsubscribe("gone").await.unwrap();

        until(&mut events, |e| *e == SessionEvent::Connect).await;
        assert_eq!(broker.subscriptions("dev-1"), vec!["late/+"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_topics_are_not_delivered() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (session, mut events) = spawn(&broker, test_config("dev-1"));
        until(&mut events, |e| *e == SessionEvent::Connect).await;

        session.subscribe("keep", Qos::AtMostOnce).await.unwrap();
        session.subscribe("drop", Qos::AtMostOnce).await.unwrap();
        session.unsubscribe("drop").await.unwrap();

        broker.publish("drop", b"1".to_vec());
        broker.publish("keep", b"2".to_vec());
        let seen = until(&mut events, |e| matches!(e, SessionEvent::Message(_))).await;
        assert_eq!(message_payloads(&seen), vec![b"2".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_closes() {
        init_tracing();
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(100);
        let mut config = (*test_config("dev-1")).clone();
        config.session.max_reconnect_attempts = 3;
        let (session, mut events) = spawn(&broker, Arc::new(config));

        let seen = until(&mut events, |e| *e == SessionEvent::Close).await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(SyncError::RetriesExhausted { attempts: 3 }))));
        assert_eq!(
            seen.iter().filter(|e| **e == SessionEvent::Reconnect).count(),
            2
        );
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(session.close().await, Err(SyncError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_emits_close_once_and_stops() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (session, mut events) = spawn(&broker, test_config("dev-1"));
        until(&mut events, |e| *e == SessionEvent::Connect).await;

        session.close().await.unwrap();
        let seen = until(&mut events, |e| *e == SessionEvent::Close).await;
        assert_eq!(seen.iter().filter(|e| **e == SessionEvent::Close).count(), 1);
        assert!(events.recv().await.is_none());
        assert!(!broker.is_connected("dev-1"));

        assert!(matches!(session.close().await, Err(SyncError::Closed)));
        assert!(matches!(
            session
                .publish("t", b"x".to_vec(), PublishOptions::default())
                .await,
            Err(SyncError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff() {
        init_tracing();
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(100);
        let (session, mut events) = spawn(&broker, test_config("dev-1"));
        until(&mut events, |e| *e == SessionEvent::Offline).await;

        session.close().await.unwrap();
        until(&mut events, |e| *e == SessionEvent::Close).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bitmask_scenario_survives_network_failure() {
        init_tracing();
        let broker = MemoryBroker::new();

        let (receiver, mut receiver_events) = spawn(&broker, test_config("receiver"));
        until(&mut receiver_events, |e| *e == SessionEvent::Connect).await;
        receiver.subscribe("bits/test", Qos::AtLeastOnce).await.unwrap();

        let (sender, mut sender_events) = spawn(&broker, test_config("sender"));
        until(&mut sender_events, |e| *e == SessionEvent::Connect).await;

        for bit in 0..48u32 {
            if bit == 20 {
                broker.refuse_next_connects(2);
                sender.simulate_network_failure().await.unwrap();
            }
            let body = serde_json::json!({ "value": 1u64 << bit });
            sender
                .publish("bits/test", body.to_string(), PublishOptions::at_least_once())
                .await
                .unwrap();
        }
        sender
            .publish("bits/test", r#"{"quit":1}"#, PublishOptions::at_least_once())
            .await
            .unwrap();

        let mut mask = 0u64;
        loop {
            let Some(SessionEvent::Message(message)) = receiver_events.recv().await else {
                continue;
            };
            let body: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
            if body.get("quit").is_some() {
                break;
            }
            mask |= body["value"].as_u64().unwrap();
        }
        assert_eq!(mask.count_ones(), 48);
    }
}
