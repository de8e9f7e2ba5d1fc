//! # Device Client
//!
//! Main entry point. Owns the session, the shadow synchronizer and the job
//! executor, and routes every inbound message to the right one.
//!
//! ## Client Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        DeviceClient Architecture                        │
//! │                                                                         │
//! │   DeviceClient ─── ThingShadows ─── Jobs ─── Job                        │
//! │        │                 │            │        │                        │
//! │        │ raw pub/sub     └─────┬──────┴────────┘ commands               │
//! │        │                       ▼                                        │
//! │        │          ┌───────────────────────────────┐                     │
//! │        │          │         Router task           │                     │
//! │        │          │                               │                     │
//! │        │          │  ShadowSynchronizer           │──► ClientEvent      │
//! │        │          │  JobExecutor                  │    stream           │
//! │        │          │  sweep interval               │                     │
//! │        │          └───────────────┬───────────────┘                     │
//! │        │                          │ SessionEvent                        │
//! │        ▼                          │                                     │
//! │   ┌─────────────────────────────────────────────────────────┐          │
//! │   │                     Session actor                       │          │
//! │   │   backoff • offline queue • resubscribe • close-once    │          │
//! │   └─────────────────────────────────────────────────────────┘          │
//! │                                                                         │
//! │   Shadow and jobs topics of registered things are consumed by the      │
//! │   router. Everything else reaches the caller as ClientEvent::Message.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tether_core::topics::{ShadowOperation, ThingTopic, TopicKind, Topics};
use tether_core::ShadowDocument;

use crate::config::ClientConfig;
use crate::connector::{Connector, InboundMessage, MqttConnector, OutboundPublish, Qos};
use crate::error::{SyncError, SyncResult};
use crate::events::{ClientEvent, PendingOperation, ShadowResponse};
use crate::jobs::{JobCommand, JobExecutor, JobReceiver};
use crate::protocol::{decode, JobExecutionData, TokenEnvelope};
use crate::session::{
    ConnectionState, PublishOptions, PublishReceipt, Session, SessionEvent, SessionHandle,
    SessionStats,
};
use crate::shadow::{RegisterOptions, ShadowSynchronizer};

// =============================================================================
// Client Status
// =============================================================================

/// Point-in-time view of the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    pub state: ConnectionState,
    /// Shadow and job requests waiting on a response.
    pub pending_operations: usize,
    /// Registered shadows.
    pub shadows: Vec<String>,
    /// Things with job handlers or notifications.
    pub job_things: Vec<String>,
    /// Tracked job executions not yet terminal.
    pub active_jobs: usize,
    pub session: SessionStats,
}

// =============================================================================
// Commands
// =============================================================================

type Reply<T> = oneshot::Sender<SyncResult<T>>;

enum Command {
    Register {
        thing_name: String,
        options: RegisterOptions,
        reply: Reply<()>,
    },
    Unregister {
        thing_name: String,
        reply: Reply<()>,
    },
    Shadow {
        thing_name: String,
        operation: ShadowOperation,
        patch: Option<Value>,
        reply: Reply<PendingOperation<ShadowResponse>>,
    },
    Document {
        thing_name: String,
        reply: Reply<Option<ShadowDocument>>,
    },
    SubscribeJobs {
        thing_name: String,
        operation: Option<String>,
        reply: Reply<JobReceiver>,
    },
    StartJobs {
        thing_name: String,
        reply: Reply<()>,
    },
    StopJobs {
        thing_name: String,
        reply: Reply<()>,
    },
    Describe {
        thing_name: String,
        job_id: String,
        reply: Reply<PendingOperation<Option<JobExecutionData>>>,
    },
    Status {
        reply: Reply<ClientStatus>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Sends a command to the router and waits for its reply.
async fn request<T>(
    commands: &mpsc::Sender<Command>,
    make: impl FnOnce(Reply<T>) -> Command,
) -> SyncResult<T> {
    let (reply, response) = oneshot::channel();
    commands
        .send(make(reply))
        .await
        .map_err(|_| SyncError::Closed)?;
    response.await.map_err(|_| SyncError::Closed)?
}

// =============================================================================
// Device Client
// =============================================================================

/// Device-side client for the shadow and jobs services.
///
/// ## Usage
/// ```rust,ignore
/// let config = ClientConfig::load(None)?;
/// let (client, mut events) = DeviceClient::connect(config)?;
///
/// let shadows = client.shadows();
/// shadows.register("lamp", RegisterOptions::default()).await?;
/// shadows.update("lamp", json!({ "reported": { "on": true } })).await?.wait().await?;
///
/// while let Some(event) = events.recv().await {
///     if let ClientEvent::Delta(delta) = event {
///         println!("desired changed: {}", delta.state);
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DeviceClient {
    session: SessionHandle,
    commands: mpsc::Sender<Command>,
}

impl DeviceClient {
    /// Validates `config` and starts a client against a real broker. Must be
    /// called inside a tokio runtime.
    pub fn connect(config: ClientConfig) -> SyncResult<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        config.validate()?;
        let config = Arc::new(config);
        let connector = Arc::new(MqttConnector::new(config.clone()));
        Ok(Self::with_connector(config, connector))
    }

    /// Starts a client over any connector.
    pub fn with_connector(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (session, session_events) = Session::spawn(config.clone(), connector);
        let (commands_tx, commands_rx) = mpsc::channel(100);
        let (job_commands_tx, job_commands_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let topics = config.topics();
        let router = Router {
            shadows: ShadowSynchronizer::new(topics.clone(), &config.shadow, events_tx.clone()),
            jobs: JobExecutor::new(
                topics.clone(),
                config.shadow.operation_timeout(),
                job_commands_tx,
                events_tx.clone(),
            ),
            topics,
            config,
            session: session.clone(),
            session_events,
            commands: commands_rx,
            job_commands: job_commands_rx,
            events: events_tx,
            close_reply: None,
        };

        info!(client_id = %session.client_id(), "Starting device client");
        tokio::spawn(router.run());

        (
            DeviceClient {
                session,
                commands: commands_tx,
            },
            events_rx,
        )
    }

    pub fn client_id(&self) -> &str {
        self.session.client_id()
    }

    /// Shadow operations.
    pub fn shadows(&self) -> ThingShadows {
        ThingShadows {
            commands: self.commands.clone(),
        }
    }

    /// Job operations.
    pub fn jobs(&self) -> Jobs {
        Jobs {
            commands: self.commands.clone(),
        }
    }

    // =========================================================================
    // Raw MQTT surface
    // =========================================================================

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> SyncResult<PublishReceipt> {
        self.session.publish(topic, payload, options).await
    }

    /// Subscribes to an application topic. Matching messages arrive as
    /// `ClientEvent::Message`.
    pub async fn subscribe(&self, filter: impl Into<String>, qos: Qos) -> SyncResult<()> {
        self.session.subscribe(filter, qos).await
    }

    pub async fn unsubscribe(&self, filter: impl Into<String>) -> SyncResult<()> {
        self.session.unsubscribe(filter).await
    }

    /// Drops the connection as a network fault would. The client reconnects
    /// on its own.
    pub async fn simulate_network_failure(&self) -> SyncResult<()> {
        self.session.simulate_network_failure().await
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> SyncResult<()> {
        self.session.wait_for_state(target).await
    }

    pub async fn status(&self) -> SyncResult<ClientStatus> {
        request(&self.commands, |reply| Command::Status { reply }).await
    }

    /// Disconnects and stops the client. Pending operations resolve as
    /// closed, then `ClientEvent::Close` is emitted.
    pub async fn close(&self) -> SyncResult<()> {
        request(&self.commands, |reply| Command::Close { reply }).await
    }
}

// =============================================================================
// Shadow Handle
// =============================================================================

/// Handle for shadow operations.
#[derive(Debug, Clone)]
pub struct ThingShadows {
    commands: mpsc::Sender<Command>,
}

impl ThingShadows {
    /// Subscribes to the shadow's response topics (and deltas unless
    /// `options.ignore_deltas`). Registering twice is a no-op.
    pub async fn register(&self, thing_name: &str, options: RegisterOptions) -> SyncResult<()> {
        let thing_name = thing_name.to_string();
        request(&self.commands, |reply| Command::Register {
            thing_name,
            options,
            reply,
        })
        .await
    }

    pub async fn unregister(&self, thing_name: &str) -> SyncResult<()> {
        let thing_name = thing_name.to_string();
        request(&self.commands, |reply| Command::Unregister { thing_name, reply }).await
    }

    pub async fn get(&self, thing_name: &str) -> SyncResult<PendingOperation<ShadowResponse>> {
        self.operation(thing_name, ShadowOperation::Get, None).await
    }

    /// Sends `patch` (`{ "desired": .., "reported": .. }`) as an update.
    pub async fn update(
        &self,
        thing_name: &str,
        patch: Value,
    ) -> SyncResult<PendingOperation<ShadowResponse>> {
        self.operation(thing_name, ShadowOperation::Update, Some(patch))
            .await
    }

    pub async fn delete(&self, thing_name: &str) -> SyncResult<PendingOperation<ShadowResponse>> {
        self.operation(thing_name, ShadowOperation::Delete, None).await
    }

    async fn operation(
        &self,
        thing_name: &str,
        operation: ShadowOperation,
        patch: Option<Value>,
    ) -> SyncResult<PendingOperation<ShadowResponse>> {
        let thing_name = thing_name.to_string();
        request(&self.commands, |reply| Command::Shadow {
            thing_name,
            operation,
            patch,
            reply,
        })
        .await
    }

    /// The locally known document, `None` when not registered.
    pub async fn document(&self, thing_name: &str) -> SyncResult<Option<ShadowDocument>> {
        let thing_name = thing_name.to_string();
        request(&self.commands, |reply| Command::Document { thing_name, reply }).await
    }
}

// =============================================================================
// Jobs Handle
// =============================================================================

/// Handle for job operations.
#[derive(Debug, Clone)]
pub struct Jobs {
    commands: mpsc::Sender<Command>,
}

impl Jobs {
    /// Registers a job handler for `thing_name`. With `operation` set, only
    /// jobs whose document names that operation are delivered to it; the
    /// handler without one receives the rest.
    pub async fn subscribe_to_jobs(
        &self,
        thing_name: &str,
        operation: Option<&str>,
    ) -> SyncResult<JobReceiver> {
        let thing_name = thing_name.to_string();
        let operation = operation.map(str::to_string);
        request(&self.commands, |reply| Command::SubscribeJobs {
            thing_name,
            operation,
            reply,
        })
        .await
    }

    /// Starts delivering pending jobs for `thing_name`.
    pub async fn start_job_notifications(&self, thing_name: &str) -> SyncResult<()> {
        let thing_name = thing_name.to_string();
        request(&self.commands, |reply| Command::StartJobs { thing_name, reply }).await
    }

    pub async fn stop_job_notifications(&self, thing_name: &str) -> SyncResult<()> {
        let thing_name = thing_name.to_string();
        request(&self.commands, |reply| Command::StopJobs { thing_name, reply }).await
    }

    /// Asks the service for one execution. Resolves with `None` when the
    /// service answered without an execution.
    pub async fn describe_execution(
        &self,
        thing_name: &str,
        job_id: &str,
    ) -> SyncResult<PendingOperation<Option<JobExecutionData>>> {
        let thing_name = thing_name.to_string();
        let job_id = job_id.to_string();
        request(&self.commands, |reply| Command::Describe {
            thing_name,
            job_id,
            reply,
        })
        .await
    }
}

// =============================================================================
// Router
// =============================================================================

struct Router {
    config: Arc<ClientConfig>,
    topics: Topics,
    session: SessionHandle,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    job_commands: mpsc::Receiver<JobCommand>,
    shadows: ShadowSynchronizer,
    jobs: JobExecutor,
    events: mpsc::UnboundedSender<ClientEvent>,
    close_reply: Option<Reply<()>>,
}

/// Registry deadlines follow tokio's clock so paused-time tests see them.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl Router {
    async fn run(mut self) {
        // tokio rejects a zero period; configs built in code skip validation
        let period = self.config.shadow.sweep_interval().max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut detached = false;

        loop {
            tokio::select! {
                event = self.session_events.recv() => match event {
                    Some(SessionEvent::Close) | None => break,
                    Some(event) => self.on_session_event(event).await,
                },
                command = self.commands.recv(), if !detached => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        // Every DeviceClient handle is gone
                        detached = true;
                        let _ = self.session.close().await;
                    }
                },
                Some(command) = self.job_commands.recv() => {
                    self.on_job_command(command).await;
                }
                _ = sweep.tick() => {
                    let now = now();
                    let expired = self.shadows.sweep(now) + self.jobs.sweep(now);
                    if expired > 0 {
                        debug!(expired, "Swept expired requests");
                    }
                }
            }
        }

        self.shadows.close_all();
        self.jobs.close_all();
        let _ = self.events.send(ClientEvent::Close);
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(Ok(()));
        }
        info!(client_id = %self.session.client_id(), "Device client stopped");
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connect => {
                let _ = self.events.send(ClientEvent::Connect);
                for (token, publish) in self.jobs.on_connect(now()) {
                    if let Err(e) = self.send_request(publish).await {
                        warn!(error = %e, "Could not request next job after connect");
                        self.jobs.withdraw(&token);
                    }
                }
            }
            SessionEvent::Reconnect => {
                let _ = self.events.send(ClientEvent::Reconnect);
            }
            SessionEvent::Offline => {
                let _ = self.events.send(ClientEvent::Offline);
            }
            SessionEvent::Error(e) => {
                let _ = self.events.send(ClientEvent::Error(e));
            }
            SessionEvent::Message(message) => self.route(message),
            SessionEvent::Dropped(publish) => self.fail_dropped(&publish),
            SessionEvent::Close => {}
        }
    }

    /// Resolves the request behind a publish the offline queue gave up on.
    fn fail_dropped(&mut self, publish: &OutboundPublish) {
        let Ok(TokenEnvelope {
            client_token: Some(token),
        }) = decode::<TokenEnvelope>(&publish.payload)
        else {
            return;
        };
        if !self.shadows.fail_dropped(&token) && !self.jobs.fail_dropped(&token) {
            debug!(topic = %publish.topic, "Dropped publish carried no pending request");
        }
    }

    /// Hands service topics of known things to their component and forwards
    /// everything else.
    fn route(&mut self, message: InboundMessage) {
        match self.topics.parse(&message.topic) {
            Ok(ThingTopic {
                thing_name,
                kind: TopicKind::Shadow(topic),
            }) if self.shadows.is_registered(&thing_name) => {
                self.shadows
                    .handle_message(&thing_name, &topic, &message.payload);
            }
            Ok(ThingTopic {
                thing_name,
                kind: TopicKind::Job(topic),
            }) if self.jobs.is_tracking(&thing_name) => {
                self.jobs.handle_message(&thing_name, &topic, &message.payload);
            }
            _ => {
                let _ = self.events.send(ClientEvent::Message(message));
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Register {
                thing_name,
                options,
                reply,
            } => {
                let result = match self.shadows.register(&thing_name, options) {
                    Ok(filters) => self.subscribe_all(filters).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            Command::Unregister { thing_name, reply } => {
                let result = match self.shadows.unregister(&thing_name) {
                    Ok(filters) => self.unsubscribe_all(filters).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            Command::Shadow {
                thing_name,
                operation,
                patch,
                reply,
            } => {
                let now = now();
                let built = match operation {
                    ShadowOperation::Get => self.shadows.get(&thing_name, now),
                    ShadowOperation::Update => {
                        self.shadows
                            .update(&thing_name, patch.unwrap_or(Value::Null), now)
                    }
                    ShadowOperation::Delete => self.shadows.delete(&thing_name, now),
                };
                let result = match built {
                    Ok((publish, pending)) => match self.send_request(publish).await {
                        Ok(()) => Ok(pending),
                        Err(e) => {
                            self.shadows.withdraw(pending.token());
                            Err(e)
                        }
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            Command::Document { thing_name, reply } => {
                let _ = reply.send(Ok(self.shadows.document(&thing_name).cloned()));
            }

            Command::SubscribeJobs {
                thing_name,
                operation,
                reply,
            } => {
                let result = match self.jobs.subscribe(&thing_name, operation.as_deref()) {
                    Ok((filters, receiver)) => self.subscribe_all(filters).await.map(|()| receiver),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            Command::StartJobs { thing_name, reply } => {
                let result = match self.jobs.start_notifications(&thing_name, now()) {
                    Ok((filters, token, publish)) => {
                        let sent = match self.subscribe_all(filters).await {
                            Ok(()) => self.send_request(publish).await,
                            Err(e) => Err(e),
                        };
                        if sent.is_err() {
                            self.jobs.withdraw(&token);
                        }
                        sent
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            Command::StopJobs { thing_name, reply } => {
                let filters = self.jobs.stop_notifications(&thing_name);
                let _ = reply.send(self.unsubscribe_all(filters).await);
            }

            Command::Describe {
                thing_name,
                job_id,
                reply,
            } => {
                let result = match self.jobs.describe(&thing_name, &job_id, now()) {
                    Ok((filters, publish, pending)) => {
                        let sent = match self.subscribe_all(filters).await {
                            Ok(()) => self.send_request(publish).await,
                            Err(e) => Err(e),
                        };
                        match sent {
                            Ok(()) => Ok(pending),
                            Err(e) => {
                                self.jobs.withdraw(pending.token());
                                Err(e)
                            }
                        }
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }

            Command::Close { reply } => {
                info!(client_id = %self.session.client_id(), "Closing device client");
                match self.session.close().await {
                    // Finished once the session reports Close
                    Ok(()) => self.close_reply = Some(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    async fn on_job_command(&mut self, command: JobCommand) {
        match command {
            JobCommand::Update {
                thing_name,
                job_id,
                status,
                details,
                reply,
            } => {
                let result = match self
                    .jobs
                    .update_status(&thing_name, &job_id, status, details, now())
                {
                    Ok((publish, pending)) => match self.send_request(publish).await {
                        Ok(()) => Ok(pending),
                        Err(e) => {
                            self.jobs.withdraw(pending.token());
                            Err(e)
                        }
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Publishes a correlated request. A request the offline queue refused
    /// fails now rather than at its deadline.
    async fn send_request(&self, publish: OutboundPublish) -> SyncResult<()> {
        let options = PublishOptions {
            qos: publish.qos,
            retain: publish.retain,
        };
        match self
            .session
            .publish(publish.topic, publish.payload, options)
            .await?
        {
            PublishReceipt::Dropped => Err(SyncError::RequestDropped),
            PublishReceipt::Sent | PublishReceipt::Queued => Ok(()),
        }
    }

    async fn subscribe_all(&self, filters: Vec<String>) -> SyncResult<()> {
        for filter in filters {
            self.session.subscribe(filter, Qos::AtLeastOnce).await?;
        }
        Ok(())
    }

    async fn unsubscribe_all(&self, filters: Vec<String>) -> SyncResult<()> {
        for filter in filters {
            self.session.unsubscribe(filter).await?;
        }
        Ok(())
    }

    fn status(&self) -> ClientStatus {
        ClientStatus {
            state: self.session.state(),
            pending_operations: self.shadows.pending() + self.jobs.pending(),
            shadows: self.shadows.names(),
            job_things: self.jobs.things(),
            active_jobs: self.jobs.active_jobs(),
            session: self.session.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::testing::{init_tracing, MemoryBroker};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tether_core::{JobStatus, Resolution};

    fn test_config(client_id: &str) -> Arc<ClientConfig> {
        let mut config = ClientConfig::new("memory");
        config.client.id = client_id.to_string();
        config.endpoint.protocol = Protocol::Tcp;
        config.session.reconnect_jitter = 0.0;
        config.session.base_reconnect_ms = 100;
        config.session.max_reconnect_secs = 2;
        config.session.drain_interval_ms = 0;
        Arc::new(config)
    }

    async fn start(broker: &MemoryBroker, client_id: &str) -> (DeviceClient, mpsc::UnboundedReceiver<ClientEvent>) {
        let config = test_config(client_id);
        let connector = Arc::new(broker.connector(client_id));
        let (client, mut events) = DeviceClient::with_connector(config, connector);
        until(&mut events, |e| *e == ClientEvent::Connect).await;
        (client, events)
    }

    /// Waits for the next event matching `pred`, returning everything seen.
    async fn until(
        events: &mut mpsc::UnboundedReceiver<ClientEvent>,
        pred: impl Fn(&ClientEvent) -> bool,
    ) -> Vec<ClientEvent> {
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

    fn is_status(event: &ClientEvent) -> bool {
        matches!(event, ClientEvent::Status(_))
    }

    #[tokio::test(start_paused = true)]
    async fn test_shadow_update_roundtrip() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();

        shadows.register("lamp", RegisterOptions::default()).await.unwrap();
        let response = shadows
            .update("lamp", json!({ "reported": { "on": true } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(response.version, Some(1));

        let seen = until(&mut events, is_status).await;
        match seen.last() {
            Some(ClientEvent::Status(status)) => {
                assert_eq!(status.thing_name, "lamp");
                assert_eq!(status.operation, ShadowOperation::Update);
                assert_eq!(status.status_type(), "accepted");
            }
            other => panic!("unexpected {:?}", other),
        }

        let doc = shadows.document("lamp").await.unwrap().unwrap();
        assert_eq!(doc.version(), Some(1));
        assert_eq!(doc.reported(), &json!({ "on": true }));
        assert_eq!(broker.shadow("lamp").unwrap().reported, json!({ "on": true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_only_when_desired_differs() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();
        shadows.register("fan", RegisterOptions::ignore_deltas()).await.unwrap();

        shadows
            .update("lamp", json!({ "desired": { "on": true } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        let seen = until(&mut events, |e| matches!(e, ClientEvent::Delta(_))).await;
        match seen.last() {
            Some(ClientEvent::Delta(delta)) => {
                assert_eq!(delta.thing_name, "lamp");
                assert_eq!(delta.state, json!({ "on": true }));
                assert_eq!(delta.version, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Reported catches up; the same desired value no longer differs
        for patch in [
            json!({ "reported": { "on": true } }),
            json!({ "desired": { "on": true } }),
        ] {
            shadows.update("lamp", patch).await.unwrap().wait().await.unwrap();
        }
        // Deltas are never raised for a shadow registered with ignore_deltas
        shadows
            .update("fan", json!({ "desired": { "speed": 3 } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        shadows.get("lamp").await.unwrap().wait().await.unwrap();

        let mut statuses = 0;
        while statuses < 4 {
            match events.recv().await.unwrap() {
                ClientEvent::Delta(delta) => panic!("unexpected delta {:?}", delta),
                ClientEvent::Status(_) => statuses += 1,
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_conflict_resync_and_retry() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, _events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();

        shadows
            .update("lamp", json!({ "reported": { "a": 1 } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        // Someone else writes without this client hearing about it
        broker.write_shadow_unannounced("lamp", json!({ "reported": { "a": 2 } }));

        let err = shadows
            .update("lamp", json!({ "reported": { "a": 3 } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
        assert!(matches!(err, SyncError::Rejected { version: Some(1), .. }));

        let current = shadows.get("lamp").await.unwrap().wait().await.unwrap();
        assert_eq!(current.version, Some(2));
        assert_eq!(current.state["reported"], json!({ "a": 2 }));

        let retried = shadows
            .update("lamp", json!({ "reported": { "a": 3 } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(retried.version.unwrap() > current.version.unwrap());
        assert_eq!(broker.shadow("lamp").unwrap().reported, json!({ "a": 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_state_change() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        client
            .shadows()
            .register("lamp", RegisterOptions::default())
            .await
            .unwrap();

        broker.write_shadow("lamp", json!({ "desired": { "level": 4 } }));

        let seen = until(&mut events, |e| matches!(e, ClientEvent::Delta(_))).await;
        assert!(seen.iter().any(|e| matches!(
            e,
            ClientEvent::ForeignStateChange(change) if change.version == Some(1)
        )));
        let doc = client.shadows().document("lamp").await.unwrap().unwrap();
        assert_eq!(doc.desired(), &json!({ "level": 4 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_responses_resolve_once() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();
        broker.set_duplicate_responses(true);

        shadows
            .update("lamp", json!({ "reported": { "n": 1 } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        shadows.get("lamp").await.unwrap().wait().await.unwrap();

        let mut statuses = 0;
        let mut foreign = 0;
        let seen = until(&mut events, |e| {
            matches!(e, ClientEvent::Status(s) if s.operation == ShadowOperation::Get)
        })
        .await;
        for event in &seen {
            match event {
                ClientEvent::Status(_) => statuses += 1,
                ClientEvent::ForeignStateChange(_) => foreign += 1,
                _ => {}
            }
        }
        assert_eq!(statuses, 2);
        assert_eq!(foreign, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_operation_times_out() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();
        broker.set_withhold_responses(true);

        let started = tokio::time::Instant::now();
        let pending = shadows.get("lamp").await.unwrap();
        assert_eq!(pending.wait().await.unwrap_err(), SyncError::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(10));

        let seen = until(&mut events, is_status).await;
        assert!(matches!(seen.last(), Some(ClientEvent::Status(s)) if s.status_type() == "timeout"));
        assert_eq!(client.status().await.unwrap().pending_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_resolves_pending_as_closed() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();
        broker.set_withhold_responses(true);

        let pending = shadows
            .update("lamp", json!({ "reported": { "on": true } }))
            .await
            .unwrap();
        client.close().await.unwrap();

        assert_eq!(pending.resolution().await, Resolution::Closed);
        let seen = until(&mut events, |e| *e == ClientEvent::Close).await;
        assert!(seen.iter().any(|e| matches!(e, ClientEvent::Status(s) if s.status_type() == "closed")));
        assert_eq!(seen.iter().filter(|e| **e == ClientEvent::Close).count(), 1);

        assert_eq!(shadows.get("lamp").await.unwrap_err(), SyncError::Closed);
        assert_eq!(client.close().await.unwrap_err(), SyncError::Closed);
        assert!(!broker.is_connected("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_messages_forwarded_service_topics_consumed() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        client.subscribe("app/#", Qos::AtLeastOnce).await.unwrap();
        client
            .shadows()
            .register("lamp", RegisterOptions::default())
            .await
            .unwrap();

        client
            .shadows()
            .update("lamp", json!({ "reported": { "on": true } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        broker.publish("app/hello", b"hi".to_vec());

        let seen = until(&mut events, |e| matches!(e, ClientEvent::Message(_))).await;
        let messages: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Message(m) => Some(m.topic.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["app/hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shadow_survives_network_failure() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, mut events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();

        client.simulate_network_failure().await.unwrap();
        let seen = until(&mut events, |e| *e == ClientEvent::Connect).await;
        assert!(seen.contains(&ClientEvent::Offline));
        assert_eq!(broker.connect_count("dev-1"), 2);

        broker.write_shadow("lamp", json!({ "desired": { "on": true } }));
        until(&mut events, |e| matches!(e, ClientEvent::Delta(_))).await;

        shadows
            .update("lamp", json!({ "reported": { "on": true } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(client.status().await.unwrap().session.connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_displaced_from_offline_queue_fails_fast() {
        init_tracing();
        let broker = MemoryBroker::new();
        let mut config = (*test_config("dev-1")).clone();
        config.session.offline_queue_max = 1;
        let connector = Arc::new(broker.connector("dev-1"));
        let (client, mut events) = DeviceClient::with_connector(Arc::new(config), connector);
        until(&mut events, |e| *e == ClientEvent::Connect).await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();

        broker.refuse_next_connects(3);
        client.simulate_network_failure().await.unwrap();
        until(&mut events, |e| *e == ClientEvent::Offline).await;

        let first = shadows
            .update("lamp", json!({ "reported": { "n": 1 } }))
            .await
            .unwrap();
        let second = shadows
            .update("lamp", json!({ "reported": { "n": 2 } }))
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(first.wait().await.unwrap_err(), SyncError::RequestDropped);
        assert!(started.elapsed() < Duration::from_secs(1));
        let seen = until(&mut events, is_status).await;
        assert!(matches!(seen.last(), Some(ClientEvent::Status(s)) if s.status_type() == "dropped"));

        let accepted = second.wait().await.unwrap();
        assert_eq!(accepted.version, Some(1));
        assert_eq!(broker.shadow("lamp").unwrap().reported, json!({ "n": 2 }));
        let status = client.status().await.unwrap();
        assert_eq!(status.session.dropped, 1);
        assert_eq!(status.pending_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_still_sweeps() {
        init_tracing();
        let broker = MemoryBroker::new();
        let mut config = (*test_config("dev-1")).clone();
        config.shadow.sweep_interval_ms = 0;
        let connector = Arc::new(broker.connector("dev-1"));
        let (client, mut events) = DeviceClient::with_connector(Arc::new(config), connector);
        until(&mut events, |e| *e == ClientEvent::Connect).await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();

        let accepted = shadows
            .update("lamp", json!({ "reported": { "on": true } }))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(accepted.version, Some(1));

        broker.set_withhold_responses(true);
        let pending = shadows.get("lamp").await.unwrap();
        assert_eq!(pending.wait().await.unwrap_err(), SyncError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_routed_by_operation_until_done() {
        init_tracing();
        let broker = MemoryBroker::new();
        let thing = "pump-1";
        let plan = [("job-0", "test0"), ("job-1", "test1"), ("job-2", "other"), ("job-3", "test0")];
        for (index, (job_id, operation)) in plan.iter().enumerate() {
            broker.create_job(thing, job_id, json!({ "operation": operation, "jobNum": index }));
        }

        let (client, _events) = start(&broker, "dev-1").await;
        let jobs = client.jobs();
        let handled: Arc<Mutex<Vec<(String, String)>>> = Arc::default();

        for label in [Some("test0"), Some("test1"), None] {
            let mut rx = jobs.subscribe_to_jobs(thing, label).await.unwrap();
            let handled = handled.clone();
            let label = label.unwrap_or("default").to_string();
            tokio::spawn(async move {
                while let Some(Ok(job)) = rx.recv().await {
                    handled
                        .lock()
                        .unwrap()
                        .push((label.clone(), job.job_id().to_string()));
                    job.in_progress(None).await.unwrap();
                    let odd = job.document()["jobNum"].as_u64().unwrap() % 2 == 1;
                    let mut details = crate::protocol::StatusDetails::new();
                    details.insert("handler".into(), label.clone());
                    if odd {
                        job.failed(Some(details)).await.unwrap();
                    } else {
                        job.succeeded(Some(details)).await.unwrap();
                    }
                }
            });
        }
        jobs.start_job_notifications(thing).await.unwrap();

        for _ in 0..200 {
            let done = plan
                .iter()
                .all(|(job_id, _)| broker.job_status(thing, job_id).is_some_and(|s| s.is_terminal()));
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(broker.job_status(thing, "job-0"), Some(JobStatus::Succeeded));
        assert_eq!(broker.job_status(thing, "job-1"), Some(JobStatus::Failed));
        assert_eq!(broker.job_status(thing, "job-2"), Some(JobStatus::Succeeded));
        assert_eq!(broker.job_status(thing, "job-3"), Some(JobStatus::Failed));
        assert_eq!(
            broker.job_details(thing, "job-2").unwrap().get("handler").map(String::as_str),
            Some("default")
        );

        let handled = handled.lock().unwrap().clone();
        assert_eq!(
            handled,
            vec![
                ("test0".to_string(), "job-0".to_string()),
                ("test1".to_string(), "job-1".to_string()),
                ("default".to_string(), "job-2".to_string()),
                ("test0".to_string(), "job-3".to_string()),
            ]
        );
        assert_eq!(client.status().await.unwrap().active_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_job_rejects_further_updates() {
        init_tracing();
        let broker = MemoryBroker::new();
        broker.create_job("pump", "j1", json!({ "operation": "reboot" }));
        let (client, _events) = start(&broker, "dev-1").await;
        let jobs = client.jobs();
        let mut rx = jobs.subscribe_to_jobs("pump", None).await.unwrap();
        jobs.start_job_notifications("pump").await.unwrap();

        let job = rx.recv().await.unwrap().unwrap();
        let state = job.succeeded(None).await.unwrap();
        assert_eq!(state.status, JobStatus::Succeeded);

        for status in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::InProgress] {
            let err = job.update(status, None).await.unwrap_err();
            assert!(matches!(err, SyncError::InvalidTransition(_)), "{:?}", err);
        }
        assert_eq!(broker.job("pump", "j1").unwrap().version_number, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_job_emits_event_and_fails_fast() {
        init_tracing();
        let broker = MemoryBroker::new();
        broker.create_job("pump", "j1", json!({ "operation": "flash" }));
        let (client, mut events) = start(&broker, "dev-1").await;
        let jobs = client.jobs();
        let mut rx = jobs.subscribe_to_jobs("pump", Some("flash")).await.unwrap();
        jobs.start_job_notifications("pump").await.unwrap();

        let job = rx.recv().await.unwrap().unwrap();
        job.in_progress(None).await.unwrap();
        assert!(broker.cancel_job("pump", "j1"));

        until(&mut events, |e| {
            *e == ClientEvent::JobCanceled {
                thing_name: "pump".into(),
                job_id: "j1".into(),
            }
        })
        .await;
        let err = job.succeeded(None).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition(_)));
        assert_eq!(broker.job_status("pump", "j1"), Some(JobStatus::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_execution() {
        init_tracing();
        let broker = MemoryBroker::new();
        broker.create_job("pump", "j7", json!({ "operation": "reboot" }));
        let (client, _events) = start(&broker, "dev-1").await;
        let jobs = client.jobs();

        let execution = jobs
            .describe_execution("pump", "j7")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.job_id, "j7");
        assert_eq!(execution.status, JobStatus::Queued);
        assert_eq!(execution.job_document, Some(json!({ "operation": "reboot" })));

        let err = jobs
            .describe_execution("pump", "missing")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshot_and_unregister() {
        init_tracing();
        let broker = MemoryBroker::new();
        let (client, _events) = start(&broker, "dev-1").await;
        let shadows = client.shadows();
        shadows.register("lamp", RegisterOptions::default()).await.unwrap();
        shadows.register("fan", RegisterOptions::ignore_deltas()).await.unwrap();
        client.jobs().subscribe_to_jobs("pump", None).await.unwrap();

        let status = client.status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.shadows, vec!["fan", "lamp"]);
        assert_eq!(status.job_things, vec!["pump"]);
        assert_eq!(status.pending_operations, 0);

        shadows.unregister("lamp").await.unwrap();
        assert!(!broker
            .subscriptions("dev-1")
            .iter()
            .any(|f| f.contains("/things/lamp/")));
        assert!(matches!(
            shadows.get("lamp").await.unwrap_err(),
            SyncError::NotRegistered(_)
        ));
        assert_eq!(shadows.document("lamp").await.unwrap(), None);
    }
}
