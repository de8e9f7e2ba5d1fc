//! # Broker Connector
//!
//! The seam between the session actor and the wire.
//!
//! ## Layering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Session actor ── connect() ──► Connector ──► Box<dyn Link>            │
//! │        │                                          │                     │
//! │        │  publish / subscribe / unsubscribe       │                     │
//! │        ├─────────────────────────────────────────►│                     │
//! │        │  next_event(): Message | Closed          │                     │
//! │        │◄─────────────────────────────────────────┤                     │
//! │                                                                         │
//! │   MqttConnector   rumqttc AsyncClient + EventLoop driver task           │
//! │   MemoryConnector in-process broker for tests (testing module)          │
//! │                                                                         │
//! │   A Link is one connection. It never reconnects by itself: when it      │
//! │   reports Closed the session decides whether and when to retry.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, Protocol};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Wire Types
// =============================================================================

/// Delivery tier for publishes and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// Fire-and-forget.
    AtMostOnce,
    /// Acknowledged, may be redelivered.
    #[default]
    AtLeastOnce,
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// A publish on its way to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What a link reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(InboundMessage),
    /// The connection is gone. Carries the reason when one is known.
    Closed(Option<String>),
}

// =============================================================================
// Traits
// =============================================================================

/// One established broker connection.
#[async_trait]
pub trait Link: Send {
    async fn publish(&mut self, publish: &OutboundPublish) -> SyncResult<()>;

    async fn subscribe(&mut self, filter: &str, qos: Qos) -> SyncResult<()>;

    async fn unsubscribe(&mut self, filter: &str) -> SyncResult<()>;

    /// Waits for the next inbound event. Must be cancel-safe: it is polled
    /// inside `tokio::select!`.
    async fn next_event(&mut self) -> LinkEvent;

    /// Graceful disconnect.
    async fn disconnect(&mut self) -> SyncResult<()>;
}

/// Opens links. Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> SyncResult<Box<dyn Link>>;
}

// =============================================================================
// MQTT Connector (rumqttc)
// =============================================================================

/// Connects to a real broker with rumqttc.
pub struct MqttConnector {
    config: Arc<ClientConfig>,
}

impl MqttConnector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        MqttConnector { config }
    }

    fn options(&self) -> SyncResult<MqttOptions> {
        let endpoint = &self.config.endpoint;
        let session = &self.config.session;

        let broker_addr = if endpoint.protocol.is_websocket() {
            format!("wss://{}:{}{}", endpoint.host, endpoint.port(), endpoint.ws_path)
        } else {
            endpoint.host.clone()
        };

        let mut options = MqttOptions::new(self.config.client_id(), broker_addr, endpoint.port());
        options.set_keep_alive(session.keep_alive());
        options.set_clean_session(session.clean_session);

        match endpoint.protocol {
            Protocol::Tcp => {}
            Protocol::Mqtts => {
                options.set_transport(self.tls_transport()?);
            }
            Protocol::Wss | Protocol::WssCustomAuth => {
                self.apply_websocket(&mut options)?;
            }
        }

        Ok(options)
    }

    fn tls_configuration(&self) -> SyncResult<Option<rumqttc::TlsConfiguration>> {
        let credentials = &self.config.credentials;
        let Some(ca_path) = &credentials.ca_path else {
            return Ok(None);
        };

        let ca = std::fs::read(ca_path)?;
        let client_auth = match (&credentials.cert_path, &credentials.key_path) {
            (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
            (None, None) => None,
            _ => {
                return Err(SyncError::InvalidConfig(
                    "cert_path and key_path must be set together".into(),
                ))
            }
        };

        Ok(Some(rumqttc::TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }))
    }

    fn tls_transport(&self) -> SyncResult<Transport> {
        Ok(match self.tls_configuration()? {
            Some(tls) => Transport::Tls(tls),
            None => Transport::tls_with_default_config(),
        })
    }

    #[cfg(feature = "websocket")]
    fn apply_websocket(&self, options: &mut MqttOptions) -> SyncResult<()> {
        let transport = match self.tls_configuration()? {
            Some(tls) => Transport::Wss(tls),
            None => Transport::wss_with_default_config(),
        };
        options.set_transport(transport);

        if self.config.endpoint.protocol == Protocol::WssCustomAuth {
            let mut headers = http::HeaderMap::new();
            for (name, value) in &self.config.endpoint.custom_auth_headers {
                let name = http::HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| SyncError::InvalidConfig(format!("header {}: {}", name, e)))?;
                let value = http::HeaderValue::from_str(value)
                    .map_err(|e| SyncError::InvalidConfig(format!("header value: {}", e)))?;
                headers.insert(name, value);
            }
            options.set_request_modifier(move |mut request: http::Request<()>| {
                let headers = headers.clone();
                async move {
                    request.headers_mut().extend(headers);
                    request
                }
            });
        }
        Ok(())
    }

    #[cfg(not(feature = "websocket"))]
    fn apply_websocket(&self, _options: &mut MqttOptions) -> SyncResult<()> {
        Err(SyncError::InvalidConfig(format!(
            "protocol {} needs the `websocket` feature",
            self.config.endpoint.protocol
        )))
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self) -> SyncResult<Box<dyn Link>> {
        let options = self.options()?;
        let (client, event_loop) = AsyncClient::new(options, 64);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connack_tx, connack_rx) = oneshot::channel();
        let driver = tokio::spawn(drive_event_loop(event_loop, events_tx, connack_tx));

        let connect_timeout = self.config.session.connect_timeout();
        match timeout(connect_timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(
                    host = %self.config.endpoint.host,
                    port = self.config.endpoint.port(),
                    protocol = %self.config.endpoint.protocol,
                    "MQTT connection established"
                );
                Ok(Box::new(MqttLink {
                    client,
                    events: events_rx,
                    driver,
                }))
            }
            Ok(Ok(Err(e))) => {
                driver.abort();
                Err(e)
            }
            Ok(Err(_)) => {
                driver.abort();
                Err(SyncError::ConnectionFailed("event loop stopped before ConnAck".into()))
            }
            Err(_) => {
                driver.abort();
                Err(SyncError::ConnectTimeout(connect_timeout.as_secs()))
            }
        }
    }
}

/// Polls the rumqttc event loop until the connection ends.
///
/// The first ConnAck (or error) is reported through `connack`; everything
/// after that flows through `events`. The loop stops on the first error so
/// that rumqttc never reconnects behind the session's back.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<LinkEvent>,
    connack: oneshot::Sender<SyncResult<()>>,
) {
    let mut connack = Some(connack);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(code = ?ack.code, session_present = ack.session_present, "ConnAck");
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events.send(LinkEvent::Message(message)).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(LinkEvent::Closed(Some("broker sent DISCONNECT".into())));
                break;
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                let _ = events.send(LinkEvent::Closed(None));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let err = SyncError::from(e);
                match connack.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    None => {
                        warn!(error = %err, "MQTT connection lost");
                        let _ = events.send(LinkEvent::Closed(Some(err.to_string())));
                    }
                }
                break;
            }
        }
    }
}

struct MqttLink {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    driver: JoinHandle<()>,
}

#[async_trait]
impl Link for MqttLink {
    async fn publish(&mut self, publish: &OutboundPublish) -> SyncResult<()> {
        self.client
            .publish(
                publish.topic.clone(),
                publish.qos.into(),
                publish.retain,
                publish.payload.clone(),
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: Qos) -> SyncResult<()> {
        self.client.subscribe(filter, qos.into()).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> SyncResult<()> {
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| LinkEvent::Closed(Some("event loop stopped".into())))
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
