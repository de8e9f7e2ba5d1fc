//! # Client Configuration
//!
//! Configuration management for the device client.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TETHER_CLIENT_ID=greenhouse-7                                      │
//! │     TETHER_HOST=abc123-ats.iot.eu-west-1.amazonaws.com                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tether/tether.toml (Linux)                               │
//! │     ~/Library/Application Support/io.tether.tether/tether.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     mqtts on 8883, 1s base reconnect, offline queueing on              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # tether.toml
//! [client]
//! id = "greenhouse-7"
//! debug = false
//!
//! [endpoint]
//! host = "abc123-ats.iot.eu-west-1.amazonaws.com"
//! region = "eu-west-1"
//! protocol = "mqtts"   # tcp | mqtts | wss | wss-custom-auth
//!
//! [credentials]
//! ca_path = "/etc/tether/root-CA.crt"
//! cert_path = "/etc/tether/device.pem.crt"
//! key_path = "/etc/tether/device.pem.key"
//!
//! [session]
//! base_reconnect_ms = 1000
//! max_reconnect_secs = 128
//! offline_queue_max = 0    # unbounded
//! drain_interval_ms = 250
//!
//! [shadow]
//! operation_timeout_ms = 10000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::queue::DropPolicy;

// =============================================================================
// Transport Protocol
// =============================================================================

/// How the client reaches the broker.
///
/// ```text
/// ┌──────────────────┬──────┬──────────────────────────────────────────────┐
/// │ Protocol         │ Port │ Authentication                               │
/// ├──────────────────┼──────┼──────────────────────────────────────────────┤
/// │ tcp              │ 1883 │ none (local brokers, tests)                  │
/// │ mqtts            │ 8883 │ mutual TLS with device certificate           │
/// │ wss              │  443 │ TLS, credentials in the WebSocket handshake  │
/// │ wss-custom-auth  │  443 │ TLS + caller-supplied authorizer headers     │
/// └──────────────────┴──────┴──────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Tcp,
    #[default]
    Mqtts,
    Wss,
    WssCustomAuth,
}

impl Protocol {
    /// Port used when none is configured.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Tcp => 1883,
            Protocol::Mqtts => 8883,
            Protocol::Wss | Protocol::WssCustomAuth => 443,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Wss | Protocol::WssCustomAuth)
    }

    pub fn uses_tls(&self) -> bool {
        !matches!(self, Protocol::Tcp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Mqtts => write!(f, "mqtts"),
            Protocol::Wss => write!(f, "wss"),
            Protocol::WssCustomAuth => write!(f, "wss-custom-auth"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" | "mqtt" => Ok(Protocol::Tcp),
            "mqtts" | "ssl" | "tls" => Ok(Protocol::Mqtts),
            "wss" => Ok(Protocol::Wss),
            "wss-custom-auth" => Ok(Protocol::WssCustomAuth),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown protocol: '{}'. Valid options: tcp, mqtts, wss, wss-custom-auth",
                other
            ))),
        }
    }
}

// =============================================================================
// Client Section
// =============================================================================

/// Identity of this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// MQTT client id. Auto-generated when not provided.
    #[serde(default = "default_client_id")]
    pub id: String,

    /// Logs per-message traffic at `info` instead of `debug`.
    #[serde(default)]
    pub debug: bool,
}

fn default_client_id() -> String {
    format!("tether-{}", Uuid::new_v4().simple())
}

impl Default for ClientSection {
    fn default() -> Self {
        ClientSection {
            id: default_client_id(),
            debug: false,
        }
    }
}

// =============================================================================
// Endpoint Section
// =============================================================================

/// Broker endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointSection {
    /// Broker host name.
    #[serde(default)]
    pub host: String,

    /// Broker port. Defaults by protocol when unset.
    #[serde(default)]
    pub port: Option<u16>,

    /// Service region, informational unless `host` is empty.
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub protocol: Protocol,

    /// WebSocket upgrade headers for `wss-custom-auth`.
    #[serde(default)]
    pub custom_auth_headers: BTreeMap<String, String>,

    /// WebSocket path for the `wss` protocols.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

impl EndpointSection {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Parses `mqtts://host:port`, `wss://host/path` and friends.
    pub fn from_url(raw: &str) -> SyncResult<Self> {
        let url = url::Url::parse(raw)?;
        let protocol = match url.scheme() {
            "mqtt" | "tcp" => Protocol::Tcp,
            "mqtts" | "ssl" => Protocol::Mqtts,
            "wss" => Protocol::Wss,
            other => {
                return Err(SyncError::InvalidUrl(format!(
                    "unsupported scheme '{}' in {}",
                    other, raw
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| SyncError::InvalidUrl(format!("missing host in {}", raw)))?
            .to_string();
        let ws_path = match url.path() {
            "" | "/" => default_ws_path(),
            path => path.to_string(),
        };

        Ok(EndpointSection {
            host,
            port: url.port(),
            region: None,
            protocol,
            custom_auth_headers: BTreeMap::new(),
            ws_path,
        })
    }
}

// =============================================================================
// Credentials Section
// =============================================================================

/// File locations of the TLS material. Files are read verbatim and handed to
/// the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsSection {
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

// =============================================================================
// Session Section
// =============================================================================

/// Connection lifecycle and offline queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// MQTT keep-alive interval (seconds).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay (milliseconds), doubled per attempt.
    #[serde(default = "default_base_reconnect")]
    pub base_reconnect_ms: u64,

    /// Reconnect delay cap (seconds).
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_secs: u64,

    /// Randomization factor applied to each delay (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub reconnect_jitter: f64,

    /// Consecutive failed attempts before giving up. 0 = never give up.
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// A connection must stay up this long before the backoff resets.
    #[serde(default = "default_minimum_connection")]
    pub minimum_connection_secs: u64,

    /// Buffer publishes while disconnected.
    #[serde(default = "default_true")]
    pub offline_queueing: bool,

    /// Offline queue bound. 0 = unbounded.
    #[serde(default)]
    pub offline_queue_max: usize,

    /// Which end of a full queue is dropped.
    #[serde(default)]
    pub offline_queue_drop: DropPolicy,

    /// Spacing between queued publishes after reconnect (milliseconds).
    /// 0 flushes the whole queue at once.
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,

    #[serde(default = "default_true")]
    pub clean_session: bool,
}

fn default_keep_alive() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_base_reconnect() -> u64 {
    1000
}
fn default_max_reconnect() -> u64 {
    128
}
fn default_jitter() -> f64 {
    0.2
}
fn default_minimum_connection() -> u64 {
    20
}
fn default_drain_interval() -> u64 {
    250
}
fn default_true() -> bool {
    true
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            base_reconnect_ms: default_base_reconnect(),
            max_reconnect_secs: default_max_reconnect(),
            reconnect_jitter: default_jitter(),
            max_reconnect_attempts: 0,
            minimum_connection_secs: default_minimum_connection(),
            offline_queueing: true,
            offline_queue_max: 0,
            offline_queue_drop: DropPolicy::default(),
            drain_interval_ms: default_drain_interval(),
            clean_session: true,
        }
    }
}

impl SessionSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn base_reconnect(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_ms)
    }

    pub fn max_reconnect(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_secs)
    }

    pub fn minimum_connection(&self) -> Duration {
        Duration::from_secs(self.minimum_connection_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

// =============================================================================
// Shadow Section
// =============================================================================

/// Shadow and job request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowSection {
    /// Reserved topic prefix.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// How long a get/update/delete or job request waits for its response.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How often outstanding requests are checked for expiry.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Send the last known version with updates.
    #[serde(default = "default_true")]
    pub enable_versioning: bool,

    /// Drop documents whose version is not newer than the last seen one.
    #[serde(default = "default_true")]
    pub discard_stale: bool,
}

fn default_topic_prefix() -> String {
    tether_core::DEFAULT_TOPIC_PREFIX.to_string()
}
fn default_operation_timeout() -> u64 {
    10_000
}
fn default_sweep_interval() -> u64 {
    250
}

impl Default for ShadowSection {
    fn default() -> Self {
        ShadowSection {
            topic_prefix: default_topic_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            enable_versioning: true,
            discard_stale: true,
        }
    }
}

impl ShadowSection {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// =============================================================================
// Main Client Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub endpoint: EndpointSection,

    #[serde(default)]
    pub credentials: CredentialsSection,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub shadow: ShadowSection,
}

impl ClientConfig {
    /// Creates a config with defaults for the given host.
    pub fn new(host: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.endpoint.host = host.into();
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tether.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.client.id.is_empty() {
            return Err(SyncError::MissingClientId);
        }
        tether_core::validation::validate_client_id(&self.client.id)?;

        if self.endpoint.host.is_empty() {
            return Err(SyncError::InvalidConfig("endpoint host is required".into()));
        }

        match self.endpoint.protocol {
            Protocol::WssCustomAuth if self.endpoint.custom_auth_headers.is_empty() => {
                return Err(SyncError::InvalidConfig(
                    "wss-custom-auth requires custom_auth_headers".into(),
                ));
            }
            Protocol::WssCustomAuth => {}
            _ if !self.endpoint.custom_auth_headers.is_empty() => {
                return Err(SyncError::InvalidConfig(format!(
                    "custom_auth_headers are only used with wss-custom-auth, not {}",
                    self.endpoint.protocol
                )));
            }
            _ => {}
        }

        if self.session.connect_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.session.base_reconnect_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "base_reconnect_ms must be greater than 0".into(),
            ));
        }
        if self.session.max_reconnect() < self.session.base_reconnect() {
            return Err(SyncError::InvalidConfig(
                "max_reconnect_secs must not be below base_reconnect_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.session.reconnect_jitter) {
            return Err(SyncError::InvalidConfig(
                "reconnect_jitter must be between 0.0 and 1.0".into(),
            ));
        }
        if self.shadow.operation_timeout_ms == 0 || self.shadow.sweep_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "operation_timeout_ms and sweep_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TETHER_CLIENT_ID") {
            debug!(client_id = %id, "Overriding client ID from environment");
            self.client.id = id;
        }

        if let Ok(debug_flag) = std::env::var("TETHER_DEBUG") {
            self.client.debug = matches!(debug_flag.as_str(), "1" | "true" | "yes");
        }

        if let Ok(raw) = std::env::var("TETHER_ENDPOINT_URL") {
            match EndpointSection::from_url(&raw) {
                Ok(parsed) => {
                    debug!(url = %raw, "Overriding endpoint from environment");
                    self.endpoint.host = parsed.host;
                    self.endpoint.port = parsed.port;
                    self.endpoint.protocol = parsed.protocol;
                    self.endpoint.ws_path = parsed.ws_path;
                }
                Err(e) => warn!(url = %raw, error = %e, "Ignoring bad endpoint URL in environment"),
            }
        }

        if let Ok(host) = std::env::var("TETHER_HOST") {
            self.endpoint.host = host;
        }

        if let Ok(port) = std::env::var("TETHER_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.endpoint.port = Some(p);
            }
        }

        if let Ok(region) = std::env::var("TETHER_REGION") {
            self.endpoint.region = Some(region);
        }

        if let Ok(protocol) = std::env::var("TETHER_PROTOCOL") {
            match protocol.parse() {
                Ok(parsed) => self.endpoint.protocol = parsed,
                Err(_) => warn!(protocol = %protocol, "Unknown protocol in environment"),
            }
        }

        if let Ok(path) = std::env::var("TETHER_CA_PATH") {
            self.credentials.ca_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("TETHER_CERT_PATH") {
            self.credentials.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("TETHER_KEY_PATH") {
            self.credentials.key_path = Some(PathBuf::from(path));
        }

        if let Ok(ms) = std::env::var("TETHER_BASE_RECONNECT_MS") {
            if let Ok(v) = ms.parse::<u64>() {
                self.session.base_reconnect_ms = v;
            }
        }

        if let Ok(ms) = std::env::var("TETHER_DRAIN_INTERVAL_MS") {
            if let Ok(v) = ms.parse::<u64>() {
                self.session.drain_interval_ms = v;
            }
        }

        if let Ok(secs) = std::env::var("TETHER_KEEP_ALIVE_SECS") {
            if let Ok(v) = secs.parse::<u64>() {
                self.session.keep_alive_secs = v;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "tether", "tether")
            .map(|dirs| dirs.config_dir().join("tether.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn client_id(&self) -> &str {
        &self.client.id
    }

    pub fn topics(&self) -> tether_core::Topics {
        tether_core::Topics::new(self.shadow.topic_prefix.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("mqtts".parse::<Protocol>().unwrap(), Protocol::Mqtts);
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(
            "wss-custom-auth".parse::<Protocol>().unwrap(),
            Protocol::WssCustomAuth
        );
        assert!("carrier-pigeon".parse::<Protocol>().is_err());
        assert_eq!(Protocol::WssCustomAuth.to_string(), "wss-custom-auth");
    }

    #[test]
    fn test_default_ports() {
        let mut endpoint = EndpointSection::default();
        assert_eq!(endpoint.port(), 8883);
        endpoint.protocol = Protocol::Wss;
        assert_eq!(endpoint.port(), 443);
        endpoint.port = Some(9000);
        assert_eq!(endpoint.port(), 9000);
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.client.id.starts_with("tether-"));
        assert_eq!(config.session.base_reconnect_ms, 1000);
        assert_eq!(config.session.offline_queue_max, 0);
        assert!(config.session.offline_queueing);
        assert_eq!(config.shadow.topic_prefix, "$aws");
        assert_eq!(config.shadow.operation_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::new("broker.local");
        assert!(config.validate().is_ok());

        config.client.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingClientId)));

        config.client.id = "dev-1".into();
        config.endpoint.host = String::new();
        assert!(config.validate().is_err());

        config.endpoint.host = "broker.local".into();
        config.endpoint.protocol = Protocol::WssCustomAuth;
        assert!(config.validate().is_err());

        config
            .endpoint
            .custom_auth_headers
            .insert("X-Amz-CustomAuthorizer-Name".into(), "authorizer".into());
        assert!(config.validate().is_ok());

        config.endpoint.protocol = Protocol::Mqtts;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_validation() {
        let mut config = ClientConfig::new("broker.local");
        config.session.reconnect_jitter = 1.5;
        assert!(config.validate().unwrap_err().is_config_error());

        config.session.reconnect_jitter = 0.0;
        config.session.connect_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.session.connect_timeout_secs = 10;
        config.shadow.operation_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_from_url() {
        let endpoint = EndpointSection::from_url("mqtts://broker.example.com:8884").unwrap();
        assert_eq!(endpoint.host, "broker.example.com");
        assert_eq!(endpoint.port(), 8884);
        assert_eq!(endpoint.protocol, Protocol::Mqtts);

        let endpoint = EndpointSection::from_url("wss://broker.example.com/custom").unwrap();
        assert_eq!(endpoint.port(), 443);
        assert_eq!(endpoint.ws_path, "/custom");

        assert!(EndpointSection::from_url("http://broker.example.com").is_err());
        assert!(EndpointSection::from_url("not a url").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
id = "greenhouse-7"

[endpoint]
host = "broker.example.com"
protocol = "tcp"

[session]
offline_queue_max = 64
offline_queue_drop = "newest"
drain_interval_ms = 35
"#
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.endpoint.port(), 1883);
        assert_eq!(config.session.offline_queue_max, 64);
        assert_eq!(config.session.offline_queue_drop, DropPolicy::Newest);
        assert_eq!(config.session.drain_interval_ms, 35);
        // Untouched sections keep their defaults
        assert_eq!(config.session.keep_alive_secs, 30);
        assert!(config.shadow.discard_stale);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tether.toml");

        let mut config = ClientConfig::new("broker.example.com");
        config.client.id = "round-trip".into();
        config.save(Some(path.clone())).unwrap();

        let loaded = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.client.id, "round-trip");
        assert_eq!(loaded.endpoint.host, "broker.example.com");
    }

    #[test]
    fn test_toml_serialization() {
        let config = ClientConfig::new("broker.example.com");
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[client]"));
        assert!(toml_str.contains("[session]"));
        assert!(toml_str.contains("[shadow]"));
    }
}
