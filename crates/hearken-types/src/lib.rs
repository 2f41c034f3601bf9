use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message carried by the bus.
///
/// The in-process bus hands it to callbacks by reference; only the broker
/// adapter ever serialises it.
pub type Message = serde_json::Value;

/// Lifecycle of a bus instance.  Transitions are monotonic:
/// `Starting → Ready → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Ready,
    Closed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Ready => write!(f, "ready"),
            LifecycleState::Closed => write!(f, "closed"),
        }
    }
}

/// Observable notifications emitted by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BusNotification {
    /// The backend is usable.
    Ready,
    /// The backend has shut down; every further call fails.
    Closed,
    /// A topic was observed for the first time in this bus's lifetime.
    NewTopic(String),
    /// An asynchronous failure (handshake refusal, transport error, bad
    /// inbound payload).
    Error(BusError),
}

/// Broker delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Acknowledgement a pending broker request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckKind {
    SubAck,
    UnsubAck,
}

impl std::fmt::Display for AckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckKind::SubAck => write!(f, "suback"),
            AckKind::UnsubAck => write!(f, "unsuback"),
        }
    }
}

/// Error type shared by every backend.
///
/// `Clone` so that a single failure can be fanned out through notifications
/// and completion handles.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("bus is closed")]
    UseAfterClose,

    #[error("broker connection is not established")]
    NotConnected,

    #[error("connack error {code}")]
    ConnectionRefused { code: u8 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("payload codec error: {0}")]
    Codec(String),

    #[error("no {kind} for packet {packet_id} within the acknowledgement timeout")]
    AckTimeout { kind: AckKind, packet_id: u16 },

    #[error("every packet identifier is already pending")]
    CorrelationExhausted,

    #[error("operation was abandoned before it completed")]
    Abandoned,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Connection settings for the broker adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT keep-alive interval in seconds.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,

    /// Upper bound on how long a subscribe/unsubscribe waits for its
    /// acknowledgement.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Attach subscribers to the local bus before the broker acknowledges the
    /// subscription.  When `false` the local attach waits for the SUBACK.
    #[serde(default = "default_optimistic_local_attach")]
    pub optimistic_local_attach: bool,

    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_keepalive_secs() -> u16 {
    3000
}
fn default_ack_timeout_ms() -> u64 {
    10_000
}
fn default_optimistic_local_attach() -> bool {
    true
}
fn default_client_id_prefix() -> String {
    "hearken".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keepalive_secs: default_keepalive_secs(),
            ack_timeout_ms: default_ack_timeout_ms(),
            optimistic_local_attach: default_optimistic_local_attach(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}
