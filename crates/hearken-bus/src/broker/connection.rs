//! Boundary to the external broker client.
//!
//! The adapter never touches sockets.  A [`BrokerConnector`] opens a
//! [`BrokerLink`]: a [`BrokerConnection`] used to send requests, and a stream
//! of [`InboundPacket`]s on which the broker's answers and deliveries
//! arrive.

use std::sync::Arc;

use async_trait::async_trait;
use hearken_types::{BusError, QoS};
use tokio::sync::mpsc;

/// Parameters of the CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keepalive_secs: u16,
    pub clean_session: bool,
}

/// Packets delivered by the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket {
    /// Answer to CONNECT; `return_code == 0` means accepted.
    ConnAck { return_code: u8 },
    /// A message published on a topic this client subscribed to.
    Publish {
        topic: String,
        packet_id: Option<u16>,
        payload: Vec<u8>,
    },
    SubAck { packet_id: u16 },
    UnsubAck { packet_id: u16 },
    /// The transport has shut down.
    Close,
    /// A transport-level failure.
    Error(String),
}

/// Request side of a live broker connection.
pub trait BrokerConnection: Send + Sync {
    fn connect(&self, options: &ConnectOptions) -> Result<(), BusError>;

    fn publish(
        &self,
        topic: &str,
        packet_id: u16,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), BusError>;

    fn subscribe(&self, filter: &str, packet_id: u16, qos: QoS) -> Result<(), BusError>;

    fn unsubscribe(&self, filter: &str, packet_id: u16) -> Result<(), BusError>;

    fn disconnect(&self) -> Result<(), BusError>;
}

/// An opened connection together with its inbound packet stream.
pub struct BrokerLink {
    pub connection: Arc<dyn BrokerConnection>,
    pub inbound: mpsc::UnboundedReceiver<InboundPacket>,
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> Result<BrokerLink, BusError>;
}
