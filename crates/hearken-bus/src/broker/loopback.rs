//! [`LoopbackBroker`] – an in-process stand-in for an external broker.
//!
//! It implements the [`BrokerConnector`] boundary without any socket: every
//! request is recorded, acknowledged on the inbound stream, and publishes
//! are routed back to the connection when one of its filters matches.
//! The CLI uses it as the `loopback` backend; tests use it to script the
//! broker's side of the conversation.
//!
//! # Filter matching
//!
//! Filters are compared level by level (`/`-separated).  `+` matches exactly
//! one level.  `#` matches whatever follows it, including the remainder of
//! its own level, so the translated bus pattern `room#` matches `room42`.

use std::sync::Arc;

use async_trait::async_trait;
use hearken_types::{BusError, QoS};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::connection::{
    BrokerConnection, BrokerConnector, BrokerLink, ConnectOptions, InboundPacket,
};

/// A request the loopback broker received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPacket {
    Connect(ConnectOptions),
    Publish {
        topic: String,
        packet_id: u16,
        payload: Vec<u8>,
        qos: QoS,
    },
    Subscribe {
        filter: String,
        packet_id: u16,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
        packet_id: u16,
    },
    Disconnect,
}

#[derive(Default)]
struct BrokerState {
    connack_code: u8,
    refuse_open: Option<String>,
    hold_acks: bool,
    held: Vec<InboundPacket>,
    filters: Vec<String>,
    sent: Vec<OutboundPacket>,
    client: Option<mpsc::UnboundedSender<InboundPacket>>,
    opened: usize,
}

impl BrokerState {
    fn is_current(&self, tx: &mpsc::UnboundedSender<InboundPacket>) -> bool {
        self.client
            .as_ref()
            .is_some_and(|client| client.same_channel(tx))
    }

    fn deliver(&self, packet: InboundPacket) -> bool {
        match &self.client {
            Some(client) => client.send(packet).is_ok(),
            None => false,
        }
    }

    fn acknowledge(&mut self, packet: InboundPacket) {
        if self.hold_acks {
            self.held.push(packet);
        } else {
            self.deliver(packet);
        }
    }
}

/// In-process broker.  Clones share the same broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer CONNECT with `code` instead of `0` (accepted).
    pub fn with_connack_code(self, code: u8) -> Self {
        self.state.lock().connack_code = code;
        self
    }

    /// Make subsequent `open` calls fail with a transport error, or accept
    /// them again with `None`.
    pub fn refuse_connections(&self, reason: Option<String>) {
        self.state.lock().refuse_open = reason;
    }

    /// Hold SUBACK and UNSUBACK packets back until released.
    pub fn hold_acks(&self, hold: bool) {
        self.state.lock().hold_acks = hold;
    }

    /// Send the held acknowledgement for `packet_id`.
    pub fn release_ack(&self, packet_id: u16) -> bool {
        let mut state = self.state.lock();
        let position = state.held.iter().position(|packet| {
            matches!(packet,
                InboundPacket::SubAck { packet_id: id } | InboundPacket::UnsubAck { packet_id: id }
                if *id == packet_id)
        });
        match position {
            Some(index) => {
                let packet = state.held.remove(index);
                state.deliver(packet)
            }
            None => false,
        }
    }

    /// Send every held acknowledgement in arrival order.
    pub fn release_all(&self) -> usize {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held);
        let count = held.len();
        for packet in held {
            state.deliver(packet);
        }
        count
    }

    /// Simulate a remote client publishing `payload` on `topic`.
    pub fn inject_publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let state = self.state.lock();
        if !state.filters.iter().any(|f| filter_matches(f, topic)) {
            return false;
        }
        state.deliver(InboundPacket::Publish {
            topic: topic.to_string(),
            packet_id: None,
            payload: payload.into(),
        })
    }

    /// Push an arbitrary packet onto the current connection.
    pub fn inject(&self, packet: InboundPacket) -> bool {
        self.state.lock().deliver(packet)
    }

    /// Simulate the connection dying: an error, then the close.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.state.lock();
        state.deliver(InboundPacket::Error(reason.to_string()));
        state.deliver(InboundPacket::Close);
        state.client = None;
        state.filters.clear();
    }

    /// Every request received so far, across connections.
    pub fn sent(&self) -> Vec<OutboundPacket> {
        self.state.lock().sent.clone()
    }

    /// Filters currently subscribed on the live connection.
    pub fn filters(&self) -> Vec<String> {
        self.state.lock().filters.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().opened
    }
}

#[async_trait]
impl BrokerConnector for LoopbackBroker {
    async fn open(&self, host: &str, port: u16) -> Result<BrokerLink, BusError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.refuse_open {
            return Err(BusError::Transport(format!("{host}:{port}: {reason}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.client = Some(tx.clone());
        state.filters.clear();
        state.held.clear();
        state.opened += 1;
        trace!(host, port, "loopback connection opened");
        Ok(BrokerLink {
            connection: Arc::new(LoopbackConnection {
                state: Arc::clone(&self.state),
                tx,
            }),
            inbound: rx,
        })
    }
}

struct LoopbackConnection {
    state: Arc<Mutex<BrokerState>>,
    tx: mpsc::UnboundedSender<InboundPacket>,
}

impl LoopbackConnection {
    fn live(&self) -> Result<parking_lot::MutexGuard<'_, BrokerState>, BusError> {
        let state = self.state.lock();
        if state.is_current(&self.tx) {
            Ok(state)
        } else {
            Err(BusError::Transport("connection closed".to_string()))
        }
    }
}

impl BrokerConnection for LoopbackConnection {
    fn connect(&self, options: &ConnectOptions) -> Result<(), BusError> {
        let mut state = self.live()?;
        state.sent.push(OutboundPacket::Connect(options.clone()));
        let return_code = state.connack_code;
        state.deliver(InboundPacket::ConnAck { return_code });
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        packet_id: u16,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), BusError> {
        let mut state = self.live()?;
        state.sent.push(OutboundPacket::Publish {
            topic: topic.to_string(),
            packet_id,
            payload: payload.clone(),
            qos,
        });
        if state.filters.iter().any(|f| filter_matches(f, topic)) {
            state.deliver(InboundPacket::Publish {
                topic: topic.to_string(),
                packet_id: None,
                payload,
            });
        }
        Ok(())
    }

    fn subscribe(&self, filter: &str, packet_id: u16, qos: QoS) -> Result<(), BusError> {
        let mut state = self.live()?;
        state.sent.push(OutboundPacket::Subscribe {
            filter: filter.to_string(),
            packet_id,
            qos,
        });
        if !state.filters.iter().any(|f| f == filter) {
            state.filters.push(filter.to_string());
        }
        state.acknowledge(InboundPacket::SubAck { packet_id });
        Ok(())
    }

    fn unsubscribe(&self, filter: &str, packet_id: u16) -> Result<(), BusError> {
        let mut state = self.live()?;
        state.sent.push(OutboundPacket::Unsubscribe {
            filter: filter.to_string(),
            packet_id,
        });
        state.filters.retain(|f| f != filter);
        state.acknowledge(InboundPacket::UnsubAck { packet_id });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BusError> {
        let mut state = self.live()?;
        state.sent.push(OutboundPacket::Disconnect);
        state.deliver(InboundPacket::Close);
        state.client = None;
        state.filters.clear();
        Ok(())
    }
}

/// Whether broker filter `filter` selects `topic`.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(level), rest) if level.contains('#') => {
                let head = level.split('#').next().unwrap_or_default();
                return match rest {
                    Some(topic_level) => topic_level.starts_with(head),
                    None => head.is_empty(),
                };
            }
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
