//! Broker-backed delivery.
//!
//! [`BrokerAdapter`] implements [`Backend`][crate::Backend] on top of a
//! [`BrokerConnector`].  [`LoopbackBroker`] is a connector that needs no
//! network.

mod adapter;
mod connection;
mod correlation;
mod loopback;

pub use adapter::BrokerAdapter;
pub use connection::{BrokerConnection, BrokerConnector, BrokerLink, ConnectOptions, InboundPacket};
pub use correlation::{CorrelationTable, Ticket, random_packet_id};
pub use loopback::{LoopbackBroker, OutboundPacket, filter_matches};
