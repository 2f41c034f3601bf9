//! JSON payload codec used on the broker wire.
//!
//! The in-process bus never serialises; only the broker adapter turns a
//! [`Message`] into bytes and back.

use hearken_types::{BusError, Message};

/// Serialise `message` for transmission.
///
/// An absent message ([`Message::Null`]) is sent as `true`, so subscribers
/// on the far side always receive a payload.
pub fn encode(message: &Message) -> Result<Vec<u8>, BusError> {
    let encoded = match message {
        Message::Null => serde_json::to_vec(&true),
        other => serde_json::to_vec(other),
    };
    encoded.map_err(|e| BusError::Codec(e.to_string()))
}

/// Deserialise a payload received from the broker.
pub fn decode(payload: &[u8]) -> Result<Message, BusError> {
    serde_json::from_slice(payload).map_err(|e| BusError::Codec(e.to_string()))
}
