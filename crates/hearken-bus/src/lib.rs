//! # hearken-bus
//!
//! Topic-based publish/subscribe with interchangeable backends.
//!
//! | Module | Contents |
//! |---|---|
//! | [`backend`] | The [`Backend`] trait, [`Subscriber`] and [`Completion`] |
//! | [`memory`] | [`MemoryBus`], synchronous in-process delivery |
//! | [`broker`] | [`BrokerAdapter`] and the [`LoopbackBroker`] connector |
//! | [`registry`] | [`TopicRegistry`], topics in first-seen order |
//! | [`pattern`] | `*` wildcard matching and broker filter translation |
//! | [`codec`] | JSON payload encoding for the broker wire |
//!
//! ```no_run
//! use hearken_bus::{Backend, MemoryBus, Subscriber};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), hearken_types::BusError> {
//! let bus = MemoryBus::new();
//! bus.subscribe("room*", Subscriber::new(|topic, msg| println!("{topic}: {msg}")))?;
//! bus.publish("room42", json!({"lights": "on"}))?.await?;
//! bus.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod broker;
pub mod codec;
pub mod memory;
pub(crate) mod notify;
pub mod pattern;
pub mod registry;

pub use backend::{Backend, Completion, CompletionHandle, Subscriber};
pub use broker::{BrokerAdapter, BrokerConnector, LoopbackBroker};
pub use memory::MemoryBus;
pub use pattern::WildcardPattern;
pub use registry::TopicRegistry;
