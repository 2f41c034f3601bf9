//! [`MemoryBus`] – the in-process backend.
//!
//! Dispatch is synchronous: `publish` runs every matching callback on the
//! calling thread before it returns, in the order the callbacks subscribed.
//!
//! # Subscriptions
//!
//! * **Exact** patterns attach the callback to the topic's delivery channel.
//!   The topic is registered in the bus's [`TopicRegistry`] if it is new.
//! * **Wildcard** patterns (see [`crate::pattern`]) attach the callback to
//!   every known topic that matches, and keep a matcher that attaches it to
//!   matching topics first seen later on.
//!
//! Every wildcard matcher stays active until it is unsubscribed.  A
//! subscriber is associated with one matcher for unsubscription, though:
//! subscribing the same [`Subscriber`] to a second wildcard pattern moves the
//! association to the new matcher, and the earlier matcher can no longer be
//! removed through `unsubscribe`.
//!
//! The tables sit behind a mutex that is never held while a callback runs,
//! so callbacks may publish or subscribe on the same bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hearken_types::{BusError, BusNotification, LifecycleState, Message};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::backend::{Backend, Completion, Subscriber};
use crate::notify::Lifecycle;
use crate::pattern::{WildcardPattern, contains_wildcard};
use crate::registry::TopicRegistry;

type NewTopicHook = Arc<dyn Fn(&str) + Send + Sync>;

struct WildcardEntry {
    id: u64,
    pattern: WildcardPattern,
    subscriber: Subscriber,
}

#[derive(Default)]
struct Tables {
    registry: TopicRegistry,
    channels: HashMap<String, Vec<Subscriber>>,
    wildcards: Vec<WildcardEntry>,
    // Subscriber key to the id of the matcher `unsubscribe` removes.
    associations: HashMap<usize, u64>,
    next_wildcard_id: u64,
    hooks: Vec<NewTopicHook>,
    closed: bool,
}

impl Tables {
    fn attach(&mut self, topic: &str, subscriber: Subscriber) {
        self.channels
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);
    }

    // Removes the most recent attachment only.
    fn detach(&mut self, topic: &str, subscriber: &Subscriber) -> bool {
        let Some(channel) = self.channels.get_mut(topic) else {
            return false;
        };
        let Some(position) = channel.iter().rposition(|s| s == subscriber) else {
            return false;
        };
        channel.remove(position);
        if channel.is_empty() {
            self.channels.remove(topic);
        }
        true
    }

    fn known_matching(&self, pattern: &WildcardPattern) -> Vec<String> {
        let mut topics = Vec::new();
        self.registry.for_each(|topic| {
            if pattern.is_match(topic) {
                topics.push(topic.to_string());
            }
        });
        topics
    }

    /// Register `topic`; on its first sighting attach every wildcard
    /// subscriber whose matcher accepts it.  Returns whether it was new.
    fn observe(&mut self, topic: &str) -> bool {
        if !self.registry.register(topic) {
            return false;
        }
        let matching: Vec<Subscriber> = self
            .wildcards
            .iter()
            .filter(|entry| entry.pattern.is_match(topic))
            .map(|entry| entry.subscriber.clone())
            .collect();
        for subscriber in matching {
            self.attach(topic, subscriber);
        }
        true
    }
}

/// Process-local publish/subscribe bus.
pub struct MemoryBus {
    tables: Mutex<Tables>,
    lifecycle: Lifecycle,
}

impl MemoryBus {
    /// Create a bus.  It is ready as soon as it exists.
    pub fn new() -> Self {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Ready);
        lifecycle.emit(BusNotification::Ready);
        Self {
            tables: Mutex::new(Tables::default()),
            lifecycle,
        }
    }

    /// Run `hook` synchronously every time a topic is seen for the first
    /// time, before the message that introduced it is dispatched.
    pub fn on_new_topic(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.tables.lock().hooks.push(Arc::new(hook));
    }

    fn announce(&self, topic: &str) {
        debug!(topic = %topic, "topic first seen");
        let hooks = self.tables.lock().hooks.clone();
        for hook in &hooks {
            hook(topic);
        }
        self.lifecycle
            .emit(BusNotification::NewTopic(topic.to_string()));
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBus {
    fn subscribe(&self, pattern: &str, subscriber: Subscriber) -> Result<Completion, BusError> {
        let first_seen = {
            let mut tables = self.tables.lock();
            if tables.closed {
                return Err(BusError::UseAfterClose);
            }
            match WildcardPattern::compile(pattern) {
                Some(matcher) => {
                    let id = tables.next_wildcard_id;
                    tables.next_wildcard_id += 1;
                    tables.associations.insert(subscriber.key(), id);
                    let known = tables.known_matching(&matcher);
                    debug!(pattern = %pattern, attached = known.len(), "wildcard subscription");
                    for topic in &known {
                        tables.attach(topic, subscriber.clone());
                    }
                    tables.wildcards.push(WildcardEntry {
                        id,
                        pattern: matcher,
                        subscriber,
                    });
                    false
                }
                None => {
                    let first_seen = tables.observe(pattern);
                    tables.attach(pattern, subscriber);
                    first_seen
                }
            }
        };
        if first_seen {
            self.announce(pattern);
        }
        Ok(Completion::done())
    }

    fn publish(&self, topic: &str, message: Message) -> Result<Completion, BusError> {
        let first_seen = {
            let mut tables = self.tables.lock();
            if tables.closed {
                return Err(BusError::UseAfterClose);
            }
            tables.observe(topic)
        };
        if first_seen {
            self.announce(topic);
        }

        let listeners = self
            .tables
            .lock()
            .channels
            .get(topic)
            .cloned()
            .unwrap_or_default();
        trace!(topic = %topic, subscribers = listeners.len(), "dispatching");
        for subscriber in &listeners {
            subscriber.deliver(topic, &message);
        }
        Ok(Completion::done())
    }

    fn unsubscribe(
        &self,
        pattern: &str,
        subscriber: &Subscriber,
    ) -> Result<Completion, BusError> {
        let mut tables = self.tables.lock();
        if tables.closed {
            return Err(BusError::UseAfterClose);
        }
        let associated = if contains_wildcard(pattern) {
            tables.associations.remove(&subscriber.key())
        } else {
            None
        };
        let wildcard = associated
            .and_then(|id| tables.wildcards.iter().position(|entry| entry.id == id));
        match wildcard {
            Some(index) => {
                let entry = tables.wildcards.remove(index);
                for topic in tables.known_matching(&entry.pattern) {
                    tables.detach(&topic, subscriber);
                }
            }
            None => {
                tables.detach(pattern, subscriber);
            }
        }
        Ok(Completion::done())
    }

    fn close(&self) -> Completion {
        {
            let mut tables = self.tables.lock();
            if tables.closed {
                return Completion::done();
            }
            tables.closed = true;
            tables.registry.clear();
            tables.channels.clear();
            tables.wildcards.clear();
            tables.associations.clear();
            tables.hooks.clear();
        }
        if self.lifecycle.advance(LifecycleState::Closed) {
            self.lifecycle.emit(BusNotification::Closed);
        }
        debug!("memory bus closed");
        Completion::done()
    }

    fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.watch()
    }

    fn notifications(&self) -> broadcast::Receiver<BusNotification> {
        self.lifecycle.subscribe()
    }

    fn known_topics(&self) -> Vec<String> {
        self.tables.lock().registry.topics()
    }
}
