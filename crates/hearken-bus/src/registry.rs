//! [`TopicRegistry`] – the set of topics a bus has ever observed.
//!
//! A topic enters the registry the first time it is published to or
//! exactly subscribed to, and stays there until the bus shuts down.
//! Unsubscribing never forgets a topic: the registry answers "does this
//! topic exist?" for wildcard matchers, not "does anyone listen to it?".

use std::collections::HashSet;

/// Monotonically growing, insertion-ordered set of topic strings.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    order: Vec<String>,
    index: HashSet<String>,
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `topic` has been observed.
    pub fn contains(&self, topic: &str) -> bool {
        self.index.contains(topic)
    }

    /// Record `topic`.  Returns `true` only the first time a topic is seen.
    pub fn register(&mut self, topic: &str) -> bool {
        if self.index.contains(topic) {
            return false;
        }
        self.index.insert(topic.to_string());
        self.order.push(topic.to_string());
        true
    }

    /// Visit every known topic in insertion order.
    pub fn for_each(&self, mut visitor: impl FnMut(&str)) {
        for topic in &self.order {
            visitor(topic);
        }
    }

    /// Snapshot of every known topic in insertion order.
    pub fn topics(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forget every topic.  Only called when the owning bus shuts down.
    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}
