//! Topic pattern compilation and wildcard syntax translation.
//!
//! A pattern may contain one wildcard marker, [`WILDCARD`] (`*`), which
//! matches one or more characters.  Matching is an *unanchored* substring
//! search: `a*c` matches every topic that contains `"a"`, then at least one
//! character, then `"c"` somewhere inside it, so `"xaYYcz"` matches as well
//! as `"abc"`.
//!
//! Only the first `*` is a wildcard.  Any later `*` is matched literally;
//! patterns with several wildcards are not supported.

/// The bus's wildcard marker.
pub const WILDCARD: char = '*';

/// The broker protocol's multi-level wildcard token.
pub const BROKER_WILDCARD: char = '#';

/// Whether `pattern` contains a wildcard marker.
pub fn contains_wildcard(pattern: &str) -> bool {
    pattern.contains(WILDCARD)
}

/// Translate the first bus wildcard in `pattern` into the broker's
/// multi-level wildcard before it goes on the wire.
pub fn to_broker_filter(pattern: &str) -> String {
    pattern.replacen(WILDCARD, &BROKER_WILDCARD.to_string(), 1)
}

/// Inverse of [`to_broker_filter`], applied to topics arriving from the
/// broker.
pub fn from_broker_topic(topic: &str) -> String {
    topic.replacen(BROKER_WILDCARD, &WILDCARD.to_string(), 1)
}

/// A compiled wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    source: String,
    prefix: String,
    suffix: String,
}

impl WildcardPattern {
    /// Compile `pattern`.  Returns `None` when it holds no wildcard.
    pub fn compile(pattern: &str) -> Option<Self> {
        let (prefix, suffix) = pattern.split_once(WILDCARD)?;
        Some(Self {
            source: pattern.to_string(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// The pattern text this matcher was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `topic` contains `prefix`, one or more characters, then
    /// `suffix`.
    pub fn is_match(&self, topic: &str) -> bool {
        // The earliest occurrence of the prefix leaves the most room for the
        // rest, so it is the only one worth trying.
        let Some(start) = topic.find(self.prefix.as_str()) else {
            return false;
        };
        let mut rest = topic[start + self.prefix.len()..].chars();
        if rest.next().is_none() {
            return false;
        }
        rest.as_str().contains(self.suffix.as_str())
    }
}
