//! Event value type.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Event classification. Handlers register per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SystemStart,
    SystemStop,
    ServiceRegister,
    ServiceUnregister,
    MessageReceived,
    ConnectionEstablished,
    ConnectionLost,
    ErrorOccurred,
    Custom,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::SystemStart,
        EventKind::SystemStop,
        EventKind::ServiceRegister,
        EventKind::ServiceUnregister,
        EventKind::MessageReceived,
        EventKind::ConnectionEstablished,
        EventKind::ConnectionLost,
        EventKind::ErrorOccurred,
        EventKind::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SystemStart => "system_start",
            EventKind::SystemStop => "system_stop",
            EventKind::ServiceRegister => "service_register",
            EventKind::ServiceUnregister => "service_unregister",
            EventKind::MessageReceived => "message_received",
            EventKind::ConnectionEstablished => "connection_established",
            EventKind::ConnectionLost => "connection_lost",
            EventKind::ErrorOccurred => "error_occurred",
            EventKind::Custom => "custom",
        }
    }

    /// Parse a kind name; anything unrecognized is `Custom`.
    pub fn parse(s: &str) -> EventKind {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .unwrap_or(EventKind::Custom)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event: kind, source/target, string payload map, priority.
///
/// Larger priority sorts ahead of smaller when events are queued at the
/// same instant. The timestamp is stamped at construction, in milliseconds
/// since the epoch.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub source: String,
    pub target: String,
    data: HashMap<String, String>,
    pub timestamp_ms: u64,
    pub priority: u32,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, target: impl Into<String>) -> Event {
        Event {
            kind,
            source: source.into(),
            target: target.into(),
            data: HashMap::new(),
            timestamp_ms: now_ms(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Event {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Event {
        self.set_data(key, value);
        self
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn data(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), kind);
        }
        assert_eq!(EventKind::parse("no-such-kind"), EventKind::Custom);
    }

    #[test]
    fn test_data_accessors() {
        let mut ev = Event::new(EventKind::Custom, "src", "tgt");
        assert!(!ev.has_data("k"));
        ev.set_data("k", "v");
        assert_eq!(ev.data("k"), Some("v"));
        assert!(ev.has_data("k"));
        assert_eq!(ev.data("missing"), None);
    }

    #[test]
    fn test_builder_style() {
        let ev = Event::new(EventKind::MessageReceived, "a", "b")
            .with_priority(7)
            .with_data("size", "42");
        assert_eq!(ev.priority, 7);
        assert_eq!(ev.data("size"), Some("42"));
        assert!(ev.timestamp_ms > 0);
    }
}
