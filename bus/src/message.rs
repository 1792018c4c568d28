//! Bus message value type.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Message urgency. Only relative order matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A routable message: stable id, endpoints, topic, opaque content.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub topic: String,
    pub content: Bytes,
    pub priority: Priority,
    pub timestamp_ms: u64,
    metadata: HashMap<String, String>,
}

impl BusMessage {
    pub fn new(content: impl Into<Bytes>) -> BusMessage {
        BusMessage {
            id: format!("m-{:08x}", NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)),
            sender: String::new(),
            receiver: String::new(),
            topic: String::new(),
            content: content.into(),
            priority: Priority::Normal,
            timestamp_ms: now_ms(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> BusMessage {
        self.topic = topic.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> BusMessage {
        self.sender = sender.into();
        self
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> BusMessage {
        self.receiver = receiver.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> BusMessage {
        self.priority = priority;
        self
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} -> {}] topic={} {}B {}",
            self.id,
            self.sender,
            self.receiver,
            self.topic,
            self.content.len(),
            self.priority
        )
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = BusMessage::new("x");
        let b = BusMessage::new("y");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_metadata_accessors() {
        let mut msg = BusMessage::new("payload").with_topic("t");
        assert!(!msg.has_metadata("trace"));
        msg.set_metadata("trace", "abc");
        assert_eq!(msg.metadata("trace"), Some("abc"));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
