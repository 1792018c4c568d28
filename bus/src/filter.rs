//! Message filters.

use crate::message::BusMessage;

/// Predicate over messages. All filters on a channel must accept a message
/// before it is transmitted.
pub trait MessageFilter: Send + Sync {
    fn accepts(&self, msg: &BusMessage) -> bool;

    fn name(&self) -> &str;
}

/// Matches the message topic against a glob pattern (`*` and `?`).
pub struct TopicFilter {
    pattern: String,
}

impl TopicFilter {
    pub fn new(pattern: impl Into<String>) -> TopicFilter {
        TopicFilter {
            pattern: pattern.into(),
        }
    }
}

impl MessageFilter for TopicFilter {
    fn accepts(&self, msg: &BusMessage) -> bool {
        glob_match(&msg.topic, &self.pattern)
    }

    fn name(&self) -> &str {
        "topic"
    }
}

/// Matches the sender exactly.
pub struct SenderFilter {
    sender: String,
}

impl SenderFilter {
    pub fn new(sender: impl Into<String>) -> SenderFilter {
        SenderFilter {
            sender: sender.into(),
        }
    }
}

impl MessageFilter for SenderFilter {
    fn accepts(&self, msg: &BusMessage) -> bool {
        msg.sender == self.sender
    }

    fn name(&self) -> &str {
        "sender"
    }
}

/// Glob match with `*` (any run) and `?` (any one byte). Iterative with
/// star backtracking, so pathological patterns stay linear-ish.
pub fn glob_match(text: &str, pattern: &str) -> bool {
    let text = text.as_bytes();
    let pattern = pattern.as_bytes();
    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_exact_and_wildcards() {
        assert!(glob_match("sensor.temp", "sensor.temp"));
        assert!(glob_match("sensor.temp", "sensor.*"));
        assert!(glob_match("sensor.temp", "*"));
        assert!(glob_match("sensor.temp", "s?nsor.*"));
        assert!(glob_match("", "*"));
        assert!(!glob_match("sensor.temp", "sensor"));
        assert!(!glob_match("sensor", "sensor.*"));
        assert!(!glob_match("abc", "a?c?"));
    }

    #[test]
    fn test_topic_filter() {
        let f = TopicFilter::new("inference.*");
        assert!(f.accepts(&BusMessage::new("x").with_topic("inference.request")));
        assert!(!f.accepts(&BusMessage::new("x").with_topic("control.stop")));
    }

    #[test]
    fn test_sender_filter() {
        let f = SenderFilter::new("gateway");
        assert!(f.accepts(&BusMessage::new("x").with_sender("gateway")));
        assert!(!f.accepts(&BusMessage::new("x").with_sender("other")));
    }
}
