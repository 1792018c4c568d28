//! Topic → channel routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;

use crate::channel::{Channel, ErrorCallback};
use crate::message::BusMessage;

/// Registry of channels plus the topic routing table.
///
/// Routing entries are ordered and deduplicated per `(topic, channel)`
/// edge. Routes may name channels that are not (yet) registered; those
/// produce a routing error at send time, not at configuration time.
#[derive(Default)]
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    routes: RwLock<HashMap<String, Vec<String>>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    routed: AtomicU64,
    routing_misses: AtomicU64,
    broadcasts: AtomicU64,
}

impl ChannelManager {
    pub fn new() -> ChannelManager {
        ChannelManager::default()
    }

    /// Register a channel under its own name. Refuses duplicates.
    pub fn register_channel(&self, channel: Arc<dyn Channel>) -> bool {
        let name = channel.name().to_string();
        let mut channels = self.channels.write().unwrap();
        if channels.contains_key(&name) {
            tracing::warn!(channel = %name, "duplicate channel registration");
            return false;
        }
        channels.insert(name, channel);
        true
    }

    pub fn unregister_channel(&self, name: &str) -> bool {
        self.channels.write().unwrap().remove(name).is_some()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.read().unwrap().get(name).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().unwrap().keys().cloned().collect()
    }

    pub fn start_all(&self) {
        for channel in self.channels.read().unwrap().values() {
            channel.start();
        }
    }

    pub fn stop_all(&self) {
        for channel in self.channels.read().unwrap().values() {
            channel.stop();
        }
    }

    pub fn set_error_callback(&self, cb: ErrorCallback) {
        *self.error_cb.lock().unwrap() = Some(cb);
    }

    /// Append a `(topic, channel)` edge; duplicates collapse to one.
    pub fn add_route(&self, topic: impl Into<String>, channel_name: impl Into<String>) {
        let channel_name = channel_name.into();
        let mut routes = self.routes.write().unwrap();
        let entry = routes.entry(topic.into()).or_default();
        if !entry.contains(&channel_name) {
            entry.push(channel_name);
        }
    }

    /// Remove an edge; tolerant of absence.
    pub fn remove_route(&self, topic: &str, channel_name: &str) {
        let mut routes = self.routes.write().unwrap();
        if let Some(entry) = routes.get_mut(topic) {
            entry.retain(|n| n != channel_name);
            if entry.is_empty() {
                routes.remove(topic);
            }
        }
    }

    pub fn clear_routes(&self, topic: &str) {
        self.routes.write().unwrap().remove(topic);
    }

    pub fn channels_for_topic(&self, topic: &str) -> Vec<String> {
        self.routes
            .read()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Route by the message's topic. Returns the number of channels that
    /// accepted the message. A topic with no routes counts as a routing
    /// miss; routed names with no registered channel surface through the
    /// error hook.
    pub fn route_message(&self, msg: &BusMessage) -> usize {
        let targets = self.channels_for_topic(&msg.topic);
        if targets.is_empty() {
            self.routing_misses.fetch_add(1, Ordering::Relaxed);
            self.report_error(&format!("no route for topic '{}'", msg.topic));
            return 0;
        }

        let mut delivered = 0;
        for name in targets {
            match self.channel(&name) {
                Some(channel) => {
                    if channel.send(msg) {
                        delivered += 1;
                    }
                }
                None => {
                    self.report_error(&format!(
                        "route for topic '{}' names unregistered channel '{}'",
                        msg.topic, name
                    ));
                }
            }
        }
        self.routed.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Build a message and route it.
    pub fn route(&self, topic: impl Into<String>, content: impl Into<Bytes>) -> usize {
        let msg = BusMessage::new(content).with_topic(topic);
        self.route_message(&msg)
    }

    /// Ignore routing and send to every registered active channel.
    pub fn broadcast(&self, msg: &BusMessage) -> usize {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let channels: Vec<_> = self.channels.read().unwrap().values().cloned().collect();
        let mut delivered = 0;
        for channel in channels {
            if channel.is_active() && channel.send(msg) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn messages_routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn routing_misses(&self) -> u64 {
        self.routing_misses.load(Ordering::Relaxed)
    }

    pub fn broadcast_count(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    fn report_error(&self, error: &str) {
        tracing::warn!(error, "routing error");
        let cb = self.error_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelKind, InProcChannel};
    use std::sync::mpsc;
    use std::time::Duration;

    fn tracked_channel(name: &str) -> (Arc<InProcChannel>, mpsc::Receiver<String>) {
        let ch = InProcChannel::new(name, ChannelKind::PointToPoint);
        let (tx, rx) = mpsc::channel();
        let tag = name.to_string();
        ch.set_message_callback(Arc::new(move |_msg| {
            let _ = tx.send(tag.clone());
        }));
        ch.start();
        (ch, rx)
    }

    #[test]
    fn test_topic_routing_delivers_to_listed_channels_only() {
        let manager = ChannelManager::new();
        let (c1, r1) = tracked_channel("c1");
        let (c2, r2) = tracked_channel("c2");
        let (c3, r3) = tracked_channel("c3");
        manager.register_channel(c1);
        manager.register_channel(c2);
        manager.register_channel(c3);

        manager.add_route("t", "c1");
        manager.add_route("t", "c2");
        // Duplicate edge collapses.
        manager.add_route("t", "c1");
        assert_eq!(manager.channels_for_topic("t"), vec!["c1", "c2"]);

        assert_eq!(manager.route("t", "payload"), 2);
        assert_eq!(manager.messages_routed(), 2);
        r1.recv_timeout(Duration::from_secs(5)).unwrap();
        r2.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(r3.recv_timeout(Duration::from_millis(200)).is_err());

        // Unknown topic: delivered nowhere, miss counted.
        assert_eq!(manager.route("u", "x"), 0);
        assert_eq!(manager.routing_misses(), 1);
    }

    #[test]
    fn test_route_to_unregistered_channel_reports_error() {
        let manager = ChannelManager::new();
        let (errors_tx, errors_rx) = mpsc::channel();
        manager.set_error_callback(Arc::new(move |e| {
            let _ = errors_tx.send(e.to_string());
        }));

        manager.add_route("t", "ghost");
        assert_eq!(manager.route("t", "x"), 0);
        let err = errors_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(err.contains("ghost"));
        // A resolvable route with a dead edge is not a topic miss.
        assert_eq!(manager.routing_misses(), 0);
    }

    #[test]
    fn test_remove_route_tolerates_absence() {
        let manager = ChannelManager::new();
        manager.remove_route("nope", "c1");
        manager.add_route("t", "c1");
        manager.remove_route("t", "c1");
        assert!(manager.channels_for_topic("t").is_empty());
    }

    #[test]
    fn test_broadcast_hits_all_active_channels() {
        let manager = ChannelManager::new();
        let (c1, r1) = tracked_channel("c1");
        let (c2, r2) = tracked_channel("c2");
        manager.register_channel(c1);
        manager.register_channel(c2.clone());
        c2.stop();

        let delivered = manager.broadcast(&BusMessage::new("hello"));
        assert_eq!(delivered, 1);
        r1.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(r2.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(manager.broadcast_count(), 1);
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let manager = ChannelManager::new();
        let a = InProcChannel::new("dup", ChannelKind::PointToPoint);
        let b = InProcChannel::new("dup", ChannelKind::Broadcast);
        assert!(manager.register_channel(a));
        assert!(!manager.register_channel(b));
        assert_eq!(manager.channel_count(), 1);
        assert!(manager.unregister_channel("dup"));
        assert!(!manager.unregister_channel("dup"));
    }
}
