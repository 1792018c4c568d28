//! Channel contract and the in-process transport.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::filter::{MessageFilter, glob_match};
use crate::message::BusMessage;

/// Messaging pattern a channel implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    PointToPoint,
    PublishSubscribe,
    RequestResponse,
    Broadcast,
    Multicast,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::PointToPoint => "point_to_point",
            ChannelKind::PublishSubscribe => "publish_subscribe",
            ChannelKind::RequestResponse => "request_response",
            ChannelKind::Broadcast => "broadcast",
            ChannelKind::Multicast => "multicast",
        }
    }

    /// Whether the kind supports topic subscriptions. Multicast does, the
    /// remaining non-pub-sub kinds do not.
    pub fn supports_subscriptions(self) -> bool {
        matches!(
            self,
            ChannelKind::PublishSubscribe | ChannelKind::Multicast
        )
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type MessageCallback = Arc<dyn Fn(&BusMessage) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// State shared by every channel implementation: identity, filters,
/// callbacks and counters. Implementations embed one (behind `Arc`, so
/// receive threads can hold it) and expose it through [`Channel::core`].
pub struct ChannelCore {
    name: String,
    kind: ChannelKind,
    active: AtomicBool,
    filters: RwLock<Vec<Arc<dyn MessageFilter>>>,
    message_cb: Mutex<Option<MessageCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

impl ChannelCore {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> ChannelCore {
        ChannelCore {
            name: name.into(),
            kind,
            active: AtomicBool::new(false),
            filters: RwLock::new(Vec::new()),
            message_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// True when every filter accepts the message.
    pub fn apply_filters(&self, msg: &BusMessage) -> bool {
        self.filters
            .read()
            .unwrap()
            .iter()
            .all(|f| f.accepts(msg))
    }

    /// Count a delivery and invoke the message callback. Transports call
    /// this from their receive thread.
    pub fn notify_message_received(&self, msg: &BusMessage) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let cb = self.message_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(msg);
        }
    }

    pub fn notify_error(&self, error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(channel = %self.name, error, "channel error");
        let cb = self.error_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(error);
        }
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A named transport endpoint.
///
/// `send` runs the filter chain first; a message any filter rejects is
/// not transmitted. The delivery side invokes the message callback on
/// whatever thread the transport receives on — user code must be ready
/// for that.
pub trait Channel: Send + Sync {
    fn core(&self) -> &ChannelCore;

    /// Activate the transport. Returns `false` when the channel cannot
    /// start (already running, transport failure).
    fn start(&self) -> bool;

    fn stop(&self);

    /// Filter, then transmit. `true` means the message was handed to the
    /// transport.
    fn send(&self, msg: &BusMessage) -> bool;

    /// Subscribe to a topic pattern. Only meaningful for kinds that
    /// support subscriptions; others refuse.
    fn subscribe(&self, _topic: &str) -> bool {
        false
    }

    fn unsubscribe(&self, _topic: &str) -> bool {
        false
    }

    // Conveniences forwarded to the core.

    fn name(&self) -> &str {
        self.core().name()
    }

    fn kind(&self) -> ChannelKind {
        self.core().kind()
    }

    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    fn add_filter(&self, filter: Arc<dyn MessageFilter>) {
        self.core().filters.write().unwrap().push(filter);
    }

    fn remove_filter(&self, name: &str) {
        self.core()
            .filters
            .write()
            .unwrap()
            .retain(|f| f.name() != name);
    }

    fn clear_filters(&self) {
        self.core().filters.write().unwrap().clear();
    }

    fn set_message_callback(&self, cb: MessageCallback) {
        *self.core().message_cb.lock().unwrap() = Some(cb);
    }

    fn set_error_callback(&self, cb: ErrorCallback) {
        *self.core().error_cb.lock().unwrap() = Some(cb);
    }
}

/// Loopback transport delivering over a crossbeam channel.
///
/// Messages sent into the channel are handed to a dedicated receive
/// thread, which applies subscriptions (for subscription-capable kinds)
/// and invokes the message callback on that thread — the same contract as
/// a brokered transport's receive loop.
pub struct InProcChannel {
    core: Arc<ChannelCore>,
    tx: crossbeam_channel::Sender<BusMessage>,
    rx: crossbeam_channel::Receiver<BusMessage>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
    stop_requested: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl InProcChannel {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Arc<InProcChannel> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(InProcChannel {
            core: Arc::new(ChannelCore::new(name, kind)),
            tx,
            rx,
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
            stop_requested: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
        })
    }

    /// Whether the receive side delivers a message with this topic. An
    /// empty subscription set delivers everything.
    fn delivers(kind: ChannelKind, subscriptions: &RwLock<HashSet<String>>, topic: &str) -> bool {
        if !kind.supports_subscriptions() {
            return true;
        }
        let subs = subscriptions.read().unwrap();
        subs.is_empty() || subs.iter().any(|pat| glob_match(topic, pat))
    }
}

impl Channel for InProcChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn start(&self) -> bool {
        if self.core.is_active() {
            return false;
        }
        self.stop_requested.store(false, Ordering::Release);
        self.core.set_active(true);

        let rx = self.rx.clone();
        let stop = self.stop_requested.clone();
        let subscriptions = self.subscriptions.clone();
        let core = self.core.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-recv", self.core.name()))
            .spawn(move || {
                loop {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    match rx.recv_timeout(Duration::from_millis(50)) {
                        Ok(msg) => {
                            if InProcChannel::delivers(core.kind(), &subscriptions, &msg.topic) {
                                core.notify_message_received(&msg);
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("failed to spawn channel receive thread");
        *self.receiver.lock().unwrap() = Some(handle);
        tracing::debug!(channel = self.core.name(), kind = %self.core.kind(), "channel started");
        true
    }

    fn stop(&self) {
        if !self.core.is_active() {
            return;
        }
        self.core.set_active(false);
        self.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            let _ = handle.join();
        }
        tracing::debug!(channel = self.core.name(), "channel stopped");
    }

    fn send(&self, msg: &BusMessage) -> bool {
        if !self.core.is_active() {
            self.core.notify_error("send on inactive channel");
            return false;
        }
        if !self.core.apply_filters(msg) {
            tracing::trace!(channel = self.core.name(), id = %msg.id, "filtered out");
            return false;
        }
        if self.tx.send(msg.clone()).is_err() {
            self.core.notify_error("transport disconnected");
            return false;
        }
        self.core.record_sent();
        true
    }

    fn subscribe(&self, topic: &str) -> bool {
        if !self.core.kind().supports_subscriptions() {
            return false;
        }
        self.subscriptions
            .write()
            .unwrap()
            .insert(topic.to_string());
        true
    }

    fn unsubscribe(&self, topic: &str) -> bool {
        if !self.core.kind().supports_subscriptions() {
            return false;
        }
        self.subscriptions.write().unwrap().remove(topic)
    }
}

impl Drop for InProcChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TopicFilter;
    use std::sync::mpsc;

    fn recv_one(rx: &mpsc::Receiver<BusMessage>) -> BusMessage {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_send_delivers_on_receive_thread() {
        let ch = InProcChannel::new("p2p", ChannelKind::PointToPoint);
        let (tx, rx) = mpsc::channel();
        let main_thread = std::thread::current().id();
        ch.set_message_callback(Arc::new(move |msg| {
            assert_ne!(std::thread::current().id(), main_thread);
            let _ = tx.send(msg.clone());
        }));
        assert!(ch.start());

        assert!(ch.send(&BusMessage::new("ping").with_topic("t")));
        let got = recv_one(&rx);
        assert_eq!(&got.content[..], b"ping");
        assert_eq!(ch.core().messages_sent(), 1);

        ch.stop();
        assert_eq!(ch.core().messages_received(), 1);
    }

    #[test]
    fn test_send_on_inactive_channel_fails() {
        let ch = InProcChannel::new("idle", ChannelKind::PointToPoint);
        assert!(!ch.send(&BusMessage::new("x")));
        assert_eq!(ch.core().error_count(), 1);
    }

    #[test]
    fn test_filters_gate_transmission() {
        let ch = InProcChannel::new("filtered", ChannelKind::PointToPoint);
        ch.add_filter(Arc::new(TopicFilter::new("metrics.*")));
        ch.start();

        assert!(ch.send(&BusMessage::new("a").with_topic("metrics.cpu")));
        assert!(!ch.send(&BusMessage::new("b").with_topic("logs.app")));
        assert_eq!(ch.core().messages_sent(), 1);

        ch.remove_filter("topic");
        assert!(ch.send(&BusMessage::new("c").with_topic("logs.app")));
        ch.stop();
    }

    #[test]
    fn test_subscribe_only_for_capable_kinds() {
        let p2p = InProcChannel::new("a", ChannelKind::PointToPoint);
        let reqrep = InProcChannel::new("b", ChannelKind::RequestResponse);
        let bcast = InProcChannel::new("c", ChannelKind::Broadcast);
        let pubsub = InProcChannel::new("d", ChannelKind::PublishSubscribe);
        let mcast = InProcChannel::new("e", ChannelKind::Multicast);

        assert!(!p2p.subscribe("t"));
        assert!(!reqrep.subscribe("t"));
        assert!(!bcast.subscribe("t"));
        assert!(pubsub.subscribe("t"));
        assert!(mcast.subscribe("t"));

        assert!(pubsub.unsubscribe("t"));
        assert!(!pubsub.unsubscribe("t"));
    }

    #[test]
    fn test_subscription_filters_delivery() {
        let ch = InProcChannel::new("sub", ChannelKind::PublishSubscribe);
        let (tx, rx) = mpsc::channel();
        ch.set_message_callback(Arc::new(move |msg| {
            let _ = tx.send(msg.topic.clone());
        }));
        ch.subscribe("sensor.*");
        ch.start();

        ch.send(&BusMessage::new("x").with_topic("other.topic"));
        ch.send(&BusMessage::new("y").with_topic("sensor.temp"));

        // Only the matching topic arrives.
        assert_eq!(recv_one_topic(&rx), "sensor.temp");
        ch.stop();
    }

    fn recv_one_topic(rx: &mpsc::Receiver<String>) -> String {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }
}
