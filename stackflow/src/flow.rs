//! The flow engine: bounded event queue, worker thread, registries.

use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::event::{Event, EventKind};
use crate::handler::EventHandler;
use crate::workflow::{StepStatus, WorkflowStep};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Why a publish was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    /// The bounded queue is full; the caller decides the policy.
    QueueFull,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::QueueFull => f.write_str("event queue is full"),
        }
    }
}

impl std::error::Error for PublishError {}

/// Queue entry: higher priority first, publish order within a priority.
struct QueuedEvent {
    event: Event,
    seq: u64,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.event
            .priority
            .cmp(&other.event.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct FlowShared {
    name: String,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    capacity: usize,
    available: Condvar,
    stop_requested: AtomicBool,
    seq: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    workflows: Mutex<HashMap<String, Arc<WorkflowStep>>>,
    events_processed: AtomicU64,
    workflows_executed: AtomicU64,
    errors: AtomicU64,
}

impl FlowShared {
    fn worker_loop(&self) {
        loop {
            let event = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if self.stop_requested.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(entry) = queue.pop() {
                        break entry.event;
                    }
                    queue = self.available.wait(queue).unwrap();
                }
            };
            self.process_event(&event);
            self.trigger_workflows(&event);
        }
    }

    fn process_event(&self, event: &Event) {
        // Snapshot so user code runs without the registry lock held.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if !handler.handle(event) {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    flow = %self.name,
                    handler = handler.name(),
                    kind = %event.kind,
                    "handler reported failure"
                );
            }
        }
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Offer the event to every registered workflow; the root (typically a
    /// condition) decides whether the run amounts to anything.
    fn trigger_workflows(&self, event: &Event) {
        let workflows: Vec<(String, Arc<WorkflowStep>)> = self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (name, root) in workflows {
            root.reset();
            let ok = root.execute(event);
            if root.status() == StepStatus::Skipped {
                continue;
            }
            self.workflows_executed.fetch_add(1, Ordering::Relaxed);
            if !ok {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(flow = %self.name, workflow = %name, "workflow failed");
            }
        }
    }
}

/// Event bus instance: handler registry, workflow registry, and one worker
/// thread draining a bounded queue.
pub struct StackFlow {
    shared: Arc<FlowShared>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StackFlow {
    pub fn new(name: impl Into<String>) -> StackFlow {
        Self::with_capacity(name, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> StackFlow {
        StackFlow {
            shared: Arc::new(FlowShared {
                name: name.into(),
                queue: Mutex::new(BinaryHeap::new()),
                capacity,
                available: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                handlers: RwLock::new(HashMap::new()),
                workflows: Mutex::new(HashMap::new()),
                events_processed: AtomicU64::new(0),
                workflows_executed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the worker. Returns `false` when already running.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.stop_requested.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-flow", self.shared.name))
            .spawn(move || shared.worker_loop())
            .expect("failed to spawn flow worker");
        *self.worker.lock().unwrap() = Some(handle);
        tracing::info!(flow = %self.shared.name, "flow started");
        true
    }

    /// Stop the worker after the event it is currently processing. Queued
    /// events are dropped (the queue is not durable).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.available.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        let dropped = {
            let mut queue = self.shared.queue.lock().unwrap();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(flow = %self.shared.name, dropped, "dropped queued events");
        }
        tracing::info!(flow = %self.shared.name, "flow stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.shared
            .handlers
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Remove handlers registered under `kind` with the given name.
    pub fn unregister_handler(&self, kind: EventKind, name: &str) {
        if let Some(list) = self.shared.handlers.write().unwrap().get_mut(&kind) {
            list.retain(|h| h.name() != name);
        }
    }

    pub fn unregister_all_handlers(&self, kind: EventKind) {
        self.shared.handlers.write().unwrap().remove(&kind);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.shared
            .handlers
            .read()
            .unwrap()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Enqueue an event. Fails when the bounded queue is full.
    pub fn publish(&self, event: Event) -> Result<(), PublishError> {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.shared.capacity {
            return Err(PublishError::QueueFull);
        }
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        queue.push(QueuedEvent { event, seq });
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn publish_kind(
        &self,
        kind: EventKind,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), PublishError> {
        self.publish(Event::new(kind, source, target))
    }

    pub fn register_workflow(&self, name: impl Into<String>, root: Arc<WorkflowStep>) {
        self.shared
            .workflows
            .lock()
            .unwrap()
            .insert(name.into(), root);
    }

    pub fn unregister_workflow(&self, name: &str) {
        self.shared.workflows.lock().unwrap().remove(name);
    }

    /// Run one workflow synchronously against `trigger`. Returns `false`
    /// for unknown names and failed runs alike.
    pub fn execute_workflow(&self, name: &str, trigger: &Event) -> bool {
        let root = self.shared.workflows.lock().unwrap().get(name).cloned();
        let Some(root) = root else {
            tracing::warn!(flow = %self.shared.name, workflow = %name, "unknown workflow");
            return false;
        };
        root.reset();
        let ok = root.execute(trigger);
        self.shared.workflows_executed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.shared.errors.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn events_processed(&self) -> u64 {
        self.shared.events_processed.load(Ordering::Relaxed)
    }

    pub fn workflows_executed(&self) -> u64 {
        self.shared.workflows_executed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }
}

impl Drop for StackFlow {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use crate::workflow::StepKind;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let flow = StackFlow::new("order");
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["h1", "h2"] {
            let seen = seen.clone();
            flow.register_handler(
                EventKind::Custom,
                Arc::new(FnHandler::new(tag, vec![EventKind::Custom], move |_| {
                    seen.lock().unwrap().push(tag);
                    true
                })),
            );
        }
        flow.start();
        flow.publish(Event::new(EventKind::Custom, "t", "")).unwrap();

        wait_until("dispatch", || flow.events_processed() == 1);
        assert_eq!(*seen.lock().unwrap(), vec!["h1", "h2"]);
        flow.stop();
    }

    #[test]
    fn test_handler_failure_counts_and_continues() {
        let flow = StackFlow::new("failures");
        let ran_second = Arc::new(AtomicBool::new(false));

        flow.register_handler(
            EventKind::Custom,
            Arc::new(FnHandler::new("bad", vec![EventKind::Custom], |_| false)),
        );
        let flag = ran_second.clone();
        flow.register_handler(
            EventKind::Custom,
            Arc::new(FnHandler::new("good", vec![EventKind::Custom], move |_| {
                flag.store(true, Ordering::SeqCst);
                true
            })),
        );
        flow.start();
        flow.publish(Event::new(EventKind::Custom, "t", "")).unwrap();

        wait_until("dispatch", || flow.events_processed() == 1);
        assert!(ran_second.load(Ordering::SeqCst));
        assert_eq!(flow.error_count(), 1);
        flow.stop();
    }

    #[test]
    fn test_register_unregister_roundtrip() {
        let flow = StackFlow::new("reg");
        assert_eq!(flow.handler_count(EventKind::Custom), 0);
        flow.register_handler(
            EventKind::Custom,
            Arc::new(FnHandler::new("h", vec![EventKind::Custom], |_| true)),
        );
        // Duplicate registrations each dispatch once, so both are kept.
        flow.register_handler(
            EventKind::Custom,
            Arc::new(FnHandler::new("h", vec![EventKind::Custom], |_| true)),
        );
        assert_eq!(flow.handler_count(EventKind::Custom), 2);
        flow.unregister_handler(EventKind::Custom, "h");
        assert_eq!(flow.handler_count(EventKind::Custom), 0);
    }

    #[test]
    fn test_queue_full_rejects_publish() {
        let flow = StackFlow::with_capacity("small", 2);
        // Not started: nothing drains the queue.
        flow.publish(Event::new(EventKind::Custom, "", "")).unwrap();
        flow.publish(Event::new(EventKind::Custom, "", "")).unwrap();
        assert_eq!(
            flow.publish(Event::new(EventKind::Custom, "", "")),
            Err(PublishError::QueueFull)
        );
        assert_eq!(flow.queue_len(), 2);
    }

    #[test]
    fn test_priority_orders_queued_burst() {
        let flow = StackFlow::new("prio");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        flow.register_handler(
            EventKind::Custom,
            Arc::new(FnHandler::new("sink", vec![EventKind::Custom], move |ev| {
                sink.lock().unwrap().push(ev.priority);
                true
            })),
        );

        // Queue a burst before the worker starts, then let it drain.
        flow.publish(Event::new(EventKind::Custom, "", "").with_priority(1))
            .unwrap();
        flow.publish(Event::new(EventKind::Custom, "", "").with_priority(9))
            .unwrap();
        flow.publish(Event::new(EventKind::Custom, "", "").with_priority(9))
            .unwrap();
        flow.publish(Event::new(EventKind::Custom, "", "").with_priority(5))
            .unwrap();
        flow.start();

        wait_until("drain", || flow.events_processed() == 4);
        assert_eq!(*seen.lock().unwrap(), vec![9, 9, 5, 1]);
        flow.stop();
    }

    #[test]
    fn test_stop_drops_queued_events() {
        let flow = StackFlow::new("drop");
        flow.publish(Event::new(EventKind::Custom, "", "")).unwrap();
        flow.publish(Event::new(EventKind::Custom, "", "")).unwrap();
        // Whatever the worker did not reach is discarded on stop.
        flow.start();
        flow.stop();
        assert_eq!(flow.queue_len(), 0);
    }

    #[test]
    fn test_execute_workflow_reports_root_result() {
        let flow = StackFlow::new("wf");
        let mut root = WorkflowStep::new("root", StepKind::Sequential);
        root.add_child(Arc::new(
            WorkflowStep::new("a", StepKind::Action).with_action(|_| true),
        ));
        flow.register_workflow("deploy", Arc::new(root));

        let trigger = Event::new(EventKind::Custom, "", "");
        assert!(flow.execute_workflow("deploy", &trigger));
        assert_eq!(flow.workflows_executed(), 1);
        assert!(!flow.execute_workflow("missing", &trigger));
    }

    #[test]
    fn test_published_event_triggers_accepting_workflow() {
        let flow = StackFlow::new("trigger");
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let accepting = WorkflowStep::new("accepting", StepKind::Condition)
            .with_condition(|ev| ev.kind == EventKind::ServiceRegister)
            .with_child(Arc::new(
                WorkflowStep::new("mark", StepKind::Action).with_action(move |_| {
                    flag.store(true, Ordering::SeqCst);
                    true
                }),
            ));
        flow.register_workflow("on-register", Arc::new(accepting));

        flow.start();
        flow.publish(Event::new(EventKind::Custom, "", "")).unwrap();
        wait_until("custom", || flow.events_processed() == 1);
        // Root condition rejected the custom event: nothing executed.
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(flow.workflows_executed(), 0);

        flow.publish(Event::new(EventKind::ServiceRegister, "svc", ""))
            .unwrap();
        wait_until("register", || flow.events_processed() == 2);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(flow.workflows_executed(), 1);
        flow.stop();
    }
}
