//! The reactor: poll, dispatch, pending tasks, timers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::poller::Poller;

/// Upper bound on one poll wait; keeps the loop responsive to `quit` even
/// with no timers armed.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: u64,
    interval: Option<Duration>,
    cb: Box<dyn FnMut() + Send>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Deadline first; insertion order breaks ties.
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    cancelled: HashSet<u64>,
    next_id: u64,
    next_seq: u64,
}

impl TimerQueue {
    fn schedule(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        cb: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        self.next_id += 1;
        self.next_seq += 1;
        let id = self.next_id;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq: self.next_seq,
            id,
            interval,
            cb,
        }));
        TimerId(id)
    }

    fn reschedule(&mut self, mut entry: TimerEntry, deadline: Instant) {
        if self.cancelled.remove(&entry.id) {
            return;
        }
        self.next_seq += 1;
        entry.deadline = deadline;
        entry.seq = self.next_seq;
        self.heap.push(Reverse(entry));
    }

    fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id.0);
    }

    fn pop_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            due.push(entry);
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
        due
    }

    fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.cancelled.contains(&top.id) {
                let Reverse(entry) = self.heap.pop().unwrap();
                self.cancelled.remove(&entry.id);
                continue;
            }
            return Some(top.deadline.saturating_duration_since(now));
        }
        None
    }
}

struct LoopShared {
    thread_id: ThreadId,
    poller: Mutex<Poller>,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    running: AtomicBool,
    quit: AtomicBool,
    wakeup_fd: RawFd,
    timers: Mutex<TimerQueue>,
    iterations: AtomicU64,
    dispatches: AtomicU64,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "reactor state touched off the loop thread (owner {:?}, caller {:?})",
            self.thread_id,
            thread::current().id()
        );
    }

    fn wake(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            // EAGAIN means the counter is saturated; a wakeup is already
            // pending, so nothing is lost.
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::error!(error = %err, "wakeup write failed");
            }
        }
    }

    fn run_pending(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let due = self.timers.lock().unwrap().pop_due(now);
        for mut entry in due {
            (entry.cb)();
            if let Some(interval) = entry.interval {
                self.timers
                    .lock()
                    .unwrap()
                    .reschedule(entry, now + interval);
            }
        }
    }
}

/// One reactor, bound to the thread that constructed it.
///
/// Construction pins the loop thread; [`EventLoop::run`] must be called on
/// that same thread and blocks until [`LoopHandle::quit`]. Everything the
/// loop owns (channels, the poller, connections) is mutated only from the
/// loop thread; other threads reach it through a [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    wakeup_channel: Arc<Channel>,
}

impl EventLoop {
    /// Create a loop owned by the current thread.
    pub fn new() -> io::Result<EventLoop> {
        let poller = Poller::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            poller: Mutex::new(poller),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            wakeup_fd,
            timers: Mutex::new(TimerQueue::default()),
            iterations: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        });

        let handle = LoopHandle {
            shared: shared.clone(),
        };
        let wakeup_channel = Channel::new(&handle, wakeup_fd);
        wakeup_channel.set_read_callback(move || {
            let mut counter: u64 = 0;
            let n = unsafe {
                libc::read(wakeup_fd, &mut counter as *mut u64 as *mut libc::c_void, 8)
            };
            if n != 8 {
                tracing::trace!(fd = wakeup_fd, "spurious wakeup read");
            }
        });
        wakeup_channel.enable_reading();

        Ok(EventLoop {
            shared,
            wakeup_channel,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the reactor until `quit`. Blocks the loop thread.
    pub fn run(&self) {
        let s = &self.shared;
        s.assert_in_loop_thread();
        s.running.store(true, Ordering::Release);
        tracing::debug!(thread = ?s.thread_id, "event loop running");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !s.quit.load(Ordering::Acquire) {
            let timeout = s
                .timers
                .lock()
                .unwrap()
                .next_timeout(Instant::now())
                .map(|d| d.min(DEFAULT_POLL_TIMEOUT))
                .unwrap_or(DEFAULT_POLL_TIMEOUT);

            active.clear();
            match s.poller.lock().unwrap().poll(Some(timeout), &mut active) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                }
            }
            s.iterations.fetch_add(1, Ordering::Relaxed);

            for channel in active.drain(..) {
                s.dispatches.fetch_add(1, Ordering::Relaxed);
                channel.handle_event();
            }

            s.run_pending();
            s.fire_timers();
        }

        s.running.store(false, Ordering::Release);
        tracing::debug!("event loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self
            .shared
            .poller
            .lock()
            .unwrap()
            .remove(&self.wakeup_channel);
        unsafe {
            libc::close(self.shared.wakeup_fd);
        }
    }
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }

    /// Run `task` on the loop thread: immediately when already there,
    /// otherwise via the task queue.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the loop's next task-drain phase. Wakes the poller
    /// when called off-thread, or while the loop is already draining tasks
    /// (so a task queued by a task cannot starve).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.shared.wake();
        }
    }

    /// Ask the loop to exit after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.wake();
        }
    }

    /// Run `cb` once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: impl FnOnce() + Send + 'static) -> TimerId {
        let mut cb = Some(cb);
        self.schedule(
            Instant::now() + delay,
            None,
            Box::new(move || {
                if let Some(cb) = cb.take() {
                    cb();
                }
            }),
        )
    }

    /// Run `cb` every `interval`, first firing one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Instant::now() + interval, Some(interval), Box::new(cb))
    }

    /// Best-effort cancel: a timer already being dispatched may still fire.
    pub fn cancel_timer(&self, id: TimerId) {
        self.shared.timers.lock().unwrap().cancel(id);
    }

    fn schedule(
        &self,
        deadline: Instant,
        interval: Option<Duration>,
        cb: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let id = self
            .shared
            .timers
            .lock()
            .unwrap()
            .schedule(deadline, interval, cb);
        if !self.is_in_loop_thread() {
            // Re-arm the poll timeout.
            self.shared.wake();
        }
        id
    }

    /// Total loop iterations so far.
    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::Relaxed)
    }

    /// Total channel dispatches so far.
    pub fn dispatches(&self) -> u64 {
        self.shared.dispatches.load(Ordering::Relaxed)
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.shared.poller.lock().unwrap().has_channel(fd)
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(e) = self.shared.poller.lock().unwrap().update(channel) {
            tracing::error!(fd = channel.fd(), error = %e, "channel update failed");
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(e) = self.shared.poller.lock().unwrap().remove(channel) {
            tracing::error!(fd = channel.fd(), error = %e, "channel remove failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_from_other_thread() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.quit();
        });
        event_loop.run();
        t.join().unwrap();
        assert!(!event_loop.is_running());
        assert!(event_loop.handle().iterations() >= 1);
    }

    #[test]
    fn test_run_in_loop_cross_thread() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let (tx, rx) = std::sync::mpsc::channel();

        let h2 = handle.clone();
        let t = thread::spawn(move || {
            h2.run_in_loop(move || {
                tx.send(thread::current().id()).unwrap();
            });
        });
        t.join().unwrap();

        let h3 = handle.clone();
        handle.run_after(Duration::from_millis(100), move || h3.quit());
        event_loop.run();

        // The task executed on the loop thread, not the sender's.
        assert_eq!(rx.recv().unwrap(), thread::current().id());
    }

    #[test]
    fn test_task_queued_from_pending_task_runs_next_iteration() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let (tx, rx) = std::sync::mpsc::channel();

        let h2 = handle.clone();
        let t_handle = handle.clone();
        thread::spawn(move || {
            t_handle.queue_in_loop(move || {
                let tx = tx.clone();
                let h3 = h2.clone();
                // Queued while the pending queue is draining; must wake the
                // loop rather than wait for unrelated I/O.
                h2.queue_in_loop(move || {
                    tx.send(()).unwrap();
                    h3.quit();
                });
            });
        });

        event_loop.run();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_timer_ordering_and_cancel() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let f1 = fired.clone();
        handle.run_after(Duration::from_millis(20), move || {
            f1.lock().unwrap().push("b");
        });
        let f2 = fired.clone();
        handle.run_after(Duration::from_millis(10), move || {
            f2.lock().unwrap().push("a");
        });
        let f3 = fired.clone();
        let cancelled = handle.run_after(Duration::from_millis(30), move || {
            f3.lock().unwrap().push("x");
        });
        handle.cancel_timer(cancelled);

        let h = handle.clone();
        handle.run_after(Duration::from_millis(60), move || h.quit());
        event_loop.run();

        assert_eq!(*fired.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_run_every_repeats() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        handle.run_every(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        let h = handle.clone();
        handle.run_after(Duration::from_millis(100), move || h.quit());
        event_loop.run();

        let fired = count.load(Ordering::Relaxed);
        assert!(fired >= 3, "periodic timer fired {fired} times");
    }
}
