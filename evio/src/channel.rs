//! Per-fd dispatch record for the reactor.

use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::event_loop::LoopHandle;

/// Readiness bits reported by the poller for one fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const CLOSED: Ready = Ready(0b0100);
    pub const ERROR: Ready = Ready(0b1000);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_closed(self) -> bool {
        self.0 & Self::CLOSED.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    fn bits(self) -> u8 {
        self.0
    }

    fn from_bits(bits: u8) -> Ready {
        Ready(bits)
    }
}

/// Interest bits.
const INTEREST_NONE: u8 = 0;
const INTEREST_READ: u8 = 0b01;
const INTEREST_WRITE: u8 = 0b10;

/// Registration state the poller tracks per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never handed to the poller.
    New,
    /// Registered in the kernel.
    Added,
    /// Known to the poller but deregistered (empty interest).
    Deleted,
}

impl PollerState {
    fn from_u8(v: u8) -> PollerState {
        match v {
            1 => PollerState::Added,
            2 => PollerState::Deleted,
            _ => PollerState::New,
        }
    }
}

type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Dispatch object tying one fd to its event callbacks.
///
/// A channel never owns the fd; whoever does must `remove()` the channel
/// from its loop before closing it. All mutation happens on the owner
/// loop's thread.
pub struct Channel {
    loop_: LoopHandle,
    fd: RawFd,
    interest: AtomicU8,
    ready: AtomicU8,
    poller_state: AtomicU8,
    handling: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub fn new(loop_: &LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            loop_: loop_.clone(),
            fd,
            interest: AtomicU8::new(INTEREST_NONE),
            ready: AtomicU8::new(0),
            poller_state: AtomicU8::new(PollerState::New as u8),
            handling: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    // Callback setters. Must not be called from inside `handle_event`.

    pub fn set_read_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().read = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().write = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().close = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().error = Some(Box::new(cb));
    }

    pub fn is_reading(&self) -> bool {
        self.interest.load(Ordering::Relaxed) & INTEREST_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.interest.load(Ordering::Relaxed) & INTEREST_WRITE != 0
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest.load(Ordering::Relaxed) == INTEREST_NONE
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.interest.fetch_or(INTEREST_READ, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.interest.fetch_and(!INTEREST_READ, Ordering::Relaxed);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.interest.fetch_or(INTEREST_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.interest.fetch_and(!INTEREST_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.interest.store(INTEREST_NONE, Ordering::Relaxed);
        self.update();
    }

    fn update(self: &Arc<Self>) {
        self.loop_.update_channel(self);
    }

    /// Detach from the owner loop. The interest set must already be empty,
    /// and the channel must not be mid-dispatch.
    pub fn remove(self: &Arc<Self>) {
        assert!(
            !self.handling.load(Ordering::Relaxed),
            "channel removed while handling an event (fd={})",
            self.fd
        );
        self.loop_.remove_channel(self);
    }

    pub(crate) fn interest_readable(&self) -> bool {
        self.is_reading()
    }

    pub(crate) fn interest_writable(&self) -> bool {
        self.is_writing()
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        PollerState::from_u8(self.poller_state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_ready(&self, ready: Ready) {
        self.ready.store(ready.bits(), Ordering::Relaxed);
    }

    pub(crate) fn merge_ready(&self, ready: Ready) {
        self.ready.fetch_or(ready.bits(), Ordering::Relaxed);
    }

    pub fn ready(&self) -> Ready {
        Ready::from_bits(self.ready.load(Ordering::Relaxed))
    }

    /// Dispatch the readiness recorded by the last poll.
    ///
    /// Order is fixed: close (hangup with nothing left to read), then
    /// error, then read, then write. The handling flag is held for the
    /// whole dispatch; `remove()` asserts against it.
    pub fn handle_event(&self) {
        self.loop_.assert_in_loop_thread();
        self.handling.store(true, Ordering::Relaxed);
        let ready = self.ready();
        self.set_ready(Ready::EMPTY);

        let mut cbs = self.callbacks.lock().unwrap();
        if ready.is_closed() && !ready.is_readable() {
            if let Some(cb) = cbs.close.as_mut() {
                cb();
            }
        }
        if ready.is_error() {
            if let Some(cb) = cbs.error.as_mut() {
                cb();
            }
        }
        if ready.is_readable() {
            if let Some(cb) = cbs.read.as_mut() {
                cb();
            }
        }
        if ready.is_writable() {
            if let Some(cb) = cbs.write.as_mut() {
                cb();
            }
        }
        drop(cbs);
        self.handling.store(false, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("reading", &self.is_reading())
            .field("writing", &self.is_writing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_bits() {
        let mut r = Ready::EMPTY;
        assert!(r.is_empty());
        r.insert(Ready::READABLE);
        r.insert(Ready::ERROR);
        assert!(r.is_readable());
        assert!(r.is_error());
        assert!(!r.is_writable());
        assert!(!r.is_closed());
    }
}
