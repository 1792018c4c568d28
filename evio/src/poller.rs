//! fd-event demultiplexer backed by mio (epoll/kqueue).

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::channel::{Channel, PollerState, Ready};

/// Demultiplexer state: the kernel's interest sets plus the fd → channel
/// map. For every fd registered in the kernel the map holds a channel whose
/// interest matches the last `update` call.
///
/// Not thread-safe; owned by exactly one event loop.
pub struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            channels: HashMap::new(),
        })
    }

    /// Register a new channel or re-sync an existing one with its current
    /// interest set. An empty interest deregisters the fd from the kernel
    /// but keeps the channel known (state `Deleted`).
    pub fn update(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let fd = channel.fd();
        match channel.poller_state() {
            PollerState::New | PollerState::Deleted => {
                if channel.poller_state() == PollerState::New {
                    self.channels.insert(fd, channel.clone());
                }
                if let Some(interest) = mio_interest(channel) {
                    self.poll.registry().register(
                        &mut SourceFd(&fd),
                        Token(fd as usize),
                        interest,
                    )?;
                    channel.set_poller_state(PollerState::Added);
                } else {
                    channel.set_poller_state(PollerState::Deleted);
                }
            }
            PollerState::Added => {
                if let Some(interest) = mio_interest(channel) {
                    self.poll.registry().reregister(
                        &mut SourceFd(&fd),
                        Token(fd as usize),
                        interest,
                    )?;
                } else {
                    self.poll.registry().deregister(&mut SourceFd(&fd))?;
                    channel.set_poller_state(PollerState::Deleted);
                }
            }
        }
        Ok(())
    }

    /// Forget a channel entirely. The caller may close the fd afterwards.
    pub fn remove(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let fd = channel.fd();
        self.channels.remove(&fd);
        if channel.poller_state() == PollerState::Added {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        channel.set_poller_state(PollerState::New);
        Ok(())
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Wait for events and collect the ready channels, with their readiness
    /// bits set. Returns the number of ready channels.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<Arc<Channel>>,
    ) -> io::Result<usize> {
        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let Some(channel) = self.channels.get(&fd) else {
                continue;
            };

            let mut ready = Ready::EMPTY;
            if event.is_readable() {
                ready.insert(Ready::READABLE);
            }
            if event.is_writable() {
                ready.insert(Ready::WRITABLE);
            }
            if event.is_read_closed() || event.is_write_closed() {
                ready.insert(Ready::CLOSED);
            }
            if event.is_error() {
                ready.insert(Ready::ERROR);
            }
            if ready.is_empty() {
                continue;
            }

            if channel.ready().is_empty() {
                active.push(channel.clone());
            }
            channel.merge_ready(ready);
        }

        Ok(active.len())
    }
}

fn mio_interest(channel: &Arc<Channel>) -> Option<Interest> {
    match (channel.interest_readable(), channel.interest_writable()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
