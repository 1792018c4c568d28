//! Per-connection state machine over a channel, socket and buffers.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::addr::Address;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

/// Default output-buffer high-water mark (64 MiB).
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle. Transitions are monotone:
/// `Connecting → Connected → Disconnecting → Disconnected`
/// (`Disconnecting` may be skipped on forced close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Disconnecting => "disconnecting",
            ConnState::Disconnected => "disconnected",
        }
    }
}

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

#[derive(Default)]
struct ConnCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    close: Option<CloseCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterMarkCallback>,
}

/// One established TCP connection.
///
/// All state mutation happens on the owning loop's thread; `send` is
/// thread-safe by trampolining through the loop. Callbacks hold weak
/// references and upgrade before touching the connection, so a connection
/// outlives the stack frame of its own close handler (the owner queues
/// [`TcpConnection::connect_destroyed`] rather than dropping inline).
pub struct TcpConnection {
    loop_: LoopHandle,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: Address,
    peer_addr: Address,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    callbacks: Mutex<ConnCallbacks>,
    high_water_mark: AtomicUsize,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected_at: Instant,
}

impl TcpConnection {
    /// Wrap an accepted (or connected) socket. The fd is switched to
    /// non-blocking before it reaches the channel.
    pub fn new(
        loop_: &LoopHandle,
        name: String,
        socket: Socket,
        local_addr: Address,
        peer_addr: Address,
    ) -> Arc<TcpConnection> {
        if let Err(e) = socket.set_nonblocking(true) {
            tracing::error!(name, error = %e, "set_nonblocking failed");
        }
        if let Err(e) = socket.set_keep_alive(true) {
            tracing::debug!(name, error = %e, "set_keep_alive failed");
        }

        let channel = Channel::new(loop_, socket.as_raw_fd());
        let conn = Arc::new(TcpConnection {
            loop_: loop_.clone(),
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            callbacks: Mutex::new(ConnCallbacks::default()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connected_at: Instant::now(),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_read();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_write();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_close();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_socket_error();
            }
        });

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Address {
        self.peer_addr
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn connect_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn set_no_delay(&self, enable: bool) -> io::Result<()> {
        self.socket.set_no_delay(enable)
    }

    pub fn set_keep_alive(&self, enable: bool) -> io::Result<()> {
        self.socket.set_keep_alive(enable)
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    // Callback setters; the owner wires these before `connect_established`.

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().high_water = Some(Arc::new(cb));
    }

    /// Called by the owner once the connection is wired up. Loop thread only.
    pub fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        self.channel.enable_reading();
        tracing::debug!(name = %self.name, peer = %self.peer_addr, "connection established");

        let cb = self.callbacks.lock().unwrap().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown, queued by the owner after the close callback so the
    /// connection outlives its own close frame. Loop thread only.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            // Torn down without going through handle_close (owner shutdown).
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            let cb = self.callbacks.lock().unwrap().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        self.channel.remove();
        tracing::debug!(name = %self.name, "connection destroyed");
    }

    /// Thread-safe send. On the loop thread the bytes are written directly
    /// (spilling the remainder into the output buffer); elsewhere the data
    /// is copied and trampolined onto the loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.state() != ConnState::Connected {
            tracing::warn!(name = %self.name, "send on {} connection, dropped", self.state().as_str());
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.loop_.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            tracing::warn!(name = %self.name, "connection gone, giving up the write");
            return;
        }

        let mut wrote = 0usize;
        let mut fault = false;
        let mut output = self.output.lock().unwrap();

        // Try a direct write when nothing is queued ahead of us.
        if !self.channel.is_writing() && output.is_empty() {
            match self.socket.send(data) {
                Ok(n) => {
                    wrote = n;
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if wrote == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(name = %self.name, error = %e, "write failed");
                    fault = true;
                }
            }
        }

        if !fault && wrote < data.len() {
            let remaining = data.len() - wrote;
            let queued = output.readable();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if queued + remaining >= mark && queued < mark {
                let cb = self.callbacks.lock().unwrap().high_water.clone();
                if let Some(cb) = cb {
                    let conn = self.clone();
                    let total = queued + remaining;
                    self.loop_.queue_in_loop(move || cb(&conn, total));
                }
            }
            output.append(&data[wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
        drop(output);

        if fault {
            self.handle_close();
        }
    }

    /// Half-close: stop writing once the output buffer drains. Only valid
    /// from `Connected`.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                tracing::debug!(name = %self.name, error = %e, "shutdown(WR) failed");
            }
        }
        // Otherwise handle_write completes the shutdown after the drain.
    }

    /// Close without waiting for the output buffer to drain.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.loop_.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.handle_close();
        }
    }

    fn handle_read(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            return;
        }
        let mut input = self.input.lock().unwrap();
        let mut received = 0usize;
        let mut peer_closed = false;
        let mut hard_error = None;

        loop {
            match input.read_fd(self.socket.as_raw_fd()) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    received += n;
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    hard_error = Some(e);
                    break;
                }
            }
        }

        if received > 0 {
            let cb = self.callbacks.lock().unwrap().message.clone();
            match cb {
                Some(cb) => cb(self, &mut input),
                // Nobody consumes; don't let the buffer grow unbounded.
                None => input.clear(),
            }
        }
        drop(input);

        if let Some(e) = hard_error {
            tracing::error!(name = %self.name, error = %e, "read failed");
            self.handle_close();
        } else if peer_closed {
            self.handle_close();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            tracing::trace!(name = %self.name, "write interest already gone");
            return;
        }

        let mut drained = false;
        {
            // Write until the buffer drains or the kernel pushes back. The
            // poller is edge-triggered, so stopping early would stall until
            // the next readiness transition.
            let mut output = self.output.lock().unwrap();
            loop {
                match self.socket.send(output.peek()) {
                    Ok(n) => {
                        output.advance(n);
                        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                        if output.is_empty() {
                            self.channel.disable_writing();
                            self.queue_write_complete();
                            drained = true;
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::error!(name = %self.name, error = %e, "flush failed");
                        break;
                    }
                }
            }
        }

        if drained && self.state() == ConnState::Disconnecting {
            self.shutdown_in_loop();
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.lock().unwrap().write_complete.clone();
        if let Some(cb) = cb {
            let conn = self.clone();
            self.loop_.queue_in_loop(move || cb(&conn));
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            return;
        }
        tracing::debug!(name = %self.name, state = self.state().as_str(), "closing");
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let (conn_cb, close_cb) = {
            let cbs = self.callbacks.lock().unwrap();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = conn_cb {
            cb(self);
        }
        // The owner's close callback removes us from its map and queues
        // connect_destroyed.
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn handle_socket_error(self: &Arc<Self>) {
        let err = match self.socket.take_error() {
            Ok(Some(e)) => e,
            Ok(None) => io::Error::other("unknown socket error"),
            Err(e) => e,
        };
        tracing::error!(name = %self.name, error = %err, "socket error");
        self.handle_close();
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish()
    }
}
