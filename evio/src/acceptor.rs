//! Listening-socket channel.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::addr::Address;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

const DEFAULT_BACKLOG: i32 = 128;

type NewConnectionCallback = Box<dyn FnMut(Socket, Address) + Send>;

/// Owns the listening socket and hands accepted `(socket, peer)` pairs to
/// its callback.
///
/// A reserve fd (`/dev/null`) is kept open so that fd exhaustion can be
/// handled without spinning: on EMFILE the reserve is closed, the pending
/// connection is accepted and immediately dropped, and the reserve is
/// reopened.
pub struct Acceptor {
    loop_: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    idle_fd: AtomicI32,
    listening: AtomicBool,
    on_accept: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(loop_: &LoopHandle, listen_addr: Address, reuse_addr: bool) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::stream()?;
        socket.set_reuse_addr(reuse_addr)?;
        socket.set_nonblocking(true)?;
        socket.bind(listen_addr)?;

        let idle_fd = open_idle_fd()?;
        let channel = Channel::new(loop_, socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            loop_: loop_.clone(),
            socket,
            channel,
            idle_fd: AtomicI32::new(idle_fd),
            listening: AtomicBool::new(false),
            on_accept: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move || {
            if let Some(a) = weak.upgrade() {
                a.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket, Address) + Send + 'static) {
        *self.on_accept.lock().unwrap() = Some(Box::new(cb));
    }

    /// The bound address (with the real port when bound to port 0).
    pub fn local_addr(&self) -> Address {
        self.socket.local_addr().unwrap_or(Address::any(0))
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Start listening and enable the read interest. Loop thread only.
    pub fn listen(self: &Arc<Self>) -> io::Result<()> {
        self.loop_.assert_in_loop_thread();
        self.socket.listen(DEFAULT_BACKLOG)?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        tracing::info!(addr = %self.local_addr(), "listening");
        Ok(())
    }

    /// Stop accepting and detach from the loop. Loop thread only.
    pub fn shutdown(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        self.listening.store(false, Ordering::Release);
        self.channel.disable_all();
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((sock, peer)) => {
                    let mut cb = self.on_accept.lock().unwrap();
                    match cb.as_mut() {
                        Some(cb) => cb(sock, peer),
                        // No callback registered: drop the socket (closes it).
                        None => tracing::warn!(peer = %peer, "accepted without a callback"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    self.drain_one_over_limit();
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// EMFILE: briefly give the fd back, accept the pending connection to
    /// clear it from the backlog, close it, and re-take the reserve.
    fn drain_one_over_limit(&self) {
        tracing::error!("fd limit reached, shedding one connection");
        unsafe {
            libc::close(self.idle_fd.load(Ordering::Relaxed));
            let fd = libc::accept(self.socket.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut());
            if fd >= 0 {
                libc::close(fd);
            }
        }
        match open_idle_fd() {
            Ok(fd) => self.idle_fd.store(fd, Ordering::Relaxed),
            Err(e) => tracing::error!(error = %e, "reopening reserve fd failed"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.idle_fd.load(Ordering::Relaxed));
        }
    }
}

fn open_idle_fd() -> io::Result<RawFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}
