//! TCP server: acceptor plus the connection registry.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::addr::Address;
use crate::buffer::Buffer;
use crate::connection::{
    CloseCallback, ConnectionCallback, MessageCallback, TcpConnection,
};
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    close: Option<CloseCallback>,
}

/// Owns the acceptor and tracks live connections by name.
///
/// The connection map is only mutated on the owning loop's thread; the
/// public send/broadcast operations are thread-safe and trampoline through
/// the loop. The server holds the strong references; connections never
/// reference the server back (close notifications arrive through the
/// registered close callback).
pub struct TcpServer {
    loop_: LoopHandle,
    name: String,
    acceptor: Arc<Acceptor>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    total_connections: AtomicU64,
    callbacks: Mutex<ServerCallbacks>,
}

impl TcpServer {
    pub fn new(
        loop_: &LoopHandle,
        listen_addr: Address,
        name: impl Into<String>,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(loop_, listen_addr, true)?;
        let server = Arc::new(TcpServer {
            loop_: loop_.clone(),
            name: name.into(),
            acceptor,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
            total_connections: AtomicU64::new(0),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(move |sock, peer| {
                if let Some(srv) = weak.upgrade() {
                    srv.new_connection(sock, peer);
                }
            });

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    /// The listen address; useful after binding port 0.
    pub fn local_addr(&self) -> Address {
        self.acceptor.local_addr()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the acceptor has reached the listening state. `start` posts
    /// the listen to the loop thread, so this lags `is_started` briefly.
    pub fn is_listening(&self) -> bool {
        self.acceptor.is_listening()
    }

    // Server-level callbacks, fanned out to every accepted connection.
    // Set these before `start`.

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

    /// Begin listening. Idempotent; safe from any thread.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let server = self.clone();
        self.loop_.run_in_loop(move || {
            if let Err(e) = server.acceptor.listen() {
                tracing::error!(server = %server.name, error = %e, "listen failed");
            }
        });
    }

    /// Stop accepting and force-close every live connection. Each close
    /// callback fires exactly once; safe from any thread.
    pub fn stop(self: &Arc<Self>) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let server = self.clone();
        self.loop_.run_in_loop(move || {
            if server.acceptor.is_listening() {
                server.acceptor.shutdown();
            }
            let conns: Vec<_> = server.connections.lock().unwrap().values().cloned().collect();
            tracing::info!(server = %server.name, connections = conns.len(), "stopping");
            for conn in conns {
                conn.force_close();
            }
        });
    }

    /// Send to every live connection. Thread-safe.
    pub fn broadcast_message(self: &Arc<Self>, data: &[u8]) {
        let server = self.clone();
        let owned = data.to_vec();
        self.loop_.run_in_loop(move || {
            let conns: Vec<_> = server.connections.lock().unwrap().values().cloned().collect();
            for conn in conns {
                conn.send(&owned);
            }
        });
    }

    /// Send to one connection by name. Unknown names are dropped silently.
    /// Thread-safe.
    pub fn send_to_connection(self: &Arc<Self>, name: &str, data: &[u8]) {
        let server = self.clone();
        let name = name.to_string();
        let owned = data.to_vec();
        self.loop_.run_in_loop(move || {
            let conn = server.connections.lock().unwrap().get(&name).cloned();
            match conn {
                Some(conn) => conn.send(&owned),
                None => tracing::debug!(server = %server.name, conn = %name, "no such connection"),
            }
        });
    }

    /// Currently live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Connections accepted over the server's lifetime.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn connection_names(&self) -> Vec<String> {
        self.connections.lock().unwrap().keys().cloned().collect()
    }

    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: Address) {
        self.loop_.assert_in_loop_thread();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}#{}", self.name, id);
        let local_addr = socket.local_addr().unwrap_or(Address::any(0));

        tracing::debug!(server = %self.name, conn = %conn_name, peer = %peer_addr, "new connection");
        let conn = TcpConnection::new(&self.loop_, conn_name.clone(), socket, local_addr, peer_addr);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        {
            let cbs = self.callbacks.lock().unwrap();
            if let Some(cb) = cbs.connection.clone() {
                conn.set_connection_callback(move |c| cb(c));
            }
            if let Some(cb) = cbs.message.clone() {
                conn.set_message_callback(move |c, buf| cb(c, buf));
            }
            let user_close = cbs.close.clone();
            let weak = Arc::downgrade(self);
            conn.set_close_callback(move |c| {
                if let Some(cb) = &user_close {
                    cb(c);
                }
                if let Some(srv) = weak.upgrade() {
                    srv.remove_connection(c);
                }
            });
        }

        conn.connect_established();
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = self.clone();
        let conn = conn.clone();
        self.loop_.run_in_loop(move || {
            server.connections.lock().unwrap().remove(conn.name());
            // Destruction is queued so the connection outlives the close
            // handler that triggered it.
            let conn2 = conn.clone();
            server.loop_.queue_in_loop(move || conn2.connect_destroyed());
        });
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}
