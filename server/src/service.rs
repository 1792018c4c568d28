//! Host wiring: reactor, TCP server, flow engine, and bus routing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bus::{BusMessage, Channel, ChannelManager, InProcChannel, Priority};
use evio::{Address, Buffer, EventLoop, LoopHandle, TcpConnection, TcpServer};
use protocol_frame::{Frame, FrameError};
use stackflow::{Event, EventKind, StackFlow};

use crate::config::Config;
use crate::metrics::{
    CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED, EVENTS_DROPPED,
    EVENTS_PUBLISHED, FRAMES_DECODED, PROTOCOL_ERRORS, ROUTING_ERRORS,
};

/// How long shutdown waits for connections to drain before quitting the
/// reactor anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The running host: one reactor thread serving framed TCP traffic, one
/// flow worker dispatching events, and a channel manager routing payloads
/// by the frame's receiver id.
pub struct EdgeHost {
    loop_handle: LoopHandle,
    loop_thread: Option<JoinHandle<()>>,
    server: Arc<TcpServer>,
    flow: Arc<StackFlow>,
    manager: Arc<ChannelManager>,
}

impl EdgeHost {
    /// Bring up channels, routes, the flow worker, the reactor thread and
    /// the TCP server.
    pub fn start(config: &Config) -> Result<EdgeHost, Box<dyn std::error::Error>> {
        let listen = to_v4(config.listen.address)?;

        // Bus side.
        let manager = Arc::new(ChannelManager::new());
        manager.set_error_callback(Arc::new(|_err| {
            ROUTING_ERRORS.increment();
        }));
        for decl in &config.channel {
            let channel = InProcChannel::new(&decl.name, decl.kind.into());
            for pattern in &decl.subscribe {
                channel.subscribe(pattern);
            }
            manager.register_channel(channel);
        }
        for route in &config.route {
            for name in &route.channels {
                manager.add_route(&route.topic, name);
            }
        }
        manager.start_all();

        // Flow side.
        let flow = Arc::new(StackFlow::with_capacity(
            &config.flow.name,
            config.flow.queue_capacity,
        ));
        flow.start();

        // Reactor thread; the loop must be constructed on it.
        let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
        let loop_thread = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(event_loop.handle()));
                event_loop.run();
            })?;
        let loop_handle = handle_rx.recv()??;

        let server = TcpServer::new(&loop_handle, listen, "edge-host")?;
        wire_server(&server, &flow, &manager, config.frame.max_payload);
        server.start();
        // Listening is posted to the loop thread; wait for it so callers
        // can connect as soon as start returns.
        let deadline = Instant::now() + Duration::from_secs(1);
        while !server.is_listening() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        publish(&flow, Event::new(EventKind::SystemStart, "edge-host", ""));
        tracing::info!(addr = %server.local_addr(), "edge host up");

        Ok(EdgeHost {
            loop_handle,
            loop_thread: Some(loop_thread),
            server,
            flow,
            manager,
        })
    }

    /// The actual listen address (resolves port 0).
    pub fn local_addr(&self) -> Address {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    pub fn flow(&self) -> &Arc<StackFlow> {
        &self.flow
    }

    pub fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Block until the flag flips, then shut down.
    pub fn run_until(mut self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(50));
        }
        self.shutdown_inner();
    }

    /// Orderly teardown: stop accepting, drain connections, stop the
    /// reactor, then the flow and the channels.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(loop_thread) = self.loop_thread.take() else {
            return;
        };
        publish(&self.flow, Event::new(EventKind::SystemStop, "edge-host", ""));

        self.server.stop();
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.server.connection_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let leftover = self.server.connection_count();
        if leftover > 0 {
            tracing::warn!(leftover, "drain timeout, quitting with live connections");
        }

        self.loop_handle.quit();
        let _ = loop_thread.join();

        self.flow.stop();
        self.manager.stop_all();
        tracing::info!("edge host down");
    }
}

impl Drop for EdgeHost {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn to_v4(addr: SocketAddr) -> Result<Address, Box<dyn std::error::Error>> {
    match addr {
        SocketAddr::V4(v4) => Ok(Address::from(v4)),
        SocketAddr::V6(_) => Err("listen address must be IPv4".into()),
    }
}

fn wire_server(
    server: &Arc<TcpServer>,
    flow: &Arc<StackFlow>,
    manager: &Arc<ChannelManager>,
    max_payload: u32,
) {
    let flow_conn = flow.clone();
    server.set_connection_callback(move |conn| {
        if conn.is_connected() {
            CONNECTIONS_ACCEPTED.increment();
            CONNECTIONS_ACTIVE.increment();
            publish(
                &flow_conn,
                Event::new(EventKind::ConnectionEstablished, conn.name(), "")
                    .with_data("peer", conn.peer_addr().to_string()),
            );
        } else {
            CONNECTIONS_CLOSED.increment();
            CONNECTIONS_ACTIVE.decrement();
            publish(
                &flow_conn,
                Event::new(EventKind::ConnectionLost, conn.name(), "")
                    .with_data("bytes_received", conn.bytes_received().to_string())
                    .with_data("bytes_sent", conn.bytes_sent().to_string()),
            );
        }
    });

    let flow_msg = flow.clone();
    let manager = manager.clone();
    server.set_message_callback(move |conn, buf| {
        decode_frames(conn, buf, &flow_msg, &manager, max_payload);
    });
}

/// Pull every complete frame out of the connection's input buffer. Valid
/// frames are routed on the bus (topic = receiver id) and surfaced as
/// `MessageReceived` events; invalid frames are dropped without touching
/// the transport.
fn decode_frames(
    conn: &Arc<TcpConnection>,
    buf: &mut Buffer,
    flow: &Arc<StackFlow>,
    manager: &Arc<ChannelManager>,
    max_payload: u32,
) {
    loop {
        match Frame::decode(buf.peek(), max_payload) {
            Ok((frame, consumed)) => {
                buf.advance(consumed);
                FRAMES_DECODED.increment();

                let header = &frame.header;
                let msg = BusMessage::new(frame.payload.clone())
                    .with_topic(&header.receiver)
                    .with_sender(&header.sender)
                    .with_receiver(&header.receiver)
                    .with_priority(to_bus_priority(header.priority));
                manager.route_message(&msg);

                publish(
                    flow,
                    Event::new(EventKind::MessageReceived, &header.sender, &header.receiver)
                        .with_priority(header.priority as u32)
                        .with_data("connection", conn.name())
                        .with_data("kind", header.kind.as_str())
                        .with_data("sequence", header.sequence.to_string())
                        .with_data("bytes", frame.payload.len().to_string()),
                );
            }
            Err(FrameError::Incomplete) => break,
            Err(e @ FrameError::ChecksumMismatch { .. }) => {
                PROTOCOL_ERRORS.increment();
                tracing::warn!(conn = conn.name(), error = %e, "dropping frame");
                // The declared length is trustworthy here; skip just this
                // frame.
                match Frame::declared_len(buf.peek()) {
                    Some(len) if len <= buf.readable() => buf.advance(len),
                    _ => {
                        buf.clear();
                        break;
                    }
                }
            }
            Err(e) => {
                // Bad magic, version, or oversized payload: no way to
                // resync mid-stream, so drop the buffered bytes.
                PROTOCOL_ERRORS.increment();
                tracing::warn!(conn = conn.name(), error = %e, "dropping buffered input");
                buf.clear();
                break;
            }
        }
    }
}

fn to_bus_priority(raw: u8) -> Priority {
    match raw {
        0 => Priority::Low,
        1 => Priority::Normal,
        2 => Priority::High,
        _ => Priority::Critical,
    }
}

fn publish(flow: &Arc<StackFlow>, event: Event) {
    match flow.publish(event) {
        Ok(()) => EVENTS_PUBLISHED.increment(),
        Err(e) => {
            EVENTS_DROPPED.increment();
            tracing::warn!(error = %e, "event dropped");
        }
    }
}
