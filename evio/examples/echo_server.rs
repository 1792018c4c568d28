use evio::{Address, EventLoop, TcpServer};

fn main() {
    let bind_addr: Address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .expect("invalid listen address");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let server = TcpServer::new(&event_loop.handle(), bind_addr, "echo")
        .expect("failed to bind");

    server.set_connection_callback(|conn| {
        eprintln!(
            "[{}] {} ({})",
            conn.name(),
            conn.state().as_str(),
            conn.peer_addr()
        );
    });
    server.set_message_callback(|conn, buf| {
        let data = buf.take();
        conn.send(&data);
    });

    eprintln!("echo server on {}", server.local_addr());
    server.start();
    event_loop.run();
}
