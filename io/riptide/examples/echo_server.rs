use std::sync::Arc;

use riptide::{EventLoop, ServerConfig, TcpServer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let addr = bind_addr.parse().expect("invalid bind address");

    let event_loop = EventLoop::new().expect("failed to create event loop");

    let config = ServerConfig {
        threads: 2,
        ..Default::default()
    };
    let server = TcpServer::new(event_loop.handle().clone(), addr, "echo", config)
        .expect("failed to bind");

    server.set_connection_callback(Arc::new(|conn| {
        if conn.is_connected() {
            eprintln!("echo: {} is up ({})", conn.name(), conn.peer_addr());
        } else {
            eprintln!("echo: {} is down", conn.name());
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    }));

    eprintln!("echo server listening on {}", server.local_addr());
    server.start();
    event_loop.run();
}
