// This example needs a running echo server (e.g., the echo_server example).
// Start it first:  cargo run --example echo_server
// Then run:        cargo run --example connect_echo
// Or specify:      TARGET=10.0.0.1:8080 cargo run --example connect_echo

use std::sync::Arc;

use riptide::{EventLoop, TcpClient};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let target: std::net::SocketAddr = std::env::var("TARGET")
        .unwrap_or_else(|_| "127.0.0.1:7878".to_string())
        .parse()
        .expect("invalid TARGET address");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let loop_handle = event_loop.handle().clone();

    let client = TcpClient::new(loop_handle.clone(), target, "connect-echo");

    client.set_connection_callback(Arc::new({
        let loop_handle = loop_handle.clone();
        move |conn| {
            if conn.is_connected() {
                eprintln!("connected to {}", conn.peer_addr());
                conn.send(b"Hello from riptide!\n");
            } else {
                eprintln!("connection closed");
                loop_handle.quit();
            }
        }
    }));
    client.set_message_callback(Arc::new(|conn, buf, _when| {
        let text = buf.retrieve_all_as_string();
        eprintln!("received: {}", text.trim());
        // Got the echo back - done.
        conn.shutdown();
    }));

    client.connect();
    event_loop.run();
}
