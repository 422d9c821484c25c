//! Connector behavior: back-off retry, stop suppression, reconnect.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use riptide::{Config, EventLoopThread, ServerConfig, TcpClient, TcpServer};

/// A local port with nothing listening on it (bound, then released).
fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn start_echo_server_at(
    base: &EventLoopThread,
    addr: SocketAddr,
) -> (TcpServer, mpsc::Receiver<bool>) {
    let server = TcpServer::new(base.handle().clone(), addr, "retry-target", ServerConfig::default())
        .unwrap();
    let (tx, rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn| {
        let _ = tx.send(conn.is_connected());
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();
    (server, rx)
}

#[test]
fn connect_retries_with_doubling_backoff() {
    let addr = closed_port();

    let client_loop = EventLoopThread::spawn("backoff-client", Config::default(), None).unwrap();
    let client = TcpClient::new(client_loop.handle().clone(), addr, "backoff");
    let (up_tx, up_rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            let _ = up_tx.send(Instant::now());
        }
    }));

    let started = Instant::now();
    client.connect();

    // Attempts land at ~0ms (refused), ~500ms (refused), ~1500ms (refused),
    // then ~3500ms. The server appears at 2.5s, so only the 3.5s attempt can
    // succeed — with a non-doubling back-off the connect would land well
    // before the 3s mark.
    std::thread::sleep(Duration::from_millis(2500));
    let server_base = EventLoopThread::spawn("backoff-server", Config::default(), None).unwrap();
    let (_server, _conn_rx) = start_echo_server_at(&server_base, addr);

    let connected_at = up_rx
        .recv_timeout(Duration::from_secs(6))
        .expect("client eventually connects");
    let elapsed = connected_at - started;
    assert!(
        elapsed > Duration::from_millis(3000),
        "connected after {elapsed:?}; back-off did not double"
    );
    assert!(
        elapsed < Duration::from_millis(5000),
        "connected after {elapsed:?}; retry never fired on schedule"
    );
}

#[test]
fn first_retry_uses_initial_delay() {
    let addr = closed_port();

    let client_loop = EventLoopThread::spawn("initdelay-client", Config::default(), None).unwrap();
    let client = TcpClient::new(client_loop.handle().clone(), addr, "initdelay");
    let (up_tx, up_rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            let _ = up_tx.send(Instant::now());
        }
    }));

    let started = Instant::now();
    client.connect();

    // Server appears immediately after the refused first attempt; the
    // ~500ms retry picks it up.
    std::thread::sleep(Duration::from_millis(100));
    let server_base = EventLoopThread::spawn("initdelay-server", Config::default(), None).unwrap();
    let (_server, _conn_rx) = start_echo_server_at(&server_base, addr);

    let connected_at = up_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("client connects on first retry");
    let elapsed = connected_at - started;
    assert!(
        elapsed > Duration::from_millis(300) && elapsed < Duration::from_millis(1200),
        "first retry after {elapsed:?}, expected ~500ms"
    );
}

#[test]
fn stop_suppresses_the_scheduled_retry() {
    let addr = closed_port();

    let client_loop = EventLoopThread::spawn("stop-client", Config::default(), None).unwrap();
    let client = TcpClient::new(client_loop.handle().clone(), addr, "stop");
    let (up_tx, up_rx) = mpsc::channel::<()>();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            let _ = up_tx.send(());
        }
    }));

    client.connect();
    std::thread::sleep(Duration::from_millis(100));
    client.stop();

    // A server shows up in time for the (suppressed) 500ms retry.
    let server_base = EventLoopThread::spawn("stop-server", Config::default(), None).unwrap();
    let (_server, _conn_rx) = start_echo_server_at(&server_base, addr);

    assert!(
        up_rx.recv_timeout(Duration::from_secs(2)).is_err(),
        "stopped client must not connect"
    );
}

#[test]
fn client_reconnects_after_connection_drops() {
    let server_base = EventLoopThread::spawn("reconn-server", Config::default(), None).unwrap();
    let server = TcpServer::new(
        server_base.handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "reconn",
        ServerConfig::default(),
    )
    .unwrap();
    // The server kills every connection as soon as it says hello.
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        buf.retrieve_all();
        conn.force_close();
    }));
    server.start();

    let client_loop = EventLoopThread::spawn("reconn-client", Config::default(), None).unwrap();
    let client = TcpClient::new(client_loop.handle().clone(), server.local_addr(), "reconn");
    client.enable_retry();

    let (up_tx, up_rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            let _ = up_tx.send(());
            conn.send(b"hi");
        }
    }));
    client.connect();

    // First connection, killed by the server, then a reconnect.
    up_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("first connect");
    up_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("reconnect after drop");
}
