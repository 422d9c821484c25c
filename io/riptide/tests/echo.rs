//! End-to-end echo: server round trip, half-close, cross-thread send.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use riptide::{Config, EventLoopThread, ServerConfig, TcpClient, TcpServer};

struct EchoServer {
    server: TcpServer,
    // Loop threads outlive the server so teardown tasks have somewhere to run.
    _base: EventLoopThread,
    down_rx: mpsc::Receiver<String>,
}

fn start_echo_server(threads: usize) -> EchoServer {
    let base = EventLoopThread::spawn("echo-base", Config::default(), None).unwrap();
    let config = ServerConfig {
        threads,
        ..Default::default()
    };
    let server = TcpServer::new(
        base.handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "echo",
        config,
    )
    .unwrap();

    let (down_tx, down_rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn| {
        if !conn.is_connected() {
            let _ = down_tx.send(conn.name().to_string());
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();
    EchoServer {
        server,
        _base: base,
        down_rx,
    }
}

#[test]
fn echo_round_trip_and_half_close() {
    let echo = start_echo_server(1);
    let addr = echo.server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(b"hello\n").unwrap();

    let mut got = [0u8; 6];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"hello\n");

    // Client half-closes; the server must see the connection go down.
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let name = echo
        .down_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("server connection callback (down) within 1s");
    assert!(name.starts_with("echo-"), "connection name: {name}");
}

#[test]
fn echo_across_worker_pool() {
    let echo = start_echo_server(3);
    let addr = echo.server.local_addr();

    // Several clients land on different loops round-robin; all must echo
    // correctly.
    let mut streams = Vec::new();
    for i in 0..6 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let msg = format!("message-{i}\n");
        stream.write_all(msg.as_bytes()).unwrap();
        let mut got = vec![0u8; msg.len()];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(got, msg.as_bytes());
        streams.push(stream);
    }
    assert_eq!(echo.server.connection_count(), 6);
}

#[test]
fn pipelined_messages_echo_in_order() {
    let echo = start_echo_server(1);
    let addr = echo.server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut sent = Vec::new();
    for i in 0..100 {
        sent.extend_from_slice(format!("chunk {i};").as_bytes());
    }
    stream.write_all(&sent).unwrap();

    let mut got = vec![0u8; sent.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(got, sent);
}

#[test]
fn client_connects_and_echoes() {
    let echo = start_echo_server(1);
    let addr = echo.server.local_addr();

    let client_loop = EventLoopThread::spawn("echo-client", Config::default(), None).unwrap();
    let client = TcpClient::new(client_loop.handle().clone(), addr, "client");

    let (msg_tx, msg_rx) = mpsc::channel();
    let (down_tx, down_rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            conn.send(b"hello\n");
        } else {
            let _ = down_tx.send(());
        }
    }));
    client.set_message_callback(Arc::new(move |conn, buf, _when| {
        if buf.readable_bytes() >= 6 {
            msg_tx.send(buf.retrieve_all_as_bytes()).unwrap();
            conn.shutdown();
        }
    }));
    client.connect();

    let echoed = msg_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(echoed, b"hello\n");

    // shutdown() half-closes; the server drains and closes; both sides see
    // the teardown.
    echo.down_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("server side down");
    down_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("client side down");
}

#[test]
fn send_from_foreign_thread_reaches_the_peer() {
    let echo = start_echo_server(1);
    let addr = echo.server.local_addr();

    let client_loop = EventLoopThread::spawn("xthread-client", Config::default(), None).unwrap();
    let client = TcpClient::new(client_loop.handle().clone(), addr, "xthread");

    let (msg_tx, msg_rx) = mpsc::channel();
    client.set_message_callback(Arc::new(move |_conn, buf, _when| {
        msg_tx.send(buf.retrieve_all_as_bytes()).unwrap();
    }));
    client.connect();

    // Wait for the connection from this (non-loop) thread.
    let conn = {
        let mut conn = None;
        for _ in 0..100 {
            if let Some(c) = client.connection() {
                conn = Some(c);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        conn.expect("client connected")
    };

    // The send happens entirely off the loop thread: the bytes are copied
    // into a task and written by the loop on its next iteration.
    assert!(!conn.loop_handle().is_in_loop_thread());
    conn.send(b"ping");

    let echoed = msg_rx.recv_timeout(Duration::from_millis(500)).unwrap();
    assert_eq!(echoed, b"ping");
}

#[test]
fn force_close_tears_down_immediately() {
    let echo = start_echo_server(1);
    let addr = echo.server.local_addr();

    let client_loop = EventLoopThread::spawn("fc-client", Config::default(), None).unwrap();
    let client = TcpClient::new(client_loop.handle().clone(), addr, "fc");
    let (down_tx, down_rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn| {
        if !conn.is_connected() {
            let _ = down_tx.send(());
        }
    }));
    client.connect();

    let conn = {
        let mut conn = None;
        for _ in 0..100 {
            if let Some(c) = client.connection() {
                conn = Some(c);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        conn.expect("client connected")
    };

    conn.force_close();
    down_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("down callback after force_close");
    assert!(conn.is_disconnected());

    // The socket closes when the last reference goes; then the peer sees it.
    drop(conn);
    echo.down_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("server observes the close");
}
