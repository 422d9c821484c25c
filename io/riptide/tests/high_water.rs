//! Output buffering: high-water mark fires once on the upward crossing,
//! write-complete fires once when the buffer drains.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use riptide::{Config, EventLoopThread, ServerConfig, TcpServer};

const HIGH_WATER_MARK: usize = 4096;
// Large enough that a single nonblocking write cannot drain it into the
// kernel socket buffers, forcing the output buffer (and the mark) into play.
const PAYLOAD: usize = 16 * 1024 * 1024;

#[test]
fn high_water_once_then_write_complete_once() {
    let base = EventLoopThread::spawn("hwm-base", Config::default(), None).unwrap();
    let server = TcpServer::new(
        base.handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "hwm",
        ServerConfig::default(),
    )
    .unwrap();

    let hwm_fired = Arc::new(AtomicUsize::new(0));
    let hwm_size = Arc::new(AtomicUsize::new(0));
    let wc_fired = Arc::new(AtomicUsize::new(0));
    let (conn_tx, conn_rx) = mpsc::channel();

    {
        let hwm_fired = hwm_fired.clone();
        let hwm_size = hwm_size.clone();
        let wc_fired = wc_fired.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.is_connected() {
                return;
            }
            conn.set_high_water_mark(HIGH_WATER_MARK);
            {
                let hwm_fired = hwm_fired.clone();
                let hwm_size = hwm_size.clone();
                conn.set_high_water_mark_callback(Arc::new(move |_conn, size| {
                    hwm_fired.fetch_add(1, Ordering::SeqCst);
                    hwm_size.store(size, Ordering::SeqCst);
                }));
            }
            let _ = conn_tx.send(conn.clone());
        }));
    }
    {
        let wc_fired = wc_fired.clone();
        server.set_write_complete_callback(Arc::new(move |_conn| {
            wc_fired.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.start();

    // Peer connects and initially does not read: the kernel buffers fill,
    // the server's output buffer grows past the mark.
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let conn = conn_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let payload = vec![b'p'; PAYLOAD];
    conn.send(&payload);

    // Give the loop time to take the direct write + buffer the rest.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        hwm_fired.load(Ordering::SeqCst),
        1,
        "high-water fires exactly once on the crossing"
    );
    assert!(
        hwm_size.load(Ordering::SeqCst) >= HIGH_WATER_MARK,
        "reported size includes the whole backlog"
    );
    assert_eq!(wc_fired.load(Ordering::SeqCst), 0, "not drained yet");

    // Unblock the peer: read everything.
    let mut total = 0usize;
    let mut buf = vec![0u8; 256 * 1024];
    while total < PAYLOAD {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "peer saw EOF after {total} bytes");
        total += n;
    }
    assert_eq!(total, PAYLOAD);

    // Drained: write-complete exactly once, and no further high-water.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(wc_fired.load(Ordering::SeqCst), 1);
    assert_eq!(hwm_fired.load(Ordering::SeqCst), 1);
}

#[test]
fn small_send_completes_without_high_water() {
    let base = EventLoopThread::spawn("hwm-small", Config::default(), None).unwrap();
    let server = TcpServer::new(
        base.handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "hwm-small",
        ServerConfig::default(),
    )
    .unwrap();

    let hwm_fired = Arc::new(AtomicUsize::new(0));
    let (wc_tx, wc_rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();

    {
        let hwm_fired = hwm_fired.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.is_connected() {
                return;
            }
            conn.set_high_water_mark(HIGH_WATER_MARK);
            {
                let hwm_fired = hwm_fired.clone();
                conn.set_high_water_mark_callback(Arc::new(move |_conn, _size| {
                    hwm_fired.fetch_add(1, Ordering::SeqCst);
                }));
            }
            let _ = conn_tx.send(conn.clone());
        }));
    }
    server.set_write_complete_callback(Arc::new(move |_conn| {
        let _ = wc_tx.send(());
    }));
    server.start();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let conn = conn_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // Fits in the socket buffer: direct write, immediate write-complete.
    conn.send(b"tiny");
    wc_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(hwm_fired.load(Ordering::SeqCst), 0);

    let mut got = [0u8; 4];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"tiny");
}
