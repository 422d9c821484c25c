//! TCP client: connector + a single connection, with optional reconnect.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::callbacks::{ConnectionCallback, MessageCallback, WriteCompleteCallback};
use crate::connection::TcpConnection;
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::sys;

#[derive(Default)]
struct ClientCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

struct ClientInner {
    loop_: Arc<LoopHandle>,
    name: String,
    server_addr: SocketAddr,
    connector: Arc<Connector>,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    connect_enabled: AtomicBool,
    retry: AtomicBool,
    next_conn_id: AtomicU64,
    callbacks: Mutex<ClientCallbacks>,
}

/// A TCP client with exponential-back-off connect and optional reconnect
/// after an established connection drops.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    pub fn new(loop_: Arc<LoopHandle>, server_addr: SocketAddr, name: &str) -> TcpClient {
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<ClientInner>| {
            let on_connected = {
                let weak = weak.clone();
                Box::new(move |socket: OwnedFd| {
                    if let Some(inner) = weak.upgrade() {
                        ClientInner::new_connection(&inner, socket);
                    }
                })
            };
            ClientInner {
                loop_: loop_.clone(),
                name: name.to_string(),
                server_addr,
                connector: Connector::new(loop_, server_addr, on_connected),
                connection: Mutex::new(None),
                connect_enabled: AtomicBool::new(false),
                retry: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
                callbacks: Mutex::new(ClientCallbacks::default()),
            }
        });
        TcpClient { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// Reconnect automatically when an established connection goes down.
    pub fn enable_retry(&self) {
        self.inner.retry.store(true, Ordering::Release);
    }

    pub fn retry_enabled(&self) -> bool {
        self.inner.retry.load(Ordering::Acquire)
    }

    /// The live connection, if currently connected.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.inner.connection.lock().clone()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.inner.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.inner.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.inner.callbacks.lock().write_complete = Some(cb);
    }

    /// Start connecting. Safe from any thread.
    pub fn connect(&self) {
        tracing::info!(
            name = %self.inner.name,
            addr = %self.inner.server_addr,
            "connecting"
        );
        self.inner.connect_enabled.store(true, Ordering::Release);
        self.inner.connector.start();
    }

    /// Graceful teardown of the live connection (half-close after drain).
    pub fn disconnect(&self) {
        self.inner.connect_enabled.store(false, Ordering::Release);
        if let Some(conn) = self.inner.connection.lock().clone() {
            conn.shutdown();
        }
    }

    /// Abort connecting (does not touch an established connection).
    pub fn stop(&self) {
        self.inner.connect_enabled.store(false, Ordering::Release);
        self.inner.connector.stop();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        self.inner.loop_.run_in_loop(move || {
            let conn = inner.connection.lock().take();
            match conn {
                Some(conn) => {
                    // The client is going away: reroute the close path
                    // straight to connect_destroyed, bypassing the client.
                    let loop_ = conn.loop_handle().clone();
                    conn.set_close_callback(Arc::new(move |c| {
                        let c = c.clone();
                        loop_.queue_in_loop(move || c.connect_destroyed());
                    }));
                    // With no other holders, nothing can send on it again;
                    // force the close so the loop drops its references.
                    if Arc::strong_count(&conn) == 1 {
                        conn.force_close();
                    }
                }
                None => inner.connector.stop(),
            }
        });
    }
}

impl ClientInner {
    /// Connector handed over a connected socket; runs on the loop thread.
    fn new_connection(inner: &Arc<ClientInner>, socket: OwnedFd) {
        inner.loop_.assert_in_loop_thread();
        let peer_addr = match sys::peer_addr(socket.as_raw_fd()) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(name = %inner.name, "getpeername failed: {e}");
                return;
            }
        };
        let local_addr = match sys::local_addr(socket.as_raw_fd()) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(name = %inner.name, "getsockname failed: {e}");
                return;
            }
        };
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}:{peer_addr}#{id}", inner.name);

        let conn = TcpConnection::new(inner.loop_.clone(), name, socket, local_addr, peer_addr);
        {
            let cbs = inner.callbacks.lock();
            if let Some(cb) = &cbs.connection {
                conn.set_connection_callback(cb.clone());
            }
            if let Some(cb) = &cbs.message {
                conn.set_message_callback(cb.clone());
            }
            if let Some(cb) = &cbs.write_complete {
                conn.set_write_complete_callback(cb.clone());
            }
        }
        {
            let weak = Arc::downgrade(inner);
            conn.set_close_callback(Arc::new(move |conn| {
                if let Some(inner) = weak.upgrade() {
                    ClientInner::remove_connection(&inner, conn);
                }
            }));
        }
        *inner.connection.lock() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(inner: &Arc<ClientInner>, conn: &Arc<TcpConnection>) {
        inner.loop_.assert_in_loop_thread();
        *inner.connection.lock() = None;
        let c = conn.clone();
        inner.loop_.queue_in_loop(move || c.connect_destroyed());

        if inner.retry.load(Ordering::Acquire) && inner.connect_enabled.load(Ordering::Acquire) {
            tracing::info!(
                name = %inner.name,
                addr = %inner.server_addr,
                "reconnecting"
            );
            inner.connector.restart();
        }
    }
}
