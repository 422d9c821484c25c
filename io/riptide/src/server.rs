//! TCP server: acceptor + loop pool + connection registry.
//!
//! The acceptor and the name→connection map live on the base loop; accepted
//! connections are handed round-robin to the pool's I/O loops. Removal is
//! the two-hop dance: the closing connection's loop posts to the base loop
//! to erase the map entry, which posts back to the I/O loop to run the
//! final `connect_destroyed` — the task chain keeps the connection alive
//! through its own teardown.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, ThreadInitCallback, WriteCompleteCallback,
};
use crate::config::ServerConfig;
use crate::connection::TcpConnection;
use crate::error::Error;
use crate::event_loop::{LoopBound, LoopHandle, LoopInner};
use crate::pool::EventLoopPool;
use crate::sys;

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    base_loop: Arc<LoopHandle>,
    name: String,
    local_addr: SocketAddr,
    config: ServerConfig,
    listen_socket: Mutex<Option<OwnedFd>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    pool: Mutex<Option<EventLoopPool>>,
    acceptor: LoopBound<Option<Acceptor>>,
    connections: Mutex<AHashMap<String, Arc<TcpConnection>>>,
    callbacks: Mutex<ServerCallbacks>,
}

/// A multi-threaded TCP server.
///
/// Binds eagerly in [`new`](TcpServer::new) (so `127.0.0.1:0` resolves to a
/// concrete port immediately); starts listening and spawns the loop pool on
/// [`start`](TcpServer::start). Set the callbacks before starting.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(
        base_loop: Arc<LoopHandle>,
        addr: SocketAddr,
        name: &str,
        config: ServerConfig,
    ) -> Result<TcpServer, Error> {
        let (socket, local_addr) = sys::listen_socket(&addr, config.reuse_port)?;
        tracing::info!(name, %local_addr, "server bound");
        Ok(TcpServer {
            inner: Arc::new(ServerInner {
                base_loop: base_loop.clone(),
                name: name.to_string(),
                local_addr,
                config,
                listen_socket: Mutex::new(Some(socket)),
                started: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
                pool: Mutex::new(None),
                acceptor: LoopBound::new(base_loop, None),
                connections: Mutex::new(AHashMap::new()),
                callbacks: Mutex::new(ServerCallbacks::default()),
            }),
        })
    }

    /// The bound address, with port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn name(&self) -> &str {
        &self.inner.name
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

    /// Runs on each I/O loop thread before it starts serving.
    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.inner.callbacks.lock().thread_init = Some(cb);
    }

    /// Spawn the loop pool and start accepting. Idempotent; safe from any
    /// thread.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        self.inner
            .base_loop
            .run_in_loop(move || ServerInner::start_in_loop(&inner));
    }

    /// Number of live connections (diagnostics).
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        self.inner.base_loop.run_in_loop(move || {
            inner.acceptor.with(|slot| drop(slot.take()));
            let connections: Vec<Arc<TcpConnection>> =
                inner.connections.lock().drain().map(|(_, c)| c).collect();
            for conn in connections {
                let c = conn.clone();
                conn.loop_handle().queue_in_loop(move || c.connect_destroyed());
            }
            // The pool drops with `inner` once the teardown task finishes,
            // quitting and joining the I/O loop threads after the queued
            // connect_destroyed tasks have been delivered.
        });
    }
}

impl ServerInner {
    fn start_in_loop(inner: &Arc<ServerInner>) {
        inner.base_loop.assert_in_loop_thread();

        let thread_init = inner.callbacks.lock().thread_init.clone();
        let mut pool = EventLoopPool::new(inner.base_loop.clone(), &format!("{}-io", inner.name));
        if let Err(e) = pool.start(
            inner.config.threads,
            inner.config.loop_config.clone(),
            thread_init,
        ) {
            tracing::error!(name = %inner.name, "loop pool startup failed: {e}");
            panic!("loop pool startup failed: {e}");
        }
        *inner.pool.lock() = Some(pool);

        let socket = inner
            .listen_socket
            .lock()
            .take()
            .expect("start_in_loop runs once");
        let owner = LoopInner::with_current(std::rc::Rc::clone)
            .expect("server starts on its base loop");
        let weak = Arc::downgrade(inner);
        let acceptor = Acceptor::new(&owner, socket, move |sock, peer| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::new_connection(&inner, sock, peer);
            }
        });
        let mut acceptor = match acceptor {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(name = %inner.name, "acceptor setup failed: {e}");
                panic!("acceptor setup failed: {e}");
            }
        };
        if let Err(e) = acceptor.listen(inner.config.backlog) {
            tracing::error!(name = %inner.name, "listen failed: {e}");
            panic!("listen failed: {e}");
        }
        inner.acceptor.with(|slot| *slot = Some(acceptor));
        tracing::info!(name = %inner.name, addr = %inner.local_addr, "server listening");
    }

    fn new_connection(inner: &Arc<ServerInner>, socket: OwnedFd, peer_addr: SocketAddr) {
        inner.base_loop.assert_in_loop_thread();

        let io_loop = inner
            .pool
            .lock()
            .as_mut()
            .expect("pool exists while accepting")
            .get_next_loop();
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{id}", inner.name, inner.local_addr);
        tracing::debug!(name = %name, peer = %peer_addr, "accepted connection");

        if inner.config.tcp_nodelay {
            if let Err(e) = sys::set_tcp_nodelay(socket.as_raw_fd(), true) {
                tracing::warn!(name = %name, "TCP_NODELAY failed: {e}");
            }
        }
        if inner.config.keep_alive {
            if let Err(e) = sys::set_keep_alive(socket.as_raw_fd(), true) {
                tracing::warn!(name = %name, "SO_KEEPALIVE failed: {e}");
            }
        }
        let local_addr = sys::local_addr(socket.as_raw_fd()).unwrap_or(inner.local_addr);

        let conn = TcpConnection::new(io_loop.clone(), name.clone(), socket, local_addr, peer_addr);
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
                    ServerInner::remove_connection(&inner, conn);
                }
            }));
        }
        inner.connections.lock().insert(name, conn.clone());

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// First hop: back to the base loop to erase the registry entry; second
    /// hop: back to the I/O loop for the final destruction.
    fn remove_connection(inner: &Arc<ServerInner>, conn: &Arc<TcpConnection>) {
        let inner = inner.clone();
        let conn = conn.clone();
        let base_loop = inner.base_loop.clone();
        base_loop.run_in_loop(move || {
            inner.base_loop.assert_in_loop_thread();
            tracing::debug!(name = conn.name(), "removing connection");
            inner.connections.lock().remove(conn.name());
            let c = conn.clone();
            conn.loop_handle().queue_in_loop(move || c.connect_destroyed());
        });
    }
}
