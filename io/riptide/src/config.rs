use std::time::Duration;

/// Readiness multiplexer backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backend {
    /// epoll(7): readiness array, scales with the number of ready fds.
    #[default]
    Epoll,
    /// poll(2): iterate-array fallback, one slot per registered fd.
    Poll,
}

/// Configuration for one event loop.
#[derive(Clone, Debug)]
pub struct Config {
    /// Which multiplexer backend to use.
    pub backend: Backend,
    /// Upper bound on one multiplexer wait. Cross-thread wakeups interrupt
    /// it; this only bounds a fully idle iteration.
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            poll_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a [`crate::TcpServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Event loop configuration for the I/O loop threads.
    pub loop_config: Config,
    /// Number of I/O loop threads. 0 = run connections on the acceptor loop.
    pub threads: usize,
    /// Set SO_REUSEPORT on the listening socket.
    pub reuse_port: bool,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// Enable SO_KEEPALIVE on accepted connections.
    pub keep_alive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            loop_config: Config::default(),
            threads: 0,
            reuse_port: false,
            backlog: 1024,
            tcp_nodelay: true,
            keep_alive: false,
        }
    }
}
