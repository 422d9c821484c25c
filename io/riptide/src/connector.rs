//! Non-blocking client connect with exponential back-off.
//!
//! State machine: Disconnected → Connecting → Connected, falling back to
//! Disconnected on every retryable failure. The in-flight socket is watched
//! for write readiness; readiness alone proves nothing, so the result is
//! read from SO_ERROR and checked for the self-connect degenerate case.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use crate::channel::Channel;
use crate::event_loop::{LoopBound, LoopHandle, LoopInner};
use crate::metrics::CONNECT_RETRIES;
use crate::sys;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }
}

pub(crate) type NewSocketCallback = Box<dyn FnMut(OwnedFd)>;

struct ConnectorIo {
    retry_delay: Duration,
    channel: Option<Channel>,
    socket: Option<OwnedFd>,
    on_connected: NewSocketCallback,
}

pub(crate) struct Connector {
    loop_: Arc<LoopHandle>,
    server_addr: SocketAddr,
    enabled: AtomicBool,
    state: AtomicU8,
    io: LoopBound<ConnectorIo>,
}

impl Connector {
    pub fn new(
        loop_: Arc<LoopHandle>,
        server_addr: SocketAddr,
        on_connected: NewSocketCallback,
    ) -> Arc<Connector> {
        Arc::new(Connector {
            loop_: loop_.clone(),
            server_addr,
            enabled: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            io: LoopBound::new(
                loop_,
                ConnectorIo {
                    retry_delay: INIT_RETRY_DELAY,
                    channel: None,
                    socket: None,
                    on_connected,
                },
            ),
        })
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Begin connecting. Safe from any thread.
    pub fn start(self: &Arc<Self>) {
        self.enabled.store(true, Ordering::Release);
        let this = self.clone();
        self.loop_.run_in_loop(move || this.start_in_loop());
    }

    /// Abort a connect in progress and suppress any scheduled retry. Safe
    /// from any thread.
    pub fn stop(self: &Arc<Self>) {
        self.enabled.store(false, Ordering::Release);
        let this = self.clone();
        self.loop_.queue_in_loop(move || {
            if this.state() == State::Connecting {
                this.set_state(State::Disconnected);
                let sock = this.take_in_flight();
                if let Some(sock) = sock {
                    this.retry(sock);
                }
            }
        });
    }

    /// Reset back-off and connect again. Used by the client for reconnects;
    /// runs on the loop thread.
    pub fn restart(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.enabled.store(true, Ordering::Release);
        self.io.with(|io| io.retry_delay = INIT_RETRY_DELAY);
        self.start_in_loop();
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.enabled.load(Ordering::Acquire) {
            tracing::debug!("connector stopped, not connecting");
            return;
        }
        if self.state() != State::Disconnected {
            return;
        }
        self.connect();
    }

    fn connect(self: &Arc<Self>) {
        let sock = match sys::tcp_socket(self.server_addr.is_ipv6()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("socket creation failed: {e}");
                return;
            }
        };
        let errno = sys::connect(sock.as_raw_fd(), &self.server_addr);
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(sock),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(sock),

            _ => {
                let err = std::io::Error::from_raw_os_error(errno);
                tracing::error!(addr = %self.server_addr, "connect failed: {err}");
            }
        }
    }

    /// Watch the in-flight socket for write readiness.
    fn connecting(self: &Arc<Self>, sock: OwnedFd) {
        self.set_state(State::Connecting);
        let inner = LoopInner::with_current(Rc::clone)
            .expect("connector runs on its loop thread");
        let channel = Channel::new(&inner, sock.as_raw_fd());
        // A refused connect reports HUP; that is the expected failure path,
        // not something to warn about.
        channel.set_log_hup(false);
        {
            let weak = Arc::downgrade(self);
            channel.set_write_callback(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            });
        }
        {
            let weak = Arc::downgrade(self);
            channel.set_error_callback(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_error();
                }
            });
        }
        channel.enable_writing();
        self.io.with(|io| {
            io.channel = Some(channel);
            io.socket = Some(sock);
        });
    }

    /// Deregister the watch channel and reclaim the in-flight socket.
    fn take_in_flight(self: &Arc<Self>) -> Option<OwnedFd> {
        self.io.with(|io| {
            if let Some(channel) = io.channel.take() {
                channel.disable_all();
                channel.remove();
            }
            io.socket.take()
        })
    }

    fn handle_write(self: &Arc<Self>) {
        if self.state() != State::Connecting {
            return;
        }
        let Some(sock) = self.take_in_flight() else {
            return;
        };
        let err = sys::socket_error(sock.as_raw_fd());
        if err != 0 {
            tracing::warn!(
                addr = %self.server_addr,
                "connect SO_ERROR: {}",
                std::io::Error::from_raw_os_error(err)
            );
            self.retry(sock);
        } else if sys::is_self_connect(sock.as_raw_fd()) {
            tracing::warn!(addr = %self.server_addr, "self connect, retrying");
            self.retry(sock);
        } else {
            self.set_state(State::Connected);
            if self.enabled.load(Ordering::Acquire) {
                self.io.with(|io| (io.on_connected)(sock));
            }
            // else: stopped while connecting — the socket drops here.
        }
    }

    fn handle_error(self: &Arc<Self>) {
        if self.state() != State::Connecting {
            return;
        }
        let Some(sock) = self.take_in_flight() else {
            return;
        };
        let err = sys::socket_error(sock.as_raw_fd());
        tracing::error!(
            addr = %self.server_addr,
            "connect error event, SO_ERROR: {}",
            std::io::Error::from_raw_os_error(err)
        );
        self.retry(sock);
    }

    /// Close the failed socket and schedule the next attempt with doubled
    /// back-off, capped at 30 s.
    fn retry(self: &Arc<Self>, sock: OwnedFd) {
        drop(sock);
        self.set_state(State::Disconnected);
        if !self.enabled.load(Ordering::Acquire) {
            tracing::debug!("connector stopped, not retrying");
            return;
        }
        CONNECT_RETRIES.increment();
        let delay = self.io.with(|io| {
            let delay = io.retry_delay;
            io.retry_delay = (io.retry_delay * 2).min(MAX_RETRY_DELAY);
            delay
        });
        tracing::info!(addr = %self.server_addr, ?delay, "retrying connect");
        let weak = Arc::downgrade(self);
        self.loop_.run_after(delay, move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }
}
