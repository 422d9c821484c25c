//! Per-connection state machine over a connected TCP socket.
//!
//! A `TcpConnection` is shared as `Arc<TcpConnection>`: the owning server or
//! client holds a strong reference, in-flight tasks capture strong
//! references across loop hops, and the connection's channel holds a weak
//! tie that is upgraded for the duration of each event dispatch. Everything
//! that belongs to the I/O loop (channel, buffers, read-interest shadow)
//! sits behind [`LoopBound`] cells; the public mutators are safe from any
//! thread and hop onto the owner loop.

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::{LoopBound, LoopHandle, LoopInner};
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::sys;

/// Default high-water mark: 64 MiB of buffered output.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

struct ConnectionIo {
    channel: Option<Channel>,
    output: Buffer,
    reading: bool,
}

pub struct TcpConnection {
    loop_: Arc<LoopHandle>,
    name: String,
    socket: OwnedFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    io: LoopBound<ConnectionIo>,
    input: LoopBound<Buffer>,
}

impl TcpConnection {
    pub(crate) fn new(
        loop_: Arc<LoopHandle>,
        name: String,
        socket: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        tracing::debug!(name = %name, peer = %peer_addr, "connection created");
        Arc::new(TcpConnection {
            name,
            socket,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
            context: Mutex::new(None),
            io: LoopBound::new(
                loop_.clone(),
                ConnectionIo {
                    channel: None,
                    output: Buffer::new(),
                    reading: false,
                },
            ),
            input: LoopBound::new(loop_.clone(), Buffer::new()),
            loop_,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> &Arc<LoopHandle> {
        &self.loop_
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Read-interest shadow flag; only meaningful on the loop thread.
    pub fn is_reading(&self) -> bool {
        self.io.with(|io| io.reading)
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = sys::set_tcp_nodelay(self.socket.as_raw_fd(), on) {
            tracing::warn!(name = %self.name, "TCP_NODELAY failed: {e}");
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = sys::set_keep_alive(self.socket.as_raw_fd(), on) {
            tracing::warn!(name = %self.name, "SO_KEEPALIVE failed: {e}");
        }
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Release);
    }

    /// Attach an arbitrary per-connection value (protocol state, session
    /// data). Replaces any previous value.
    pub fn set_context(&self, value: Box<dyn Any + Send + Sync>) {
        *self.context.lock() = Some(value);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.context.lock().take()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        self.callbacks.lock().high_water_mark = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    /// Send bytes. Safe from any thread; off the loop thread the data is
    /// copied into a task, and nothing touches the socket from the caller.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        match self.state() {
            ConnectionState::Connected => {}
            state => {
                tracing::warn!(name = %self.name, ?state, "send on a non-connected connection");
                return;
            }
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.clone();
            let owned = data.to_vec();
            self.loop_.queue_in_loop(move || this.send_in_loop(&owned));
        }
    }

    /// Send the readable contents of a buffer, draining it.
    pub fn send_buffer(self: &Arc<Self>, buffer: &mut Buffer) {
        let data = buffer.retrieve_all_as_bytes();
        self.send(&data);
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            tracing::warn!(name = %self.name, "disconnected, dropping write");
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        // Direct write only when nothing is queued, so bytes can never be
        // reordered around the output buffer.
        let idle = self.io.with(|io| {
            io.output.readable_bytes() == 0
                && !io.channel.as_ref().is_some_and(|c| c.is_writing())
        });
        if idle {
            match sys::write(self.socket.as_raw_fd(), data) {
                Ok(n) => {
                    written = n;
                    BYTES_SENT.add(n as u64);
                    if written == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        tracing::error!(name = %self.name, "write failed: {e}");
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if fault || written >= data.len() {
            return;
        }

        let remaining = &data[written..];
        let buffered = self.io.with(|io| io.output.readable_bytes());
        let mark = self.high_water_mark.load(Ordering::Acquire);
        if buffered < mark && buffered + remaining.len() >= mark {
            // Crossing from below: tell the user the peer is falling behind.
            let size = buffered + remaining.len();
            let cb = self.callbacks.lock().high_water_mark.clone();
            if let Some(cb) = cb {
                let this = self.clone();
                self.loop_.queue_in_loop(move || cb(&this, size));
            }
        }
        self.io.with(|io| {
            io.output.append(remaining);
            if let Some(channel) = &io.channel {
                if !channel.is_writing() {
                    channel.enable_writing();
                }
            }
        });
    }

    /// Half-close the write side once the output buffer drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnecting);
            let this = self.clone();
            self.loop_.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let writing = self
            .io
            .with(|io| io.channel.as_ref().is_some_and(|c| c.is_writing()));
        if !writing {
            // Output already drained: half-close now. Otherwise handle_write
            // performs the deferred half-close after the drain.
            if let Err(e) = sys::shutdown_write(self.socket.as_raw_fd()) {
                tracing::error!(name = %self.name, "shutdown failed: {e}");
            }
        }
    }

    /// Close regardless of pending output, via the normal close path.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.set_state(ConnectionState::Disconnecting);
            let this = self.clone();
            self.loop_.queue_in_loop(move || {
                if this.state() == ConnectionState::Disconnecting {
                    this.handle_close();
                }
            });
        }
    }

    /// Like [`force_close`](Self::force_close) after a delay. Bound through
    /// a weak reference: if the connection is gone when the timer fires,
    /// nothing happens (and a reconnected successor is a different
    /// instance, so it cannot be hit by the stale timer).
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.set_state(ConnectionState::Disconnecting);
            let weak = Arc::downgrade(self);
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resume delivering message callbacks. Idempotent.
    pub fn start_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_.run_in_loop(move || {
            this.io.with(|io| {
                if !io.reading {
                    if let Some(channel) = &io.channel {
                        channel.enable_reading();
                    }
                    io.reading = true;
                }
            });
        });
    }

    /// Stop delivering message callbacks (kernel-level backpressure).
    /// Idempotent.
    pub fn stop_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_.run_in_loop(move || {
            this.io.with(|io| {
                if io.reading {
                    if let Some(channel) = &io.channel {
                        channel.disable_reading();
                    }
                    io.reading = false;
                }
            });
        });
    }

    /// Install the channel on the I/O loop and deliver the "up" callback.
    /// Runs exactly once, on the loop thread, right after the connection is
    /// handed to its loop.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);

        let inner = LoopInner::with_current(Rc::clone)
            .expect("connect_established runs on the connection's loop");
        let channel = Channel::new(&inner, self.socket.as_raw_fd());
        {
            let weak = Arc::downgrade(self);
            channel.set_read_callback(move |ts| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(ts);
                }
            });
        }
        {
            let weak = Arc::downgrade(self);
            channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
        }
        {
            let weak = Arc::downgrade(self);
            channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
        {
            let weak = Arc::downgrade(self);
            channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });
        }
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        channel.tie(&tie);
        channel.enable_reading();
        self.io.with(|io| {
            io.channel = Some(channel);
            io.reading = true;
        });

        CONNECTIONS_ACTIVE.increment();
        tracing::debug!(name = %self.name, peer = %self.peer_addr, "connection up");
        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown: detach the channel from the loop. Always the last
    /// step of the two-hop destruction sequence.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Connected {
            // Destruction without a prior handle_close (owner teardown).
            self.set_state(ConnectionState::Disconnected);
            self.io.with(|io| {
                if let Some(channel) = &io.channel {
                    channel.disable_all();
                }
            });
            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        CONNECTIONS_ACTIVE.decrement();
        self.io.with(|io| {
            if let Some(channel) = io.channel.take() {
                channel.disable_all();
                channel.remove();
            }
        });
        tracing::debug!(name = %self.name, "connection destroyed");
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let result = self.input.with(|input| input.read_fd(self.socket.as_raw_fd()));
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                let cb = self.callbacks.lock().message.clone();
                match cb {
                    Some(cb) => self.input.with(|input| cb(self, input, receive_time)),
                    // No reader installed: discard, or the level-triggered
                    // multiplexer would report this data forever.
                    None => self.input.with(|input| input.retrieve_all()),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(name = %self.name, "read failed: {e}");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let writing = self
            .io
            .with(|io| io.channel.as_ref().is_some_and(|c| c.is_writing()));
        if !writing {
            tracing::trace!(name = %self.name, "connection is down, no more writing");
            return;
        }

        let result = self
            .io
            .with(|io| sys::write(self.socket.as_raw_fd(), io.output.peek()));
        match result {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                let drained = self.io.with(|io| {
                    io.output.retrieve(n);
                    if io.output.readable_bytes() == 0 {
                        // Must drop write-interest or the level-triggered
                        // multiplexer would spin on the writable socket.
                        if let Some(channel) = &io.channel {
                            channel.disable_writing();
                        }
                        true
                    } else {
                        false
                    }
                });
                if drained {
                    self.queue_write_complete();
                    if self.state() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(name = %self.name, "write failed: {e}");
            }
        }
    }

    /// Normal close path for peer close, forced close, and fatal errors.
    /// After this, no further user callbacks fire for the connection.
    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            // Peer close and a queued force_close can race; close once.
            return;
        }
        tracing::debug!(name = %self.name, state = ?self.state(), "closing");
        self.set_state(ConnectionState::Disconnected);
        self.io.with(|io| {
            if let Some(channel) = &io.channel {
                channel.disable_all();
            }
        });

        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = connection_cb {
            cb(self); // user-visible "down"
        }
        if let Some(cb) = close_cb {
            cb(self); // owner erases its reference and schedules destruction
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let err = sys::socket_error(self.socket.as_raw_fd());
        tracing::error!(
            name = %self.name,
            "connection error: {}",
            std::io::Error::from_raw_os_error(err)
        );
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.lock().write_complete.clone();
        if let Some(cb) = cb {
            let this = self.clone();
            self.loop_.queue_in_loop(move || cb(&this));
        }
    }

    /// Readable bytes currently queued for sending; loop thread only.
    pub fn output_queue_len(&self) -> usize {
        self.io.with(|io| io.output.readable_bytes())
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
