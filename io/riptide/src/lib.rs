//! riptide - multi-threaded reactor-pattern TCP networking.
//!
//! One event loop per thread, each owning a readiness multiplexer (epoll or
//! poll(2), level-triggered), a timerfd-backed timer queue, and an
//! eventfd-backed cross-thread task queue. Connections are distributed
//! round-robin over a pool of loop threads; all callbacks for a connection
//! run serially on its loop's thread.
//!
//! # Quick start
//!
//! ```ignore
//! use riptide::{EventLoop, ServerConfig, TcpServer};
//! use std::sync::Arc;
//!
//! let event_loop = EventLoop::new()?;
//! let server = TcpServer::new(
//!     event_loop.handle().clone(),
//!     "127.0.0.1:7878".parse()?,
//!     "echo",
//!     ServerConfig { threads: 4, ..Default::default() },
//! )?;
//! server.set_message_callback(Arc::new(|conn, buf, _when| {
//!     let data = buf.retrieve_all_as_bytes();
//!     conn.send(&data);
//! }));
//! server.start();
//! event_loop.run(); // blocks; server.handle().quit() stops it
//! ```
//!
//! # Threading model
//!
//! - `EventLoop` is pinned to its constructing thread (one per thread, ever).
//! - [`LoopHandle`] is the `Send + Sync` surface: `run_in_loop`,
//!   `queue_in_loop`, timers, `wakeup`, `quit`.
//! - Within one loop there is no concurrency at all; across loops there is
//!   full parallelism and no ordering.
//! - `TcpConnection` mutators (`send`, `shutdown`, `force_close`,
//!   `start_read`/`stop_read`) are safe from any thread and hop onto the
//!   connection's loop when called elsewhere.

mod acceptor;
pub mod buffer;
mod callbacks;
mod channel;
pub mod client;
pub mod config;
pub mod connection;
mod connector;
pub mod error;
pub mod event_loop;
pub mod metrics;
mod poller;
pub mod pool;
pub mod server;
mod sys;
mod timer;

pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, ThreadInitCallback,
    WriteCompleteCallback,
};
pub use client::TcpClient;
pub use config::{Backend, Config, ServerConfig};
pub use connection::{ConnectionState, TcpConnection};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use pool::{EventLoopPool, EventLoopThread};
pub use server::TcpServer;
pub use timer::TimerId;
