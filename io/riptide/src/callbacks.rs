//! User-facing callback types.
//!
//! Callbacks are shared (`Arc<dyn Fn ..>`) because the same callback is
//! installed on every connection a server accepts, and they always execute
//! on the connection's loop thread.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::LoopHandle;

/// Connection state change: fires once when a connection is established and
/// once when it is torn down (check [`TcpConnection::is_connected`]).
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Data arrived. The callback owns consuming the buffer (typically
/// `retrieve` after parsing); unconsumed bytes stay for the next call.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;

/// The output buffer transitioned to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// The output buffer crossed the configured high-water mark (fires on the
/// upward crossing only, with the buffered size).
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal: server/client teardown hook.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Runs on each freshly started loop thread before it enters its loop.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<LoopHandle>) + Send + Sync>;
