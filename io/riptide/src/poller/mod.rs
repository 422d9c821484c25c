//! Readiness multiplexer with two interchangeable backends.
//!
//! Both backends are level-triggered; the acceptor's EMFILE handling and the
//! connection write path depend on that. Backend selection happens once at
//! loop construction via [`crate::config::Backend`].

mod epoll;
mod poll;

use std::io;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::config::Backend;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

pub(crate) trait Poller {
    /// Wait up to `timeout` for events. Fills `active` with the channels
    /// whose registered events fired (their `revents` already set) and
    /// returns the timestamp taken right after the syscall. `EINTR` is a
    /// clean zero-event return.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Channel>) -> io::Result<Instant>;

    /// Register, modify, or (on an empty interest set) deregister a channel.
    fn update_channel(&mut self, channel: &Channel) -> io::Result<()>;

    /// Forget a channel entirely. Its interest set must already be empty.
    fn remove_channel(&mut self, channel: &Channel) -> io::Result<()>;

    fn has_channel(&self, channel: &Channel) -> bool;

    /// Number of channels in the bookkeeping map (diagnostics and tests).
    #[allow(dead_code)]
    fn channel_count(&self) -> usize;
}

pub(crate) fn new_poller(backend: Backend) -> io::Result<Box<dyn Poller>> {
    match backend {
        Backend::Epoll => Ok(Box::new(EpollPoller::new()?)),
        Backend::Poll => Ok(Box::new(PollPoller::new())),
    }
}
