//! epoll(7) backend.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use ahash::AHashMap;

use super::Poller;
use crate::channel::{Channel, PollerState, Ready};

/// Initial readiness-array capacity; doubled whenever a poll fills it.
const INITIAL_EVENT_CAPACITY: usize = 16;

pub(crate) struct EpollPoller {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: AHashMap<RawFd, Channel>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_CAPACITY],
            channels: AHashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u32 as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Channel>) -> io::Result<Instant> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout.as_millis() as libc::c_int,
            )
        };
        let now = Instant::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(now);
            }
            return Err(err);
        }
        let n = n as usize;
        for ev in &self.events[..n] {
            let fd = ev.u64 as u32 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(Ready::from_bits(ev.events));
                active.push(channel.clone());
            }
        }
        if n == self.events.len() {
            // The array was full; there may be more ready fds than slots.
            self.events.resize(n * 2, unsafe { std::mem::zeroed() });
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        match channel.poller_state() {
            PollerState::New | PollerState::Deleted => {
                if channel.poller_state() == PollerState::New {
                    self.channels.insert(fd, channel.clone());
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                channel.set_poller_state(PollerState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, fd, channel.events().bits())
            }
            PollerState::Added => {
                if channel.is_none_event() {
                    channel.set_poller_state(PollerState::Deleted);
                    self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, channel.events().bits())
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        let state = channel.poller_state();
        self.channels.remove(&fd);
        channel.set_poller_state(PollerState::New);
        if state == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
        } else {
            Ok(())
        }
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| c.same_channel(channel))
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
