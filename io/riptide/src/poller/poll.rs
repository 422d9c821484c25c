//! poll(2) backend.
//!
//! Keeps one `pollfd` slot per known channel. A channel with an empty
//! interest set stays in the array as a tombstone whose fd is negated
//! (`-fd - 1`), which poll(2) ignores; re-enabling restores the fd in place.

use std::io;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use super::Poller;
use crate::channel::{Channel, PollerState, Ready};

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: AHashMap<libc::c_int, Channel>,
    // fd -> index into `pollfds`, maintained across swap-removals.
    indices: AHashMap<libc::c_int, usize>,
}

fn tombstone(fd: libc::c_int) -> libc::c_int {
    -fd - 1
}

fn slot_fd(pfd: &libc::pollfd) -> libc::c_int {
    if pfd.fd < 0 { tombstone(pfd.fd) } else { pfd.fd }
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: AHashMap::new(),
            indices: AHashMap::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Channel>) -> io::Result<Instant> {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
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
        let mut remaining = n as usize;
        for pfd in &self.pollfds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            if let Some(channel) = self.channels.get(&pfd.fd) {
                channel.set_revents(Ready::from_bits(pfd.revents as u16 as u32));
                active.push(channel.clone());
            }
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        match channel.poller_state() {
            PollerState::New | PollerState::Deleted => {
                if channel.poller_state() == PollerState::New {
                    self.channels.insert(fd, channel.clone());
                    self.pollfds.push(libc::pollfd {
                        fd,
                        events: channel.events().bits() as i16,
                        revents: 0,
                    });
                    self.indices.insert(fd, self.pollfds.len() - 1);
                } else {
                    // Deleted: the tombstoned slot is still in the array.
                    let idx = self.indices[&fd];
                    let pfd = &mut self.pollfds[idx];
                    pfd.fd = fd;
                    pfd.events = channel.events().bits() as i16;
                    pfd.revents = 0;
                }
                channel.set_poller_state(PollerState::Added);
                Ok(())
            }
            PollerState::Added => {
                let idx = self.indices[&fd];
                let pfd = &mut self.pollfds[idx];
                pfd.events = channel.events().bits() as i16;
                pfd.revents = 0;
                if channel.is_none_event() {
                    pfd.fd = tombstone(fd);
                    channel.set_poller_state(PollerState::Deleted);
                }
                Ok(())
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        self.channels.remove(&fd);
        if let Some(idx) = self.indices.remove(&fd) {
            self.pollfds.swap_remove(idx);
            if idx < self.pollfds.len() {
                let moved = slot_fd(&self.pollfds[idx]);
                self.indices.insert(moved, idx);
            }
        }
        channel.set_poller_state(PollerState::New);
        Ok(())
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
