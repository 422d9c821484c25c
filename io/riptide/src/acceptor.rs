//! Listening-socket channel: accepts connections and hands the fds off.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::metrics::{ACCEPT_ERRORS, CONNECTIONS_ACCEPTED};
use crate::sys;

/// Upper bound on accepts per readiness event. Level-triggered semantics
/// make the bound safe: a still-nonempty backlog is reported again on the
/// next poll round.
const MAX_ACCEPTS_PER_EVENT: usize = 32;

pub(crate) struct Acceptor {
    socket: OwnedFd,
    channel: Channel,
    listening: bool,
}

impl Acceptor {
    /// Wrap an already-bound listening socket. `on_connection` receives each
    /// accepted fd with its peer address; must be called on the owner loop's
    /// thread.
    pub fn new(
        owner: &Rc<LoopInner>,
        socket: OwnedFd,
        mut on_connection: impl FnMut(OwnedFd, SocketAddr) + 'static,
    ) -> std::io::Result<Acceptor> {
        let listen_fd = socket.as_raw_fd();
        let channel = Channel::new(owner, listen_fd);

        // The reserve against EMFILE lives in the read callback: when the
        // process fd table fills up, the reserve is released, the doomed
        // connection accepted and closed, and the reserve retaken. Without
        // this a level-triggered multiplexer would spin on the unaccepted
        // connection forever.
        let mut reserve = Some(sys::open_dev_null()?);
        channel.set_read_callback(move |_| {
            accept_ready(listen_fd, &mut reserve, &mut on_connection);
        });

        Ok(Acceptor {
            socket,
            channel,
            listening: false,
        })
    }

    pub fn listen(&mut self, backlog: i32) -> std::io::Result<()> {
        sys::listen(self.socket.as_raw_fd(), backlog)?;
        self.listening = true;
        self.channel.enable_reading();
        Ok(())
    }

    #[allow(dead_code)]
    pub fn listening(&self) -> bool {
        self.listening
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn accept_ready(
    listen_fd: RawFd,
    reserve: &mut Option<OwnedFd>,
    on_connection: &mut impl FnMut(OwnedFd, SocketAddr),
) {
    for _ in 0..MAX_ACCEPTS_PER_EVENT {
        match sys::accept(listen_fd) {
            Ok((conn, peer)) => {
                CONNECTIONS_ACCEPTED.increment();
                on_connection(conn, peer);
            }
            Err(e) => {
                match e.raw_os_error() {
                    Some(libc::EAGAIN) => {}
                    Some(libc::EINTR)
                    | Some(libc::ECONNABORTED)
                    | Some(libc::EPROTO)
                    | Some(libc::EPERM) => {
                        // Transient, already-dead, or firewalled connection.
                        tracing::warn!("transient accept failure: {e}");
                        ACCEPT_ERRORS.increment();
                        continue;
                    }
                    Some(libc::EMFILE) => {
                        tracing::warn!("accept: process fd limit reached, shedding connection");
                        ACCEPT_ERRORS.increment();
                        shed_connection(listen_fd, reserve);
                    }
                    _ => {
                        tracing::error!("accept failed: {e}");
                        ACCEPT_ERRORS.increment();
                    }
                }
                return;
            }
        }
    }
}

/// EMFILE mitigation: give back the reserved fd, accept the connection we
/// cannot afford, close it, retake the reserve.
fn shed_connection(listen_fd: RawFd, reserve: &mut Option<OwnedFd>) {
    drop(reserve.take());
    match sys::accept(listen_fd) {
        Ok((conn, peer)) => {
            tracing::warn!(%peer, "closed connection due to fd pressure");
            drop(conn);
        }
        Err(e) => tracing::warn!("accept during fd-pressure shed failed: {e}"),
    }
    match sys::open_dev_null() {
        Ok(fd) => *reserve = Some(fd),
        Err(e) => tracing::error!("could not retake reserve fd: {e}"),
    }
}
