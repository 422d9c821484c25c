//! Binding of a file descriptor to its interest set and event callbacks.
//!
//! A `Channel` never owns its fd; the owning object (socket, timerfd,
//! eventfd) closes it. Channels are loop-local: the handle is a cheap clone
//! over `Rc<RefCell<..>>` state, so the type itself is `!Send` and every
//! interest change is forwarded to the owner loop, which asserts its thread.

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::event_loop::LoopInner;

// Interest and readiness share poll(2) bit values; the epoll backend relies
// on EPOLLIN == POLLIN etc., which holds on every Linux ABI.
const POLL_IN: u32 = libc::POLLIN as u32;
const POLL_PRI: u32 = libc::POLLPRI as u32;
const POLL_OUT: u32 = libc::POLLOUT as u32;
const POLL_ERR: u32 = libc::POLLERR as u32;
const POLL_HUP: u32 = libc::POLLHUP as u32;
const POLL_NVAL: u32 = libc::POLLNVAL as u32;
const POLL_RDHUP: u32 = libc::POLLRDHUP as u32;

/// Events a channel is interested in.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub(crate) struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(POLL_IN | POLL_PRI);
    pub const WRITE: Interest = Interest(POLL_OUT);

    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Events the multiplexer reported for a channel.
#[derive(Clone, Copy, Default)]
pub(crate) struct Ready(u32);

impl Ready {
    pub fn from_bits(bits: u32) -> Ready {
        Ready(bits)
    }

    /// Any condition that should drive the read path.
    pub fn is_readable(self) -> bool {
        self.0 & (POLL_IN | POLL_PRI | POLL_RDHUP) != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & POLL_OUT != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & POLL_ERR != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & POLL_HUP != 0
    }

    /// Only the poll(2) backend can report an invalid fd.
    pub fn is_invalid(self) -> bool {
        self.0 & POLL_NVAL != 0
    }

    /// Plain input readiness, used to distinguish hangup-with-data.
    pub fn has_input(self) -> bool {
        self.0 & POLL_IN != 0
    }
}

/// Multiplexer-private channel lifecycle state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PollerState {
    /// Never seen by the multiplexer.
    New,
    /// Currently registered with the kernel.
    Added,
    /// Known to the multiplexer but deregistered from the kernel.
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Instant)>;
type EventCallback = Box<dyn FnMut()>;

struct ChannelState {
    fd: RawFd,
    events: Interest,
    revents: Ready,
    state: PollerState,
    owner: RcWeak<LoopInner>,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    log_hup: bool,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

#[derive(Clone)]
pub(crate) struct Channel {
    inner: Rc<RefCell<ChannelState>>,
}

impl Channel {
    pub fn new(owner: &Rc<LoopInner>, fd: RawFd) -> Channel {
        Channel {
            inner: Rc::new(RefCell::new(ChannelState {
                fd,
                events: Interest::NONE,
                revents: Ready::default(),
                state: PollerState::New,
                owner: Rc::downgrade(owner),
                tie: None,
                log_hup: true,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            })),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn events(&self) -> Interest {
        self.inner.borrow().events
    }

    pub fn set_revents(&self, revents: Ready) {
        self.inner.borrow_mut().revents = revents;
    }

    pub fn poller_state(&self) -> PollerState {
        self.inner.borrow().state
    }

    pub fn set_poller_state(&self, state: PollerState) {
        self.inner.borrow_mut().state = state;
    }

    pub fn same_channel(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_read_callback(&self, f: impl FnMut(Instant) + 'static) {
        self.inner.borrow_mut().read_cb = Some(Box::new(f));
    }

    pub fn set_write_callback(&self, f: impl FnMut() + 'static) {
        self.inner.borrow_mut().write_cb = Some(Box::new(f));
    }

    pub fn set_close_callback(&self, f: impl FnMut() + 'static) {
        self.inner.borrow_mut().close_cb = Some(Box::new(f));
    }

    pub fn set_error_callback(&self, f: impl FnMut() + 'static) {
        self.inner.borrow_mut().error_cb = Some(Box::new(f));
    }

    /// Tie this channel to its owner object. While tied, events are only
    /// dispatched if the owner is still alive, and a strong reference is
    /// held for the duration of the dispatch so a callback cannot destroy
    /// the owner mid-event.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        self.inner.borrow_mut().tie = Some(Arc::downgrade(owner));
    }

    pub fn set_log_hup(&self, on: bool) {
        self.inner.borrow_mut().log_hup = on;
    }

    pub fn enable_reading(&self) {
        self.inner.borrow_mut().events.insert(Interest::READ);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.borrow_mut().events.remove(Interest::READ);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.borrow_mut().events.insert(Interest::WRITE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.borrow_mut().events.remove(Interest::WRITE);
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.borrow_mut().events = Interest::NONE;
        self.update();
    }

    pub fn is_reading(&self) -> bool {
        self.inner.borrow().events.contains(Interest::READ)
    }

    pub fn is_writing(&self) -> bool {
        self.inner.borrow().events.contains(Interest::WRITE)
    }

    pub fn is_none_event(&self) -> bool {
        self.inner.borrow().events.is_none()
    }

    /// Drop this channel from the multiplexer's bookkeeping entirely.
    /// The interest set must already be empty (`disable_all`).
    pub fn remove(&self) {
        debug_assert!(self.is_none_event());
        if let Some(owner) = self.inner.borrow().owner.upgrade() {
            owner.remove_channel(self);
        }
    }

    fn update(&self) {
        match self.inner.borrow().owner.upgrade() {
            Some(owner) => owner.update_channel(self),
            None => tracing::warn!(fd = self.fd(), "channel update after loop destruction"),
        }
    }

    /// Dispatch the events last reported by the multiplexer.
    pub fn handle_event(&self, receive_time: Instant) {
        let tie = self.inner.borrow().tie.clone();
        if let Some(tie) = tie {
            // The guard keeps the owner alive across every callback below.
            let Some(_guard) = tie.upgrade() else {
                return;
            };
            self.handle_event_with_guard(receive_time);
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let (fd, revents, log_hup) = {
            let state = self.inner.borrow();
            (state.fd, state.revents, state.log_hup)
        };

        if revents.is_hangup() && !revents.has_input() {
            if log_hup {
                tracing::warn!(fd, "peer hung up");
            }
            self.invoke(|s| &mut s.close_cb);
        }
        if revents.is_invalid() {
            tracing::warn!(fd, "invalid fd reported by multiplexer");
        }
        if revents.is_error() || revents.is_invalid() {
            self.invoke(|s| &mut s.error_cb);
        }
        if revents.is_readable() {
            self.invoke_read(receive_time);
        }
        if revents.is_writable() {
            self.invoke(|s| &mut s.write_cb);
        }
    }

    // Callbacks are taken out of the slot for the duration of the call so
    // they may freely re-enter the channel (enable/disable interest, even
    // remove it). A callback installed from within the call wins the slot.
    fn invoke(&self, slot: fn(&mut ChannelState) -> &mut Option<EventCallback>) {
        let cb = {
            let mut state = self.inner.borrow_mut();
            slot(&mut *state).take()
        };
        if let Some(mut f) = cb {
            f();
            let mut state = self.inner.borrow_mut();
            let entry = slot(&mut *state);
            if entry.is_none() {
                *entry = Some(f);
            }
        }
    }

    fn invoke_read(&self, receive_time: Instant) {
        let cb = self.inner.borrow_mut().read_cb.take();
        if let Some(mut f) = cb {
            f(receive_time);
            let mut state = self.inner.borrow_mut();
            if state.read_cb.is_none() {
                state.read_cb = Some(f);
            }
        }
    }
}
