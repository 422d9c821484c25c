//! Timers multiplexed through a single timerfd per loop.
//!
//! The queue keeps two ordered views over the same timers: one keyed by
//! `(expiration, address)` to answer "what expires next", one keyed by
//! `(address, sequence)` for cancel lookup. Both views always hold exactly
//! the same set of timers.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashSet;

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::metrics::TIMERS_FIRED;
use crate::sys;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Instant,
    interval: Duration,
    repeat: bool,
    sequence: u64,
}

impl Timer {
    pub fn new(callback: TimerCallback, when: Instant, interval: Duration) -> Timer {
        Timer {
            callback,
            expiration: when,
            repeat: interval > Duration::ZERO,
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn run(&mut self) {
        (self.callback)();
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    fn restart(&mut self, now: Instant) {
        debug_assert!(self.repeat);
        self.expiration = now + self.interval;
    }
}

/// Identifies one scheduled timer: the heap address of the boxed timer plus
/// a process-unique sequence number. The address alone could be reused by a
/// later allocation; the sequence disambiguates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId {
    addr: usize,
    sequence: u64,
}

impl TimerId {
    pub(crate) fn of(timer: &Timer) -> TimerId {
        TimerId {
            addr: timer as *const Timer as usize,
            sequence: timer.sequence,
        }
    }
}

fn timer_key(timer: &Timer) -> (usize, u64) {
    (timer as *const Timer as usize, timer.sequence)
}

pub(crate) struct TimerQueue {
    timerfd: OwnedFd,
    channel: Channel,
    /// Expiration-ordered view: what expires next.
    timers: BTreeMap<(Instant, usize), Box<Timer>>,
    /// Address-ordered view for cancel lookup; the value is the key into
    /// `timers` (the timer's current expiration).
    active: BTreeMap<(usize, u64), Instant>,
    /// Ids canceled from within their own callback during this dispatch.
    canceling: AHashSet<(usize, u64)>,
    calling_expired: bool,
}

impl TimerQueue {
    pub fn new(owner: &Rc<LoopInner>) -> io::Result<TimerQueue> {
        let timerfd = sys::timerfd()?;
        let channel = Channel::new(owner, timerfd.as_raw_fd());
        {
            let owner = Rc::downgrade(owner);
            channel.set_read_callback(move |now| {
                if let Some(owner) = owner.upgrade() {
                    owner.handle_timer_expiry(now);
                }
            });
        }
        channel.enable_reading();
        Ok(TimerQueue {
            timerfd,
            channel,
            timers: BTreeMap::new(),
            active: BTreeMap::new(),
            canceling: AHashSet::new(),
            calling_expired: false,
        })
    }

    /// Insert a timer; re-arms the timerfd when the new timer becomes the
    /// earliest expiration.
    pub fn add_timer(&mut self, timer: Box<Timer>) {
        let earliest_changed = self
            .timers
            .first_key_value()
            .is_none_or(|((when, _), _)| timer.expiration() < *when);
        let key = timer_key(&timer);
        self.active.insert(key, timer.expiration());
        self.timers.insert((timer.expiration(), key.0), timer);
        debug_assert_eq!(self.timers.len(), self.active.len());

        if earliest_changed {
            self.arm(self.timers.keys().next().map(|(when, _)| *when));
        }
    }

    /// Cancel by id. A timer that is currently running its own callback is
    /// remembered so the restart step skips it; an already-dead id is a
    /// no-op.
    pub fn cancel(&mut self, id: TimerId) {
        let key = (id.addr, id.sequence);
        if let Some(expiration) = self.active.remove(&key) {
            let removed = self.timers.remove(&(expiration, id.addr));
            debug_assert!(removed.is_some());
            debug_assert_eq!(self.timers.len(), self.active.len());
        } else if self.calling_expired {
            self.canceling.insert(key);
        }
    }

    /// Range-extract every timer with `expiration <= now`, removing it from
    /// both views. Marks the dispatch in progress for cancel bookkeeping.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Box<Timer>> {
        // Drain the timerfd expiration count; spurious wakeups are fine.
        let _ = sys::timerfd_read(self.timerfd.as_raw_fd());

        let sentinel = (now, usize::MAX);
        let keep = self.timers.split_off(&sentinel);
        let expired = std::mem::replace(&mut self.timers, keep);
        let expired: Vec<Box<Timer>> = expired.into_values().collect();
        for timer in &expired {
            self.active.remove(&timer_key(timer));
        }
        debug_assert_eq!(self.timers.len(), self.active.len());

        self.canceling.clear();
        self.calling_expired = true;
        expired
    }

    /// Restart repeating timers that were not canceled mid-callback, then
    /// re-arm the timerfd for the new earliest expiration.
    pub fn reset(&mut self, expired: Vec<Box<Timer>>, now: Instant) {
        self.calling_expired = false;
        for mut timer in expired {
            if timer.repeat() && !self.canceling.contains(&timer_key(&timer)) {
                timer.restart(now);
                self.add_timer(timer);
            }
        }
        self.arm(self.timers.keys().next().map(|(when, _)| *when));
    }

    fn arm(&self, next: Option<Instant>) {
        let fd = self.timerfd.as_raw_fd();
        let result = match next {
            Some(when) => sys::timerfd_arm(fd, when.saturating_duration_since(Instant::now())),
            None => sys::timerfd_disarm(fd),
        };
        if let Err(e) = result {
            tracing::error!("timerfd_settime failed: {e}");
        }
    }

    /// Deregister the timerfd channel. Called by the owning loop on drop.
    pub fn shutdown_channel(&self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

/// Run the expired-timer callbacks. Free function so the caller can release
/// its borrow of the queue while user code runs (callbacks may add or cancel
/// timers, which re-borrows the queue).
pub(crate) fn run_expired(expired: &mut [Box<Timer>]) {
    for timer in expired {
        TIMERS_FIRED.increment();
        timer.run();
    }
}
