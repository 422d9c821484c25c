//! Per-thread reactor.
//!
//! An [`EventLoop`] is pinned to the thread that constructs it and drives a
//! readiness multiplexer, a timer queue, and a cross-thread task queue. The
//! loop-local half (`EventLoop`, `LoopInner`) is `!Send`; everything that is
//! safe to touch from other threads lives on the [`LoopHandle`], an `Arc`
//! that outlives the loop only as an inert task sink.
//!
//! Scheduling discipline per iteration: one bounded `poll`, then channel
//! event dispatch, then one pending-task drain. Tasks queued during dispatch
//! run in the same iteration's drain; tasks queued during the drain itself
//! run in the next iteration (the queueing side wakes the loop for that
//! case).

use std::cell::RefCell;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::config::Config;
use crate::error::Error;
use crate::metrics::LOOP_WAKEUPS;
use crate::poller::{self, Poller};
use crate::sys;
use crate::timer::{self, Timer, TimerId, TimerQueue};

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// The one event loop allowed per thread.
    static CURRENT_LOOP: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

/// The thread-safe surface of an event loop.
///
/// Everything here may be called from any thread: task posting, timers,
/// wakeup, quit. Operations that touch the multiplexer or channels are on
/// the loop-local side and assert the owner thread.
pub struct LoopHandle {
    thread: ThreadId,
    wake_fd: std::os::fd::OwnedFd,
    pending: Mutex<Vec<Task>>,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    iterations: AtomicU64,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// # Panics
    ///
    /// Panics when called off the owner thread. Loop-affine state is only
    /// coherent on that thread; proceeding would be a logic error.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            tracing::error!(
                owner = ?self.thread,
                caller = ?std::thread::current().id(),
                "loop-affine operation called off the owner thread"
            );
            panic!("operation requires the loop's owner thread");
        }
    }

    /// Run `f` on the loop thread: synchronously if the caller already is
    /// that thread, otherwise queued for the next iteration.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for execution on the loop thread.
    ///
    /// Wakes the loop unless the caller is the loop thread outside the
    /// pending-task drain — in that position the drain is still ahead in the
    /// current iteration. A task queued from within the drain needs the
    /// wakeup, or it would sit until the poll timeout expires.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.pending.lock().push(Box::new(f));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Force the multiplexer to return promptly.
    pub fn wakeup(&self) {
        LOOP_WAKEUPS.increment();
        if let Err(e) = sys::eventfd_write(self.wake_fd.as_raw_fd()) {
            tracing::error!("loop wakeup write failed: {e}");
        }
    }

    /// Ask the loop to exit after the current iteration. Safe from any
    /// thread; from a foreign thread the loop is woken so it observes the
    /// flag promptly.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Number of completed loop iterations.
    pub fn iteration(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Number of tasks waiting in the cross-thread queue.
    pub fn queue_size(&self) -> usize {
        self.pending.lock().len()
    }

    /// Schedule `f` to run on the loop thread at `when`.
    pub fn run_at(&self, when: Instant, f: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Box::new(f), when, Duration::ZERO)
    }

    /// Schedule `f` to run once after `delay`.
    pub fn run_after(&self, delay: Duration, f: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Box::new(f), Instant::now() + delay, Duration::ZERO)
    }

    /// Schedule `f` to run every `interval`, first firing one interval from
    /// now.
    pub fn run_every(&self, interval: Duration, f: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Box::new(f), Instant::now() + interval, interval)
    }

    fn schedule(
        &self,
        f: Box<dyn FnMut() + Send>,
        when: Instant,
        interval: Duration,
    ) -> TimerId {
        let boxed = Box::new(Timer::new(f, when, interval));
        let id = TimerId::of(&boxed);
        self.run_in_loop(move || {
            let added = LoopInner::with_current(|inner| inner.add_timer(boxed));
            if added.is_none() {
                tracing::warn!("timer scheduled on a thread with no running loop");
            }
        });
        id
    }

    /// Cancel a scheduled timer. Canceling an already-fired or unknown id is
    /// a no-op; canceling a repeating timer from inside its own callback
    /// stops the repetition.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            LoopInner::with_current(|inner| inner.cancel_timer(id));
        });
    }
}

/// Loop-local state: the multiplexer, the timer queue, the wake channel.
pub(crate) struct LoopInner {
    handle: Arc<LoopHandle>,
    poller: RefCell<Box<dyn Poller>>,
    timers: RefCell<Option<TimerQueue>>,
    wake_channel: RefCell<Option<Channel>>,
    active: RefCell<Vec<Channel>>,
}

impl LoopInner {
    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    /// The loop running on the current thread, if any.
    pub fn with_current<R>(f: impl FnOnce(&Rc<LoopInner>) -> R) -> Option<R> {
        CURRENT_LOOP.with(|slot| slot.borrow().as_ref().map(f))
    }

    pub fn update_channel(&self, channel: &Channel) {
        self.handle.assert_in_loop_thread();
        if let Err(e) = self.poller.borrow_mut().update_channel(channel) {
            tracing::error!(fd = channel.fd(), "multiplexer update failed: {e}");
            panic!("multiplexer update failed: {e}");
        }
    }

    pub fn remove_channel(&self, channel: &Channel) {
        self.handle.assert_in_loop_thread();
        debug_assert!(self.poller.borrow().has_channel(channel));
        if let Err(e) = self.poller.borrow_mut().remove_channel(channel) {
            tracing::error!(fd = channel.fd(), "multiplexer remove failed: {e}");
            panic!("multiplexer remove failed: {e}");
        }
    }

    pub fn add_timer(&self, timer: Box<Timer>) {
        self.handle.assert_in_loop_thread();
        self.timers
            .borrow_mut()
            .as_mut()
            .expect("timer queue initialized at loop construction")
            .add_timer(timer);
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.handle.assert_in_loop_thread();
        self.timers
            .borrow_mut()
            .as_mut()
            .expect("timer queue initialized at loop construction")
            .cancel(id);
    }

    /// Timerfd readiness: extract expired timers, run their callbacks with
    /// the queue released (they may schedule or cancel), then restart the
    /// repeating ones.
    pub fn handle_timer_expiry(&self, now: Instant) {
        let mut expired = self
            .timers
            .borrow_mut()
            .as_mut()
            .expect("timer queue initialized at loop construction")
            .take_expired(now);
        timer::run_expired(&mut expired);
        self.timers
            .borrow_mut()
            .as_mut()
            .expect("timer queue initialized at loop construction")
            .reset(expired, Instant::now());
    }

    #[cfg(test)]
    pub fn poll_once(&self, timeout: Duration, active: &mut Vec<Channel>) -> io::Result<Instant> {
        self.poller.borrow_mut().poll(timeout, active)
    }

    #[cfg(test)]
    pub fn poller_channel_count(&self) -> usize {
        self.poller.borrow().channel_count()
    }

    #[cfg(test)]
    pub fn poller_has_channel(&self, channel: &Channel) -> bool {
        self.poller.borrow().has_channel(channel)
    }
}

/// A per-thread reactor. Construct it on the thread that will run it; the
/// constructor claims that thread's loop slot and a second construction on
/// the same thread panics.
pub struct EventLoop {
    inner: Rc<LoopInner>,
    poll_timeout: Duration,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop, Error> {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Result<EventLoop, Error> {
        let occupied = CURRENT_LOOP.with(|slot| slot.borrow().is_some());
        if occupied {
            tracing::error!("attempted to construct a second event loop on this thread");
            panic!("another EventLoop already exists on this thread");
        }

        let wake_fd = sys::eventfd().map_err(Error::Io)?;
        let handle = Arc::new(LoopHandle {
            thread: std::thread::current().id(),
            wake_fd,
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
        });

        let inner = Rc::new(LoopInner {
            handle,
            poller: RefCell::new(poller::new_poller(config.backend).map_err(Error::Io)?),
            timers: RefCell::new(None),
            wake_channel: RefCell::new(None),
            active: RefCell::new(Vec::with_capacity(16)),
        });

        *inner.timers.borrow_mut() = Some(TimerQueue::new(&inner).map_err(Error::Io)?);

        // The wake channel drains the eventfd counter; the write side is the
        // handle's wakeup().
        let wake_fd = inner.handle.wake_fd.as_raw_fd();
        let wake_channel = Channel::new(&inner, wake_fd);
        wake_channel.set_read_callback(move |_| {
            if let Err(e) = sys::eventfd_read(wake_fd) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::error!("loop wakeup read failed: {e}");
                }
            }
        });
        wake_channel.enable_reading();
        *inner.wake_channel.borrow_mut() = Some(wake_channel);

        CURRENT_LOOP.with(|slot| *slot.borrow_mut() = Some(inner.clone()));
        tracing::debug!(backend = ?config.backend, "event loop created");

        Ok(EventLoop {
            inner,
            poll_timeout: config.poll_timeout,
        })
    }

    pub fn handle(&self) -> &Arc<LoopHandle> {
        self.inner.handle()
    }

    pub(crate) fn inner(&self) -> Rc<LoopInner> {
        self.inner.clone()
    }

    /// Drive the reactor until [`LoopHandle::quit`] is observed. Must be
    /// called on the constructing thread.
    pub fn run(&self) {
        let handle = self.inner.handle.clone();
        handle.assert_in_loop_thread();
        handle.quit.store(false, Ordering::Release);
        tracing::debug!("event loop running");

        while !handle.quit.load(Ordering::Acquire) {
            let mut active = std::mem::take(&mut *self.inner.active.borrow_mut());
            active.clear();

            let poll_time = match self.inner.poller.borrow_mut().poll(self.poll_timeout, &mut active)
            {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!("multiplexer poll failed: {e}");
                    Instant::now()
                }
            };
            handle.iterations.fetch_add(1, Ordering::Relaxed);

            for channel in &active {
                channel.handle_event(poll_time);
            }
            *self.inner.active.borrow_mut() = active;

            self.do_pending_tasks();
        }
        // One last drain so teardown tasks queued right before quit (e.g.
        // connection destruction) still run on this thread.
        self.do_pending_tasks();
        tracing::debug!("event loop stopped");
    }

    /// Swap the queue out under the lock, then run the tasks outside it so
    /// they can enqueue further tasks without deadlock. The in-progress flag
    /// makes queue_in_loop wake the loop for those late arrivals.
    fn do_pending_tasks(&self) {
        let handle = &self.inner.handle;
        handle.calling_pending.store(true, Ordering::Release);
        let tasks: Vec<Task> = std::mem::take(&mut *handle.pending.lock());
        for task in tasks {
            task();
        }
        handle.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Deregister the internal channels while the poller is still alive.
        if let Some(timers) = self.inner.timers.borrow().as_ref() {
            timers.shutdown_channel();
        }
        if let Some(wake) = self.inner.wake_channel.borrow_mut().take() {
            wake.disable_all();
            wake.remove();
        }
        CURRENT_LOOP.with(|slot| slot.borrow_mut().take());
    }
}

/// Holds state that belongs to one event loop inside an otherwise `Send +
/// Sync` object.
///
/// Access asserts the owner thread, which is what makes the unsafe `Send`/
/// `Sync` impls sound: the inner `RefCell` is only ever touched from that
/// single thread (and turns accidental re-entrancy into a deterministic
/// panic). The holder is responsible for draining the cell on the owner
/// thread before the last reference can drop elsewhere.
pub(crate) struct LoopBound<T> {
    owner: Arc<LoopHandle>,
    value: RefCell<T>,
}

unsafe impl<T> Send for LoopBound<T> {}
unsafe impl<T> Sync for LoopBound<T> {}

impl<T> LoopBound<T> {
    pub fn new(owner: Arc<LoopHandle>, value: T) -> LoopBound<T> {
        LoopBound {
            owner,
            value: RefCell::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.owner.assert_in_loop_thread();
        f(&mut *self.value.borrow_mut())
    }
}
