//! Loop-owning threads and the round-robin pool.

use std::sync::Arc;
use std::thread;

use crate::callbacks::ThreadInitCallback;
use crate::config::Config;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// A thread that owns and runs one event loop.
///
/// The loop is constructed *on* the spawned thread (loops are pinned to
/// their constructing thread); the handle travels back over a one-shot
/// channel before the thread enters its loop. Dropping the
/// `EventLoopThread` quits the loop and joins the thread.
pub struct EventLoopThread {
    handle: Arc<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn spawn(
        name: &str,
        config: Config,
        init: Option<ThreadInitCallback>,
    ) -> Result<EventLoopThread, Error> {
        let (tx, rx) = crossbeam_channel::bounded::<Arc<LoopHandle>>(1);
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                // No caller to hand an error to out here; a loop that cannot
                // be constructed is fatal for the thread.
                let event_loop = match EventLoop::with_config(&config) {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::error!(thread = %thread_name, "event loop construction failed: {e}");
                        panic!("event loop construction failed: {e}");
                    }
                };
                if let Some(init) = &init {
                    init(event_loop.handle());
                }
                if tx.send(event_loop.handle().clone()).is_err() {
                    // Spawner gave up; nothing to run for.
                    return;
                }
                event_loop.run();
            })
            .map_err(Error::Io)?;

        let handle = rx
            .recv()
            .map_err(|_| Error::LoopStartup(format!("loop thread {name} died during startup")))?;
        Ok(EventLoopThread {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Fixed-size pool of loop threads with round-robin assignment.
///
/// With zero threads every [`get_next_loop`](Self::get_next_loop) returns
/// the base loop, so single-threaded servers need no special casing.
pub struct EventLoopPool {
    base_loop: Arc<LoopHandle>,
    name: String,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<LoopHandle>>,
    next: usize,
    started: bool,
}

impl EventLoopPool {
    pub fn new(base_loop: Arc<LoopHandle>, name: &str) -> EventLoopPool {
        EventLoopPool {
            base_loop,
            name: name.to_string(),
            threads: Vec::new(),
            loops: Vec::new(),
            next: 0,
            started: false,
        }
    }

    /// Spawn `num_threads` loop threads. Blocks until every loop has been
    /// constructed and its handle published. `init` runs on each thread
    /// before its loop starts.
    pub fn start(
        &mut self,
        num_threads: usize,
        config: Config,
        init: Option<ThreadInitCallback>,
    ) -> Result<(), Error> {
        assert!(!self.started, "pool already started");
        self.started = true;
        for i in 0..num_threads {
            let thread =
                EventLoopThread::spawn(&format!("{}-{i}", self.name), config.clone(), init.clone())?;
            self.loops.push(thread.handle().clone());
            self.threads.push(thread);
        }
        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Next loop, round-robin. Called on the base loop's thread so the
    /// cursor needs no synchronization.
    pub fn get_next_loop(&mut self) -> Arc<LoopHandle> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }

    /// Deterministic (sticky) assignment by hash.
    pub fn get_loop_for_hash(&self, hash: usize) -> Arc<LoopHandle> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        self.loops[hash % self.loops.len()].clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<LoopHandle>> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}
