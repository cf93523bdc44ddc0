//! Threads that each own exactly one event loop, and the fixed pool the
//! server distributes connections over.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::event_loop::{EventLoop, LoopHandle};
use crate::thread::Thread;

/// Runs on each worker loop's thread after the loop is constructed, before
/// it starts polling. When the pool has no workers it runs once on the base
/// loop instead.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

type HandleSlot = Arc<(Mutex<Option<LoopHandle>>, Condvar)>;

/// Owns a thread hosting one event loop. Dropping quits the loop and joins
/// the thread.
pub struct EventLoopThread {
    thread: Thread,
    slot: HandleSlot,
    loop_handle: Option<LoopHandle>,
}

impl EventLoopThread {
    pub fn new(init_cb: Option<ThreadInitCallback>, name: impl Into<String>) -> EventLoopThread {
        let slot: HandleSlot = Arc::new((Mutex::new(None), Condvar::new()));
        let publish = slot.clone();
        let thread = Thread::new(move || loop_thread_func(publish, init_cb), name);
        EventLoopThread {
            thread,
            slot,
            loop_handle: None,
        }
    }

    /// Spawn the thread and block until its loop is constructed, then return
    /// the loop's handle.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.loop_handle.is_none(), "start_loop called twice");
        self.thread.start();

        let handle = {
            let mut guard = self.slot.0.lock();
            loop {
                if let Some(handle) = guard.as_ref() {
                    break handle.clone();
                }
                self.slot.1.wait(&mut guard);
            }
        };
        self.loop_handle = Some(handle.clone());
        handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.take() {
            handle.quit();
            self.thread.join();
        }
    }
}

fn loop_thread_func(slot: HandleSlot, init_cb: Option<ThreadInitCallback>) {
    let lp = match EventLoop::new() {
        Ok(lp) => lp,
        Err(err) => {
            tracing::error!(%err, "failed to construct worker event loop");
            std::process::exit(1);
        }
    };
    if let Some(cb) = init_cb {
        cb(&lp);
    }
    {
        let mut guard = slot.0.lock();
        *guard = Some(lp.handle());
        slot.1.notify_one();
    }
    lp.run();
}

/// Fixed pool of worker loops fed by the base loop's acceptor. With zero
/// workers the base loop doubles as the single worker.
pub struct EventLoopThreadPool {
    base_loop: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: LoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started, "thread count changed after start");
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, init_cb: Option<ThreadInitCallback>) {
        assert!(!self.started, "pool started twice");
        assert!(self.base_loop.is_in_loop_thread());
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            let mut thread = EventLoopThread::new(init_cb.clone(), name);
            let handle = thread.start_loop();
            self.threads.push(thread);
            self.loops.push(handle);
        }
        if self.num_threads == 0 {
            if let Some(cb) = init_cb {
                EventLoop::with_current(|lp| cb(lp));
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Next worker loop in round-robin order; the base loop when the pool
    /// has no workers.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        if self.loops.is_empty() {
            self.base_loop.clone()
        } else {
            let handle = self.loops[self.next].clone();
            self.next = (self.next + 1) % self.loops.len();
            handle
        }
    }

    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}
