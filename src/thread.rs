//! Worker thread lifecycle wrapper.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

static NUM_CREATED: AtomicI32 = AtomicI32::new(0);

/// A named worker thread whose `start` blocks until the spawned thread has
/// published its id. Dropping a started, un-joined `Thread` detaches it.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    func: Option<Box<dyn FnOnce() + Send + 'static>>,
    name: String,
    tid: Option<ThreadId>,
    started: bool,
    joined: bool,
}

impl Thread {
    /// `name` may be empty; unnamed threads are numbered `Thread<n>`.
    pub fn new(func: impl FnOnce() + Send + 'static, name: impl Into<String>) -> Thread {
        let mut name = name.into();
        let num = NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1;
        if name.is_empty() {
            name = format!("Thread{num}");
        }
        Thread {
            handle: None,
            func: Some(Box::new(func)),
            name,
            tid: None,
            started: false,
            joined: false,
        }
    }

    pub fn start(&mut self) {
        assert!(!self.started, "thread started twice");
        self.started = true;
        let func = self.func.take().expect("thread function already consumed");

        let sync = Arc::new((Mutex::new(None::<ThreadId>), Condvar::new()));
        let publish = sync.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                {
                    let mut tid = publish.0.lock();
                    *tid = Some(thread::current().id());
                    publish.1.notify_one();
                }
                func();
            })
            .expect("failed to spawn thread");

        let mut tid = sync.0.lock();
        while tid.is_none() {
            sync.1.wait(&mut tid);
        }
        self.tid = *tid;
        self.handle = Some(handle);
    }

    pub fn join(&mut self) {
        assert!(self.started, "joining a thread that was never started");
        self.joined = true;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn tid(&self) -> Option<ThreadId> {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_observes_thread_id() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut t = Thread::new(
            move || {
                tx.send(thread::current().id()).unwrap();
            },
            "observer",
        );
        t.start();
        let reported = t.tid().expect("tid captured by start");
        let actual = rx.recv().unwrap();
        assert_eq!(reported, actual);
        t.join();
        assert!(t.joined());
    }

    #[test]
    fn unnamed_threads_get_numbered_names() {
        let t = Thread::new(|| {}, "");
        assert!(t.name().starts_with("Thread"));
        assert!(t.name()["Thread".len()..].parse::<i32>().is_ok());
    }
}
