//! The per-thread reactor.
//!
//! An [`EventLoop`] owns a readiness backend, the channels registered with
//! it, and a cross-thread task queue drained once per iteration. Exactly one
//! loop may exist per thread; everything except the task queue is touched
//! only from the owner thread.
//!
//! The cross-thread face of a loop is the cloneable [`LoopHandle`]:
//! `run_in_loop` / `queue_in_loop` / `wakeup` / `quit` work from any thread,
//! while the loop-local state stays reachable only through the owner
//! thread's current-loop slot.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Error;
use crate::metrics;
use crate::poller::{self, ChannelList, Poller};

/// Fixed idle timeout handed to the backend.
const POLL_TIMEOUT_MS: i32 = 10_000;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// One loop per thread; constructing a second is fatal.
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = const { RefCell::new(None) };
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        tracing::error!(%err, "eventfd failed");
        return Err(err);
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

struct LoopShared {
    owner_thread: ThreadId,
    wakeup_fd: OwnedFd,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    pending_tasks: Mutex<Vec<Task>>,
}

/// Cheap, cloneable, `Send + Sync` handle to an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("owner_thread", &self.shared.owner_thread)
            .finish()
    }
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.owner_thread
    }

    /// Run `task` on the loop thread: inline when already there, queued
    /// otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Append `task` to the pending queue. The loop is woken when the caller
    /// is off the owner thread, or when the owner thread is currently inside
    /// the pending-task pass (the new task would otherwise sit behind the
    /// next poll).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending_tasks.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Ask the loop to exit at the next iteration boundary.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Unblock the loop's poll. The written value is irrelevant.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            tracing::error!(bytes = n, "wakeup wrote {n} bytes instead of 8");
        }
        metrics::LOOP_WAKEUPS.increment();
    }
}

pub struct EventLoop {
    handle: LoopHandle,
    poller: RefCell<Box<dyn Poller>>,
    active_channels: RefCell<ChannelList>,
    poll_return_time: Cell<SystemTime>,
    looping: Cell<bool>,
    wakeup_channel: Arc<Channel>,
}

impl EventLoop {
    /// Create the loop for the calling thread.
    ///
    /// Panics if this thread already owns a loop; fails if the wakeup fd or
    /// the readiness backend cannot be created.
    pub fn new() -> Result<Rc<EventLoop>, Error> {
        let duplicate = CURRENT_LOOP.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .is_some()
        });
        if duplicate {
            tracing::error!("another EventLoop already exists on this thread");
            panic!("another EventLoop already exists on this thread");
        }

        let wakeup_fd = create_eventfd()?;
        let poller = poller::new_default_poller()?;

        let shared = Arc::new(LoopShared {
            owner_thread: thread::current().id(),
            wakeup_fd,
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            pending_tasks: Mutex::new(Vec::new()),
        });
        let handle = LoopHandle { shared };
        let wakeup_raw = handle.shared.wakeup_fd.as_raw_fd();
        let wakeup_channel = Arc::new(Channel::new(handle.clone(), wakeup_raw));

        let lp = Rc::new(EventLoop {
            handle,
            poller: RefCell::new(poller),
            active_channels: RefCell::new(Vec::new()),
            poll_return_time: Cell::new(SystemTime::now()),
            looping: Cell::new(false),
            wakeup_channel,
        });

        CURRENT_LOOP.with(|slot| *slot.borrow_mut() = Some(Rc::downgrade(&lp)));

        lp.wakeup_channel
            .set_read_callback(move |_receive_time| handle_wakeup_read(wakeup_raw));
        lp.wakeup_channel.enable_reading();

        tracing::debug!(thread = ?thread::current().id(), "event loop created");
        Ok(lp)
    }

    /// Run `f` against the loop owned by the calling thread.
    ///
    /// Panics when the thread owns no loop; channel operations route through
    /// here and are only legal on the owner thread.
    pub(crate) fn with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> R {
        CURRENT_LOOP.with(|slot| {
            let lp = slot
                .borrow()
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .expect("no EventLoop exists on this thread");
            f(&lp)
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    /// Wall-clock time observed when the last poll returned.
    pub fn poll_return_time(&self) -> SystemTime {
        self.poll_return_time.get()
    }

    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.run_in_loop(task);
    }

    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.queue_in_loop(task);
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn wakeup(&self) {
        self.handle.wakeup();
    }

    /// Drive the reactor until [`quit`](EventLoop::quit).
    ///
    /// Each iteration polls with the fixed 10 s idle timeout, dispatches
    /// every ready channel, then drains the pending-task queue. Ready
    /// channels always run before cross-thread tasks within an iteration.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop::run called off the owner thread"
        );
        assert!(!self.looping.get(), "EventLoop::run re-entered");
        self.looping.set(true);
        tracing::debug!("event loop running");

        while !self.handle.shared.quit.load(Ordering::Acquire) {
            let mut active = std::mem::take(&mut *self.active_channels.borrow_mut());
            active.clear();
            let now = self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active);
            self.poll_return_time.set(now);

            for channel in &active {
                channel.handle_event(now);
            }
            // Hand the scratch list back so its capacity is reused.
            *self.active_channels.borrow_mut() = active;

            self.do_pending_tasks();
        }

        tracing::debug!("event loop stopped");
        self.looping.set(false);
    }

    /// Swap the pending queue out under the lock, then run the tasks
    /// lock-free: a task enqueueing another task must not deadlock, and the
    /// new task runs on the next iteration.
    fn do_pending_tasks(&self) {
        let mut tasks = Vec::new();
        self.handle
            .shared
            .calling_pending_tasks
            .store(true, Ordering::Release);
        {
            let mut pending = self.handle.shared.pending_tasks.lock();
            std::mem::swap(&mut tasks, &mut *pending);
        }
        for task in tasks {
            task();
        }
        self.handle
            .shared
            .calling_pending_tasks
            .store(false, Ordering::Release);
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(
            *channel.owner_loop() == self.handle,
            "channel updated on a foreign loop"
        );
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        assert!(
            *channel.owner_loop() == self.handle,
            "channel removed on a foreign loop"
        );
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.poller.borrow().has_channel(channel)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Direct poller access: the current-loop weak pointer is already
        // dead while the last Rc is being dropped.
        self.poller.get_mut().remove_channel(&self.wakeup_channel);
        CURRENT_LOOP.with(|slot| *slot.borrow_mut() = None);
        tracing::debug!("event loop destroyed");
    }
}

fn handle_wakeup_read(wakeup_fd: RawFd) {
    let mut one: u64 = 0;
    let n = unsafe {
        libc::read(
            wakeup_fd,
            &mut one as *mut u64 as *mut libc::c_void,
            8,
        )
    };
    if n != 8 {
        tracing::error!(bytes = n, "wakeup read returned {n} bytes instead of 8");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_thread::EventLoopThread;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn run_in_loop_is_inline_on_owner_thread() {
        let lp = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        lp.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "another EventLoop already exists")]
    fn second_loop_on_thread_is_fatal() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new();
    }

    #[test]
    fn cross_thread_tasks_run_in_fifo_order() {
        let mut lt = EventLoopThread::new(None, "fifo-test");
        let handle = lt.start_loop();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100usize {
            let order = order.clone();
            handle.queue_in_loop(move || order.lock().push(i));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.queue_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let seen = order.lock().clone();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn queued_task_runs_exactly_once() {
        let mut lt = EventLoopThread::new(None, "once-test");
        let handle = lt.start_loop();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        handle.queue_in_loop(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.queue_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Let a second poll cycle pass before checking for double execution.
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.queue_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_queued_by_tasks_run_next_iteration() {
        let mut lt = EventLoopThread::new(None, "requeue-test");
        let handle = lt.start_loop();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner_handle = handle.clone();
        handle.queue_in_loop(move || {
            let tx = tx.clone();
            inner_handle.queue_in_loop(move || tx.send(()).unwrap());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn quit_from_other_thread_stops_loop() {
        let mut lt = EventLoopThread::new(None, "quit-test");
        let handle = lt.start_loop();
        handle.quit();
        // Drop joins the loop thread; a hung loop would hang the test.
        drop(lt);
    }
}
