//! A channel binds one file descriptor, its interest mask, and its readiness
//! callbacks to the event loop that owns the fd.
//!
//! Channels are created free-floating; registration with the loop's poller
//! happens on the first `enable_reading` / `enable_writing`. Every interest
//! mutation must happen on the owning loop's thread.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::event_loop::{EventLoop, LoopHandle};

pub(crate) const EVENT_NONE: u32 = 0;
pub(crate) const EVENT_READ: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

// Poller bookkeeping. The meaning is backend-private; the epoll backend uses
// these as registration states, the poll backend as a slot index.
pub(crate) const INDEX_NEW: i32 = -1;
pub(crate) const INDEX_ADDED: i32 = 1;
pub(crate) const INDEX_DELETED: i32 = 2;

type ReadCallback = Box<dyn FnMut(SystemTime) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub struct Channel {
    loop_handle: LoopHandle,
    fd: RawFd,
    /// Interest mask, in epoll bit encoding.
    events: AtomicU32,
    /// Ready mask last returned by the poller.
    revents: AtomicU32,
    index: AtomicI32,
    tied: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    // Wired once by the fd owner before registration; dispatched under this
    // lock. Callbacks must not re-enter the setters.
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub(crate) fn new(loop_handle: LoopHandle, fd: RawFd) -> Channel {
        Channel {
            loop_handle,
            fd,
            events: AtomicU32::new(EVENT_NONE),
            revents: AtomicU32::new(EVENT_NONE),
            index: AtomicI32::new(INDEX_NEW),
            tied: AtomicBool::new(false),
            tie: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn owner_loop(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub fn is_none_event(&self) -> bool {
        self.events() == EVENT_NONE
    }

    pub fn is_reading(&self) -> bool {
        self.events() & EVENT_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events() & EVENT_WRITE != 0
    }

    pub(crate) fn set_read_callback(&self, cb: impl FnMut(SystemTime) + Send + 'static) {
        self.callbacks.lock().read = Some(Box::new(cb));
    }

    pub(crate) fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().write = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().close = Some(Box::new(cb));
    }

    pub(crate) fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().error = Some(Box::new(cb));
    }

    /// Tie this channel to the object owning its fd. The tie is weak; each
    /// dispatch upgrades it and silently drops the event when the owner is
    /// already gone, which closes the race between a close and an in-flight
    /// readiness notification.
    pub(crate) fn tie(&self, owner: Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(&owner));
        self.tied.store(true, Ordering::Release);
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.events.fetch_or(EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.events.fetch_and(!EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.events.fetch_or(EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.events.fetch_and(!EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.events.store(EVENT_NONE, Ordering::Relaxed);
        self.update();
    }

    fn update(self: &Arc<Self>) {
        assert!(
            self.loop_handle.is_in_loop_thread(),
            "channel interest mutated off the owner loop thread (fd={})",
            self.fd
        );
        EventLoop::with_current(|lp| lp.update_channel(self));
    }

    /// Ask the owning loop to drop this channel from its poller.
    pub(crate) fn remove(self: &Arc<Self>) {
        assert!(
            self.loop_handle.is_in_loop_thread(),
            "channel removed off the owner loop thread (fd={})",
            self.fd
        );
        EventLoop::with_current(|lp| lp.remove_channel(self));
    }

    /// Single dispatch entry, called by the owning loop for each readiness
    /// notification.
    pub(crate) fn handle_event(self: &Arc<Self>, receive_time: SystemTime) {
        if self.tied.load(Ordering::Acquire) {
            let guard = { self.tie.lock().as_ref().and_then(|w| w.upgrade()) };
            match guard {
                Some(_owner) => self.handle_event_with_guard(receive_time),
                // Owner died between poll and dispatch.
                None => tracing::trace!(fd = self.fd, "dropping event for dead owner"),
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: SystemTime) {
        let revents = self.revents.load(Ordering::Relaxed);
        tracing::trace!(fd = self.fd, revents, "channel dispatch");
        let mut cbs = self.callbacks.lock();

        // Peer hang-up with nothing left to read.
        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            if let Some(cb) = cbs.close.as_mut() {
                cb();
            }
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            if let Some(cb) = cbs.error.as_mut() {
                cb();
            }
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
            if let Some(cb) = cbs.read.as_mut() {
                cb(receive_time);
            }
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            if let Some(cb) = cbs.write.as_mut() {
                cb();
            }
        }
    }
}
