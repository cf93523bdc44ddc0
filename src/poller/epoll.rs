//! Level-triggered epoll backend.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::SystemTime;

use rustc_hash::FxHashMap;

use crate::channel::{Channel, INDEX_ADDED, INDEX_DELETED, INDEX_NEW};
use crate::poller::{ChannelList, Poller};

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    /// Scratch list handed to epoll_wait; grows monotonically, doubling
    /// whenever a wait fills it completely.
    events: Vec<libc::epoll_event>,
    channels: FxHashMap<RawFd, Arc<Channel>>,
}

fn empty_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            tracing::error!(%err, "epoll_create1 failed");
            return Err(err);
        }
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![empty_event(); INIT_EVENT_LIST_SIZE],
            channels: FxHashMap::default(),
        })
    }

    fn fill_active_channels(&self, num_events: usize, active_channels: &mut ChannelList) {
        for ev in &self.events[..num_events] {
            let fd = ev.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(ev.events);
                active_channels.push(channel.clone());
            }
        }
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut ev = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                // The fd may already be gone; nothing to recover.
                tracing::error!(fd, %err, "epoll_ctl del failed");
            } else {
                tracing::error!(fd, %err, "epoll_ctl add/mod failed");
                panic!("epoll_ctl add/mod failed for fd {fd}: {err}");
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut ChannelList) -> SystemTime {
        tracing::trace!(fds = self.channels.len(), "epoll_wait");
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = SystemTime::now();

        if n > 0 {
            let n = n as usize;
            tracing::trace!(events = n, "epoll_wait returned");
            self.fill_active_channels(n, active_channels);
            if n == self.events.len() {
                let doubled = self.events.len() * 2;
                self.events.resize(doubled, empty_event());
            }
        } else if n == 0 {
            tracing::trace!("epoll_wait timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            tracing::error!(err = %saved, "epoll_wait failed");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        let fd = channel.fd();
        tracing::trace!(fd, events = channel.events(), index, "update channel");

        if index == INDEX_NEW || index == INDEX_DELETED {
            if channel.is_none_event() {
                return;
            }
            if index == INDEX_NEW {
                self.channels.insert(fd, channel.clone());
            }
            channel.set_index(INDEX_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else if channel.is_none_event() {
            self.update(libc::EPOLL_CTL_DEL, channel);
            channel.set_index(INDEX_DELETED);
        } else {
            self.update(libc::EPOLL_CTL_MOD, channel);
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        tracing::trace!(fd, "remove channel");
        self.channels.remove(&fd);
        if channel.index() == INDEX_ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|found| Arc::ptr_eq(found, channel))
    }
}
