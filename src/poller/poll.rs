//! poll(2) fallback backend.
//!
//! The channel's backend-private index is the channel's slot in the pollfd
//! array. Interest-less channels stay in the array with a negated fd so poll
//! ignores them without losing the slot.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::SystemTime;

use rustc_hash::FxHashMap;

use crate::channel::{Channel, EVENT_NONE, INDEX_NEW};
use crate::poller::{ChannelList, Poller};

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: FxHashMap<RawFd, Arc<Channel>>,
}

fn to_poll_events(events: u32) -> libc::c_short {
    let mut out = 0;
    if events & libc::EPOLLIN as u32 != 0 {
        out |= libc::POLLIN;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        out |= libc::POLLPRI;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        out |= libc::POLLOUT;
    }
    out
}

fn from_poll_events(revents: libc::c_short) -> u32 {
    let mut out = EVENT_NONE;
    if revents & libc::POLLIN != 0 {
        out |= libc::EPOLLIN as u32;
    }
    if revents & libc::POLLPRI != 0 {
        out |= libc::EPOLLPRI as u32;
    }
    if revents & libc::POLLOUT != 0 {
        out |= libc::EPOLLOUT as u32;
    }
    if revents & libc::POLLRDHUP != 0 {
        out |= libc::EPOLLRDHUP as u32;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        out |= libc::EPOLLERR as u32;
    }
    if revents & libc::POLLHUP != 0 {
        out |= libc::EPOLLHUP as u32;
    }
    out
}

/// Slot fd encoding for ignored entries.
fn ignored_fd(fd: RawFd) -> RawFd {
    -fd - 1
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: FxHashMap::default(),
        }
    }

    fn fill_active_channels(
        &self,
        mut num_events: usize,
        active_channels: &mut ChannelList,
    ) {
        for pfd in &self.pollfds {
            if num_events == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            num_events -= 1;
            if let Some(channel) = self.channels.get(&pfd.fd) {
                channel.set_revents(from_poll_events(pfd.revents));
                active_channels.push(channel.clone());
            }
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut ChannelList) -> SystemTime {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = std::io::Error::last_os_error();
        let now = SystemTime::now();

        if n > 0 {
            self.fill_active_channels(n as usize, active_channels);
        } else if n == 0 {
            tracing::trace!("poll timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            tracing::error!(err = %saved, "poll failed");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        tracing::trace!(fd, events = channel.events(), "update channel");

        if channel.index() < 0 {
            if channel.is_none_event() {
                return;
            }
            debug_assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: to_poll_events(channel.events()),
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, channel.clone());
        } else {
            let idx = channel.index() as usize;
            let pfd = &mut self.pollfds[idx];
            pfd.events = to_poll_events(channel.events());
            pfd.revents = 0;
            pfd.fd = if channel.is_none_event() { ignored_fd(fd) } else { fd };
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        tracing::trace!(fd, "remove channel");
        self.channels.remove(&fd);

        let index = channel.index();
        if index >= 0 {
            let idx = index as usize;
            self.pollfds.swap_remove(idx);
            if idx < self.pollfds.len() {
                // Re-point the slot that swap_remove moved into this hole.
                let moved = self.pollfds[idx].fd;
                let moved_fd = if moved < 0 { ignored_fd(moved) } else { moved };
                if let Some(moved_channel) = self.channels.get(&moved_fd) {
                    moved_channel.set_index(idx as i32);
                }
            }
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|found| Arc::ptr_eq(found, channel))
    }
}
