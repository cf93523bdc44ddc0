//! Readiness backends.
//!
//! The loop talks to its backend through the small [`Poller`] trait; the
//! primary backend wraps epoll in level-triggered mode, with a poll(2)
//! fallback forced by setting `MULTIO_USE_POLL` to any non-empty value.

mod epoll;
mod poll;

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use crate::channel::Channel;

pub(crate) type ChannelList = Vec<Arc<Channel>>;

pub(crate) trait Poller {
    /// Block up to `timeout_ms`, push every channel with a non-empty ready
    /// mask onto `active_channels` (setting each channel's returned events),
    /// and report the wall-clock time observed just after wake.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut ChannelList) -> SystemTime;

    /// Sync the kernel interest set with `channel`'s interest mask.
    /// Idempotent: registers new channels, modifies known ones, unregisters
    /// when the interest mask has become empty.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Drop the channel from the backend and the fd map.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

/// Environment variable forcing the poll(2) backend.
const USE_POLL_ENV: &str = "MULTIO_USE_POLL";

pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    match std::env::var_os(USE_POLL_ENV) {
        Some(v) if !v.is_empty() => {
            tracing::debug!("{} set, using poll(2) backend", USE_POLL_ENV);
            Ok(Box::new(poll::PollPoller::new()))
        }
        _ => Ok(Box::new(epoll::EpollPoller::new()?)),
    }
}
