// src/events.rs

//! Handle-based file-descriptor subscriptions.
//!
//! The backend never owns the event loop; it is handed an [`EventLoop`] and
//! holds an opaque [`Watch`] token per subscription. The loop's owner polls
//! and routes each [`FdEvent`] back to whoever holds the matching token.

use crate::os::epoll::{EpollFlags, EventMonitor};
use anyhow::Result;
use log::trace;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// Opaque registration token returned by [`EventLoop::watch_fd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watch(u64);

/// One readiness report for a watched descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdEvent {
    token: u64,
    pub readable: bool,
    pub hangup: bool,
}

impl FdEvent {
    pub fn is_for(&self, watch: Watch) -> bool {
        self.token == watch.0
    }
}

pub struct EventLoop {
    monitor: EventMonitor,
    next_token: u64,
    watched: HashMap<u64, RawFd>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Ok(EventLoop {
            monitor: EventMonitor::new()?,
            next_token: 1,
            watched: HashMap::new(),
        })
    }

    /// Subscribes to readable-data notification for `fd`. Hangup and error
    /// conditions are always reported; epoll delivers them regardless.
    pub fn watch_fd(&mut self, fd: RawFd) -> Result<Watch> {
        let token = self.next_token;
        self.next_token += 1;
        self.monitor.add(fd, token, EpollFlags::EPOLLIN)?;
        self.watched.insert(token, fd);
        trace!("EventLoop: fd {} registered as watch {}", fd, token);
        Ok(Watch(token))
    }

    /// Cancels a subscription. Unknown or already-cancelled tokens are a
    /// no-op.
    pub fn unwatch(&mut self, watch: Watch) -> Result<()> {
        if let Some(fd) = self.watched.remove(&watch.0) {
            self.monitor.delete(fd)?;
            trace!("EventLoop: watch {} cancelled", watch.0);
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` (`-1` forever) and returns the ready set.
    pub fn poll(&mut self, timeout_ms: isize) -> Result<Vec<FdEvent>> {
        let events = self.monitor.events(timeout_ms)?;
        Ok(events
            .iter()
            .map(|event| {
                let flags = EpollFlags::from_bits_truncate(event.events);
                FdEvent {
                    token: event.u64,
                    readable: flags.contains(EpollFlags::EPOLLIN),
                    hangup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
                }
            })
            .collect())
    }
}
