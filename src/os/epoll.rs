// src/os/epoll.rs

//! Raw `libc` wrapper around an epoll instance.
//!
//! [`EventMonitor`] owns the epoll file descriptor and a fixed event buffer;
//! registered descriptors carry a caller-chosen `u64` token that comes back
//! in each readiness report.

use anyhow::{Context, Result};
use bitflags::bitflags;
use log::{debug, trace, warn};
use std::io;
use std::os::unix::io::RawFd;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EpollFlags: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
    }
}

const EVENT_BUFFER_SIZE: usize = 8;

#[derive(Debug)]
pub struct EventMonitor {
    epoll_fd: RawFd,
    event_buffer: [libc::epoll_event; EVENT_BUFFER_SIZE],
}

impl EventMonitor {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error()).context("epoll_create1 failed");
        }
        debug!("EventMonitor: created epoll_fd {}", epoll_fd);
        Ok(Self {
            epoll_fd,
            event_buffer: [libc::epoll_event { events: 0, u64: 0 }; EVENT_BUFFER_SIZE],
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, flags: EpollFlags) -> Result<()> {
        let mut event = libc::epoll_event {
            events: flags.bits(),
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to add fd {} to epoll (token {})", fd, token));
        }
        trace!(
            "EventMonitor: watching fd {} with token {} and flags {:?}",
            fd, token, flags
        );
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to delete fd {} from epoll", fd));
        }
        trace!("EventMonitor: stopped watching fd {}", fd);
        Ok(())
    }

    /// Blocks for up to `timeout_ms` (`-1` blocks indefinitely) and returns
    /// the ready events. An `EINTR` wakeup reports no events rather than an
    /// error.
    pub fn events(&mut self, timeout_ms: isize) -> Result<&[libc::epoll_event]> {
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.event_buffer.as_mut_ptr(),
                EVENT_BUFFER_SIZE as libc::c_int,
                timeout_ms as libc::c_int,
            )
        };

        if num_events == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("EventMonitor: epoll_wait interrupted, no events");
                return Ok(&self.event_buffer[0..0]);
            }
            return Err(err).context("epoll_wait failed");
        }

        trace!("EventMonitor: {} event(s) ready", num_events);
        Ok(&self.event_buffer[0..num_events as usize])
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epoll_fd) } == -1 {
            warn!(
                "EventMonitor: failed to close epoll_fd {}: {}",
                self.epoll_fd,
                io::Error::last_os_error()
            );
        }
    }
}
