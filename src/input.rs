// src/input.rs

//! Raw key-byte ingestion from the console input descriptor.
//!
//! Bytes are accumulated and handed to a registered handler as they arrive;
//! interpretation belongs to the handler. A hangup on the descriptor is
//! treated as transient and the watch is simply re-opened.

use crate::events::{EventLoop, Watch};
use anyhow::{Context, Result};
use log::{debug, trace, warn};
use std::io;
use std::os::unix::io::RawFd;

/// Called with the accumulated key bytes after each read; the buffer is
/// cleared once the handler returns.
pub type InputHandler = Box<dyn FnMut(&[u8])>;

pub struct InputSource {
    fd: Option<RawFd>,
    watch: Option<Watch>,
    key_buffer: Vec<u8>,
    handler: Option<InputHandler>,
}

impl InputSource {
    pub fn new() -> Self {
        InputSource {
            fd: None,
            watch: None,
            key_buffer: Vec::new(),
            handler: None,
        }
    }

    pub fn set_handler(&mut self, handler: InputHandler) {
        self.handler = Some(handler);
    }

    pub fn watch(&self) -> Option<Watch> {
        self.watch
    }

    /// Starts watching `fd` for readable data.
    pub fn open(&mut self, events: &mut EventLoop, fd: RawFd) -> Result<()> {
        let watch = events
            .watch_fd(fd)
            .context("could not watch console input descriptor")?;
        self.fd = Some(fd);
        self.watch = Some(watch);
        debug!("InputSource: watching fd {}", fd);
        Ok(())
    }

    pub fn close(&mut self, events: &mut EventLoop) {
        if let Some(watch) = self.watch.take() {
            if let Err(e) = events.unwatch(watch) {
                warn!("InputSource: could not cancel input watch: {:#}", e);
            }
        }
        self.fd = None;
    }

    /// Drains the descriptor into the key buffer and forwards the
    /// accumulated bytes to the handler.
    pub fn on_readable(&mut self) {
        let fd = match self.fd {
            Some(fd) => fd,
            None => return,
        };

        let mut chunk = [0u8; 128];
        loop {
            let read = unsafe {
                libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
            };
            match read {
                n if n > 0 => self.key_buffer.extend_from_slice(&chunk[..n as usize]),
                0 => break,
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::WouldBlock
                        && err.kind() != io::ErrorKind::Interrupted
                    {
                        warn!("InputSource: read on fd {} failed: {}", fd, err);
                    }
                    break;
                }
            }
        }

        if self.key_buffer.is_empty() {
            return;
        }
        trace!("InputSource: {} key byte(s) buffered", self.key_buffer.len());
        if let Some(handler) = self.handler.as_mut() {
            handler(&self.key_buffer);
            self.key_buffer.clear();
        }
    }

    /// The descriptor went away under us. Treated as transient: drop the
    /// dead watch and register a fresh one.
    pub fn on_hangup(&mut self, events: &mut EventLoop) {
        debug!("InputSource: input descriptor disconnected, reopening watch");
        let fd = match self.fd {
            Some(fd) => fd,
            None => return,
        };
        if let Some(watch) = self.watch.take() {
            let _ = events.unwatch(watch);
        }
        match events.watch_fd(fd) {
            Ok(watch) => self.watch = Some(watch),
            Err(e) => warn!("InputSource: could not reopen input watch: {:#}", e),
        }
    }
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::new()
    }
}
