// src/vga.rs

//! The planar-controller register protocol.
//!
//! [`PlanarHardware`] is the narrow seam between the flush engine and the
//! device: six register operations plus the byte store that fires the
//! color substitution. The real implementation, [`VgaPlanes`], programs the
//! VGA graphics controller and sequencer through I/O ports and owns the
//! mapped framebuffer memory.
//!
//! Writes in this mode do not carry pixel data. The controller's "set/reset"
//! unit replaces every written byte with the bit pattern of a previously
//! selected color index, masked per bit position by the bit-mask register.
//! The store's value is irrelevant to the hardware, but a store that ORs no
//! bit into the target byte triggers nothing, so [`PlanarHardware::commit_byte`]
//! always ORs `0x01`.

use crate::os::fbdev::{self, FrameBufferDevice, MappedMemory};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

/// First I/O port of the VGA register window.
pub const VGA_REGS_BASE: libc::c_ulong = 0x3c0;
/// Length of the VGA register window.
pub const VGA_REGS_LEN: libc::c_ulong = 0x20;

const SEQ_INDEX: u16 = 0x3c4;
const SEQ_DATA: u16 = 0x3c5;
const GC_INDEX: u16 = 0x3ce;
const GC_DATA: u16 = 0x3cf;

const SEQ_MAP_MASK: u8 = 0x02;
const GC_SET_RESET: u8 = 0x00;
const GC_ENABLE_SET_RESET: u8 = 0x01;
const GC_DATA_ROTATE: u8 = 0x03;
const GC_MODE: u8 = 0x05;
const GC_BIT_MASK: u8 = 0x08;

/// Mask selecting every plane.
pub const ALL_PLANES: u8 = 0x0f;

/// Register-level access to a planar display controller.
///
/// Port writes are fire-and-forget; none of the register operations can
/// fail. Ordering matters: a commit only substitutes the color latched by
/// the most recent [`select_color`](PlanarHardware::select_color), through
/// the bits latched by the most recent
/// [`select_bit_mask`](PlanarHardware::select_bit_mask).
pub trait PlanarHardware {
    /// Write-enables the given planes and routes them through the
    /// color-substitution unit.
    fn enable_plane_write_mask(&mut self, planes: u8);

    /// Selects the controller write mode. Mode 0 passes stores through the
    /// per-bit mask and substitution stages.
    fn select_write_mode(&mut self, mode: u8);

    /// Programs the ALU rotate stage. The controller is shared with other
    /// graphics modes, so the flush baseline resets it to identity.
    fn select_data_rotate(&mut self, value: u8);

    /// Latches the palette index substituted on the next masked store.
    fn select_color(&mut self, index: u8);

    /// Latches which of the 8 bit positions the next store modifies; bits
    /// outside the mask keep their current framebuffer value.
    fn select_bit_mask(&mut self, mask: u8);

    /// Replaces a contiguous range of the device colormap. The channel
    /// slices must share one length.
    fn upload_color_map(&mut self, start: u32, red: &[u16], green: &[u16], blue: &[u16]);

    /// Stores into device memory at `offset`, triggering the substitution
    /// for that byte.
    fn commit_byte(&mut self, offset: usize);
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn outb(port: u16, value: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") value,
            options(nomem, nostack, preserves_flags)
        );
    }
}

// Planar VGA framebuffers only exist on x86 machines; elsewhere the port
// writes compile to nothing.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn outb(_port: u16, _value: u8) {}

/// The real controller: I/O-port register writes plus the mapped device
/// memory they operate on.
#[derive(Debug)]
pub struct VgaPlanes {
    memory: MappedMemory,
    cmap_device: File,
}

impl VgaPlanes {
    /// Acquires I/O-port permission for the VGA register window and maps
    /// `size` bytes of device memory. Port permission, once granted, stays
    /// with the process; a failed mapping does not revoke it.
    pub fn map(device: &FrameBufferDevice, size: usize) -> Result<Self> {
        if unsafe { libc::ioperm(VGA_REGS_BASE, VGA_REGS_LEN, 1) } < 0 {
            return Err(io::Error::last_os_error())
                .context("could not obtain permission to write to VGA registers");
        }
        let memory = MappedMemory::map(device.as_raw_fd(), size)
            .context("could not map VGA memory")?;
        let cmap_device = device.try_clone()?;
        debug!(
            "VgaPlanes: mapped {} bytes of {}",
            size,
            device.path().display()
        );
        Ok(VgaPlanes {
            memory,
            cmap_device,
        })
    }

    fn write_sequencer(&mut self, register: u8, value: u8) {
        outb(SEQ_INDEX, register);
        outb(SEQ_DATA, value);
    }

    fn write_graphics(&mut self, register: u8, value: u8) {
        outb(GC_INDEX, register);
        outb(GC_DATA, value);
    }
}

impl PlanarHardware for VgaPlanes {
    fn enable_plane_write_mask(&mut self, planes: u8) {
        self.write_sequencer(SEQ_MAP_MASK, planes);
        self.write_graphics(GC_ENABLE_SET_RESET, planes & ALL_PLANES);
    }

    fn select_write_mode(&mut self, mode: u8) {
        self.write_graphics(GC_MODE, mode);
    }

    fn select_data_rotate(&mut self, value: u8) {
        self.write_graphics(GC_DATA_ROTATE, value);
    }

    fn select_color(&mut self, index: u8) {
        self.write_graphics(GC_SET_RESET, index & ALL_PLANES);
    }

    fn select_bit_mask(&mut self, mask: u8) {
        self.write_graphics(GC_BIT_MASK, mask);
    }

    fn upload_color_map(&mut self, start: u32, red: &[u16], green: &[u16], blue: &[u16]) {
        // A failed upload leaves stale colors on screen until the next
        // flush retries it; nothing to propagate.
        if let Err(e) = fbdev::put_color_map(self.cmap_device.as_raw_fd(), start, red, green, blue)
        {
            warn!("VgaPlanes: colormap upload failed: {:#}", e);
        }
    }

    fn commit_byte(&mut self, offset: usize) {
        if let Err(e) = self.memory.or_byte(offset, 0x01) {
            warn!("VgaPlanes: dropped device store: {:#}", e);
        }
    }
}
