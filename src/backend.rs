// src/backend.rs

//! The planar display backend: head ownership, the flush engine, the
//! activation state machine, and the `open → query → map` lifecycle.
//!
//! The backend owns exactly one [`Head`]. Pixels are drawn into the head's
//! true-color shadow surface; [`PlanarBackend::flush_head`] walks the
//! surface's damage region, quantizes the touched pixels through the head's
//! palette, and commits the resulting per-slot bitmasks to the device with
//! the register protocol. All hardware access is gated on the activation
//! flag, which follows the foreground virtual console.

use crate::console::Console;
use crate::events::{EventLoop, FdEvent, Watch};
use crate::geometry::Rectangle;
use crate::input::{InputHandler, InputSource};
use crate::os::fbdev::{
    FrameBufferDevice, ScreenInfo, FB_AUX_VGA_PLANES_VGA4, FB_TYPE_VGA_PLANES,
    FB_VISUAL_PSEUDOCOLOR,
};
use crate::palette::{Palette, PALETTE_SLOTS};
use crate::pixel_buffer::PixelBuffer;
use crate::vga::{PlanarHardware, VgaPlanes};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

#[cfg(test)]
mod tests;

/// The one display surface bound to the device.
pub struct Head {
    area: Rectangle,
    buffer: PixelBuffer,
    mapped_size: usize,
    palette: Palette,
}

impl Head {
    fn new(info: &ScreenInfo, row_stride: usize) -> Self {
        Head {
            area: Rectangle::new(info.xoffset, info.yoffset, info.xres, info.yres),
            buffer: PixelBuffer::new(info.xres, info.yres),
            mapped_size: info.yres as usize * row_stride,
            palette: Palette::new(),
        }
    }

    /// Device-pixel geometry reported by the device query.
    pub fn area(&self) -> Rectangle {
        self.area
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }
}

/// The exact framebuffer contract this backend drives: a planar VGA
/// controller in its 4-plane arrangement, pseudocolor visual, 4 bits per
/// pixel. Anything else belongs to a different backend.
fn screen_info_is_planar(info: &ScreenInfo) -> bool {
    info.controller_type == FB_TYPE_VGA_PLANES
        && info.controller_type_aux == FB_AUX_VGA_PLANES_VGA4
        && info.visual == FB_VISUAL_PSEUDOCOLOR
        && info.bits_per_pixel == 4
}

pub struct PlanarBackend<C: Console> {
    device_path: PathBuf,
    device: Option<FrameBufferDevice>,
    console: C,
    head: Option<Head>,
    row_stride: usize,
    hardware: Option<Box<dyn PlanarHardware>>,
    is_active: bool,
    input: InputSource,
    switch_watch: Option<Watch>,
}

impl<C: Console> PlanarBackend<C> {
    pub fn new(device_path: &Path, console: C) -> Self {
        PlanarBackend {
            device_path: device_path.to_path_buf(),
            device: None,
            console,
            head: None,
            row_stride: 0,
            hardware: None,
            is_active: false,
            input: InputSource::new(),
            switch_watch: None,
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    pub fn head_mut(&mut self) -> Option<&mut Head> {
        self.head.as_mut()
    }

    /// Opens the device node and the console, and arms the foreground-VT
    /// watch. On failure everything this step acquired is released; the
    /// caller is expected to give up on this backend rather than retry.
    pub fn open_device(&mut self, events: &mut EventLoop) -> Result<()> {
        let device = FrameBufferDevice::open(&self.device_path)?;

        self.console.open().context("could not open console")?;
        if !self.console.is_vt() {
            self.console.close();
            anyhow::bail!("console is not a virtual terminal");
        }

        let switch_fd = match self.console.watch_switches() {
            Ok(fd) => fd,
            Err(e) => {
                self.console.close();
                return Err(e);
            }
        };
        let switch_watch = match events.watch_fd(switch_fd) {
            Ok(watch) => watch,
            Err(e) => {
                self.console.close();
                return Err(e).context("could not watch for console switches");
            }
        };

        self.switch_watch = Some(switch_watch);
        self.device = Some(device);
        info!("PlanarBackend: opened {}", self.device_path.display());
        Ok(())
    }

    pub fn close_device(&mut self, events: &mut EventLoop) {
        self.input.close(events);
        if let Some(watch) = self.switch_watch.take() {
            if let Err(e) = events.unwatch(watch) {
                warn!("PlanarBackend: could not cancel switch watch: {:#}", e);
            }
        }
        self.console.close();
        self.head = None;
        self.row_stride = 0;
        self.device = None;
        info!("PlanarBackend: closed {}", self.device_path.display());
    }

    /// Reads the device geometry and pixel format, rejecting anything that
    /// is not the planar 4-bit pseudocolor mode, and initializes the head.
    pub fn query_device(&mut self) -> Result<()> {
        let device = self.device.as_ref().context("device is not open")?;
        let info = device.query()?;

        if !screen_info_is_planar(&info) {
            anyhow::bail!(
                "{} does not look like a 4-bit planar VGA framebuffer \
                 (type {} aux {} visual {} bpp {})",
                self.device_path.display(),
                info.controller_type,
                info.controller_type_aux,
                info.visual,
                info.bits_per_pixel
            );
        }

        self.row_stride = info.row_stride as usize;
        self.head = Some(Head::new(&info, self.row_stride));
        info!(
            "PlanarBackend: head {}x{}+{}+{}, row stride {}",
            info.xres, info.yres, info.xoffset, info.yoffset, self.row_stride
        );
        Ok(())
    }

    /// Acquires register access and maps the device memory. If the console
    /// is already in the foreground the head is repainted immediately;
    /// otherwise a switch to it is requested and the repaint happens when
    /// the switch notification arrives.
    pub fn map_to_device(&mut self) -> Result<()> {
        let device = self.device.as_ref().context("device is not open")?;
        let head = self.head.as_ref().context("device geometry was not queried")?;

        let planes = VgaPlanes::map(device, head.mapped_size)?;
        self.hardware = Some(Box::new(planes));

        if self.console.is_active() {
            self.activate();
        } else {
            self.console
                .activate()
                .context("could not request console activation")?;
        }
        Ok(())
    }

    pub fn unmap_from_device(&mut self) {
        if self.hardware.take().is_some() {
            debug!("PlanarBackend: unmapped device memory");
        }
    }

    /// The display is ours: repaint everything. Safe to call again while
    /// already active.
    pub fn activate(&mut self) {
        self.is_active = true;
        info!("PlanarBackend: display active");
        if self.hardware.is_some() {
            self.redraw();
        }
    }

    /// Another console took the display; all hardware writes stop until
    /// reactivation.
    pub fn deactivate(&mut self) {
        self.is_active = false;
        info!("PlanarBackend: display inactive");
    }

    /// Marks the entire head area damaged and flushes, so a repaint covers
    /// the full surface rather than whatever damage was already pending.
    pub fn redraw(&mut self) {
        if let Some(head) = self.head.as_mut() {
            let area = head.buffer.area();
            head.buffer.damage(area);
        }
        self.flush_head();
    }

    fn on_console_switch(&mut self) -> Result<()> {
        if self.console.process_switch()? {
            self.activate();
        } else {
            self.deactivate();
        }
        Ok(())
    }

    /// Pushes every damaged area of the head's surface to the device.
    ///
    /// A no-op while the display is inactive or the device is unmapped.
    /// While active: console into graphics/raw mode, the baseline register
    /// sequence, an unconditional colormap upload (hardware palette state
    /// survives mode changes only this way), then the per-rectangle mask
    /// walk. The damage region is consumed; nothing is flushed twice.
    pub fn flush_head(&mut self) {
        if !self.is_active {
            return;
        }
        let (head, hardware) = match (self.head.as_mut(), self.hardware.as_mut()) {
            (Some(head), Some(hardware)) => (head, hardware),
            _ => return,
        };

        if let Err(e) = self.console.set_graphics_mode() {
            warn!("PlanarBackend: could not enter graphics mode: {:#}", e);
        }
        if let Err(e) = self.console.set_unbuffered_input() {
            warn!("PlanarBackend: could not unbuffer console input: {:#}", e);
        }

        // Baseline: substitution enabled on all planes, write mode 0, the
        // shared rotate stage back at identity, full-byte bit mask.
        hardware.enable_plane_write_mask(0xff);
        hardware.select_write_mode(0);
        hardware.select_data_rotate(0);
        hardware.select_bit_mask(0xff);

        hardware.upload_color_map(0, head.palette.red(), head.palette.green(), head.palette.blue());

        for area in head.buffer.updated().rectangles() {
            Self::flush_area(head, hardware.as_mut(), self.row_stride, &area);
        }
        head.buffer.clear_updated();
    }

    /// Commits one damaged rectangle, a scanline at a time.
    ///
    /// Each row quantizes its pixels into a 16-slot mask buffer and then
    /// walks the rectangle's byte range per slot. The mask buffer is zeroed
    /// per row, so bits outside `[x1, x2)` in the partial edge bytes stay
    /// clear and the all-zero-byte skip keeps them from ever being written.
    fn flush_area(
        head: &mut Head,
        hardware: &mut dyn PlanarHardware,
        row_stride: usize,
        area: &Rectangle,
    ) {
        let area = area.intersection(&head.buffer.area());
        if area.is_empty() {
            return;
        }

        let mut masks = vec![0u8; row_stride * PALETTE_SLOTS];

        let x1 = area.x as usize;
        let x2 = area.right() as usize;
        // Device writes are byte-at-a-time, so unaligned edges round out to
        // whole bytes. The trailing byte of an aligned right edge holds no
        // marks; it is visited and skipped.
        let last_byte = (x2 / 8).min(row_stride - 1);

        for y in area.y..area.bottom() {
            masks.fill(0);

            for x in area.x..area.right() {
                let pixel = head.buffer.pixel(x, y);
                let red = (pixel >> 16) as u8;
                let green = (pixel >> 8) as u8;
                let blue = pixel as u8;

                let (slot, grew) = head.palette.classify(red, green, blue);
                if grew {
                    // The hardware colormap must never lag the table used
                    // to build masks.
                    hardware.upload_color_map(
                        0,
                        head.palette.red(),
                        head.palette.green(),
                        head.palette.blue(),
                    );
                }

                masks[slot * row_stride + x as usize / 8] |= 0x80 >> (x % 8);
            }

            let row_offset = y as usize * row_stride;
            for slot in 0..PALETTE_SLOTS {
                for byte in x1 / 8..=last_byte {
                    let mask = masks[slot * row_stride + byte];
                    if mask == 0 {
                        continue;
                    }
                    hardware.select_color(slot as u8);
                    hardware.select_bit_mask(mask);
                    hardware.commit_byte(row_offset + byte);
                }
            }
        }
    }

    /// Starts key-byte ingestion from the console input descriptor.
    pub fn open_input_source(&mut self, events: &mut EventLoop) -> Result<()> {
        let fd = self.console.input_fd().context("console is not open")?;
        self.input.open(events, fd)
    }

    pub fn set_input_handler(&mut self, handler: InputHandler) {
        self.input.set_handler(handler);
    }

    pub fn close_input_source(&mut self, events: &mut EventLoop) {
        self.input.close(events);
    }

    /// Routes one polled event to the matching subscription: console-switch
    /// notifications drive the activation state machine, input readiness
    /// feeds the key buffer, and an input hangup re-arms the watch.
    pub fn handle_event(&mut self, events: &mut EventLoop, event: &FdEvent) -> Result<()> {
        if let Some(watch) = self.switch_watch {
            if event.is_for(watch) {
                if event.readable {
                    self.on_console_switch()?;
                }
                return Ok(());
            }
        }

        if let Some(watch) = self.input.watch() {
            if event.is_for(watch) {
                if event.hangup {
                    self.input.on_hangup(events);
                } else if event.readable {
                    self.input.on_readable();
                }
            }
        }
        Ok(())
    }
}
