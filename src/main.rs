// src/main.rs

//! Demonstration binary: bring the planar backend up, paint a 16-band color
//! test card, and run the event loop until `q` or Ctrl-C.

use anyhow::Context;
use log::{info, warn};
use planarfb::backend::PlanarBackend;
use planarfb::config::Config;
use planarfb::console::LinuxVt;
use planarfb::events::EventLoop;
use planarfb::geometry::Rectangle;
use planarfb::pixel_buffer::PixelBuffer;
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

/// The classic 16-color VGA palette as ARGB32, one vertical band each.
const TEST_CARD: [u32; 16] = [
    0xff00_0000, 0xff00_00aa, 0xff00_aa00, 0xff00_aaaa,
    0xffaa_0000, 0xffaa_00aa, 0xffaa_5500, 0xffaa_aaaa,
    0xff55_5555, 0xff55_55ff, 0xff55_ff55, 0xff55_ffff,
    0xffff_5555, 0xffff_55ff, 0xffff_ff55, 0xffff_ffff,
];

fn paint_test_card(buffer: &mut PixelBuffer) {
    let band = (buffer.width() / TEST_CARD.len() as u32).max(1);
    for (i, &color) in TEST_CARD.iter().enumerate() {
        buffer.fill(
            Rectangle::new(i as u32 * band, 0, band, buffer.height()),
            color,
        );
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting planarfb...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load_or_default(config_path.as_deref());
    let device_path = config.device.resolve_path();
    info!("Using framebuffer device {}", device_path.display());

    let mut events = EventLoop::new().context("could not create event loop")?;
    let console = LinuxVt::new(&config.console.path);
    let mut backend = PlanarBackend::new(&device_path, console);

    backend
        .open_device(&mut events)
        .context("could not open device")?;
    if let Err(e) = backend.query_device().and_then(|_| backend.map_to_device()) {
        backend.close_device(&mut events);
        return Err(e);
    }

    if let Some(head) = backend.head_mut() {
        paint_test_card(head.buffer_mut());
    }
    backend.flush_head();

    let running = Rc::new(Cell::new(true));
    let quit = Rc::clone(&running);
    backend.set_input_handler(Box::new(move |bytes| {
        if bytes.iter().any(|&b| b == b'q' || b == 0x03) {
            quit.set(false);
        }
    }));
    if let Err(e) = backend.open_input_source(&mut events) {
        warn!("Input is unavailable: {:#}", e);
    }

    info!("Entering event loop; press q to quit");
    while running.get() {
        for event in events.poll(-1).context("event loop poll failed")? {
            backend.handle_event(&mut events, &event)?;
        }
    }

    backend.unmap_from_device();
    backend.close_device(&mut events);
    info!("planarfb exited");

    Ok(())
}
