// src/backend/tests.rs

use super::*;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use test_log::test;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegisterOp {
    PlaneWriteMask(u8),
    WriteMode(u8),
    DataRotate(u8),
    Color(u8),
    BitMask(u8),
    /// Number of colormap entries uploaded.
    ColorMap(usize),
    /// Device byte offset of a substitution store.
    Commit(usize),
}

/// Records the register stream and simulates the set/reset unit: each
/// committed bit remembers the color latched at commit time, keyed by
/// `(device byte offset, MSB-first bit position)`.
#[derive(Default)]
struct HardwareState {
    ops: Vec<RegisterOp>,
    color: u8,
    bit_mask: u8,
    written: HashMap<(usize, u32), u8>,
}

impl HardwareState {
    fn commits(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, RegisterOp::Commit(_)))
            .count()
    }
}

struct MockHardware(Rc<RefCell<HardwareState>>);

impl PlanarHardware for MockHardware {
    fn enable_plane_write_mask(&mut self, planes: u8) {
        self.0.borrow_mut().ops.push(RegisterOp::PlaneWriteMask(planes));
    }

    fn select_write_mode(&mut self, mode: u8) {
        self.0.borrow_mut().ops.push(RegisterOp::WriteMode(mode));
    }

    fn select_data_rotate(&mut self, value: u8) {
        self.0.borrow_mut().ops.push(RegisterOp::DataRotate(value));
    }

    fn select_color(&mut self, index: u8) {
        let mut state = self.0.borrow_mut();
        state.color = index;
        state.ops.push(RegisterOp::Color(index));
    }

    fn select_bit_mask(&mut self, mask: u8) {
        let mut state = self.0.borrow_mut();
        state.bit_mask = mask;
        state.ops.push(RegisterOp::BitMask(mask));
    }

    fn upload_color_map(&mut self, _start: u32, red: &[u16], _green: &[u16], _blue: &[u16]) {
        self.0.borrow_mut().ops.push(RegisterOp::ColorMap(red.len()));
    }

    fn commit_byte(&mut self, offset: usize) {
        let mut state = self.0.borrow_mut();
        let (color, bit_mask) = (state.color, state.bit_mask);
        for bit in 0..8 {
            if bit_mask & (0x80 >> bit) != 0 {
                state.written.insert((offset, bit), color);
            }
        }
        state.ops.push(RegisterOp::Commit(offset));
    }
}

struct MockConsole {
    active: Rc<Cell<bool>>,
    graphics_calls: Rc<Cell<usize>>,
    activation_requests: Rc<Cell<usize>>,
}

impl Console for MockConsole {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn is_vt(&self) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn activate(&mut self) -> Result<()> {
        self.activation_requests.set(self.activation_requests.get() + 1);
        Ok(())
    }

    fn set_graphics_mode(&mut self) -> Result<()> {
        self.graphics_calls.set(self.graphics_calls.get() + 1);
        Ok(())
    }

    fn set_text_mode(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_unbuffered_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn restore_input(&mut self) {}

    fn input_fd(&self) -> Option<RawFd> {
        None
    }

    fn watch_switches(&mut self) -> Result<RawFd> {
        anyhow::bail!("mock console has no switch descriptor")
    }

    fn process_switch(&mut self) -> Result<bool> {
        Ok(self.active.get())
    }
}

struct Fixture {
    backend: PlanarBackend<MockConsole>,
    hardware: Rc<RefCell<HardwareState>>,
    console_active: Rc<Cell<bool>>,
    graphics_calls: Rc<Cell<usize>>,
}

fn planar_info(width: u32, height: u32, row_stride: u32) -> ScreenInfo {
    ScreenInfo {
        controller_type: FB_TYPE_VGA_PLANES,
        controller_type_aux: FB_AUX_VGA_PLANES_VGA4,
        visual: FB_VISUAL_PSEUDOCOLOR,
        bits_per_pixel: 4,
        xoffset: 0,
        yoffset: 0,
        xres: width,
        yres: height,
        row_stride,
    }
}

/// A backend in the mapped state, with mock hardware in place of the real
/// register file and device memory.
fn mapped_backend(width: u32, height: u32, row_stride: usize, active: bool) -> Fixture {
    let console_active = Rc::new(Cell::new(active));
    let graphics_calls = Rc::new(Cell::new(0));
    let console = MockConsole {
        active: Rc::clone(&console_active),
        graphics_calls: Rc::clone(&graphics_calls),
        activation_requests: Rc::new(Cell::new(0)),
    };

    let mut backend = PlanarBackend::new(Path::new("/dev/fb-mock"), console);
    backend.row_stride = row_stride;
    backend.head = Some(Head::new(&planar_info(width, height, row_stride as u32), row_stride));

    let hardware = Rc::new(RefCell::new(HardwareState::default()));
    backend.hardware = Some(Box::new(MockHardware(Rc::clone(&hardware))));
    backend.is_active = active;

    Fixture {
        backend,
        hardware,
        console_active,
        graphics_calls,
    }
}

/// 16 colors pairwise distinct in the top two bits of red/green, so each
/// claims its own palette slot at the coarse matching level.
fn coarse_color(i: usize) -> u32 {
    let red = ((i % 4) as u32) << 6;
    let green = ((i / 4) as u32) << 6;
    0xff00_0000 | (red << 16) | (green << 8)
}

#[test]
fn inactive_flush_performs_no_writes_and_keeps_damage() {
    let mut fixture = mapped_backend(16, 2, 4, false);

    fixture.backend.flush_head();

    assert!(fixture.hardware.borrow().ops.is_empty());
    assert_eq!(fixture.graphics_calls.get(), 0);
    let head = fixture.backend.head().expect("head");
    assert!(!head.buffer().updated().is_empty());
}

#[test]
fn flush_consumes_damage_and_repeating_it_commits_nothing() {
    let mut fixture = mapped_backend(16, 2, 4, true);

    fixture.backend.flush_head();
    let after_first = fixture.hardware.borrow().ops.len();
    assert!(fixture.hardware.borrow().commits() > 0);
    assert!(fixture.backend.head().expect("head").buffer().updated().is_empty());

    fixture.backend.flush_head();
    let state = fixture.hardware.borrow();
    let second_flush = &state.ops[after_first..];
    assert!(
        !second_flush.iter().any(|op| matches!(op, RegisterOp::Commit(_))),
        "second flush committed plane writes: {:?}",
        second_flush
    );
}

#[test]
fn flush_enters_graphics_mode_and_resets_registers_first() {
    let mut fixture = mapped_backend(16, 1, 2, true);

    fixture.backend.flush_head();

    assert!(fixture.graphics_calls.get() >= 1);
    let state = fixture.hardware.borrow();
    assert_eq!(
        &state.ops[..5],
        &[
            RegisterOp::PlaneWriteMask(0xff),
            RegisterOp::WriteMode(0),
            RegisterOp::DataRotate(0),
            RegisterOp::BitMask(0xff),
            RegisterOp::ColorMap(0),
        ]
    );
}

#[test]
fn solid_rectangle_touches_exactly_one_slot() {
    let mut fixture = mapped_backend(16, 2, 4, true);

    fixture.backend.flush_head();

    let head = fixture.backend.head().expect("head");
    assert_eq!(head.palette().len(), 1);
    let state = fixture.hardware.borrow();
    assert!(state.commits() > 0);
    assert!(state.written.values().all(|&slot| slot == 0));
}

#[test]
fn sixteen_columns_reconstruct_their_slots() {
    let mut fixture = mapped_backend(16, 1, 2, true);
    {
        let buffer = fixture.backend.head_mut().expect("head").buffer_mut();
        for x in 0..16 {
            buffer.set_pixel(x, 0, coarse_color(x as usize));
        }
    }

    fixture.backend.flush_head();

    assert_eq!(fixture.backend.head().expect("head").palette().len(), 16);

    let state = fixture.hardware.borrow();

    // Every commit went through a single-bit mask.
    let mut last_mask = 0u8;
    for op in &state.ops {
        match op {
            RegisterOp::BitMask(mask) => last_mask = *mask,
            RegisterOp::Commit(_) => assert_eq!(last_mask.count_ones(), 1),
            _ => {}
        }
    }

    // The bits across all slots reconstruct the column-to-slot mapping:
    // column x was classified in scan order, so it owns slot x.
    assert_eq!(state.written.len(), 16);
    for x in 0..16usize {
        let slot = state.written[&(x / 8, (x % 8) as u32)];
        assert_eq!(slot as usize, x, "column {} landed in slot {}", x, slot);
    }
}

#[test]
fn unaligned_damage_rounds_to_bytes_without_spill() {
    let mut fixture = mapped_backend(16, 1, 2, true);
    {
        let buffer = fixture.backend.head_mut().expect("head").buffer_mut();
        buffer.fill(Rectangle::new(0, 0, 16, 1), 0xffff_ffff);
        buffer.clear_updated();
        buffer.damage(Rectangle::new(3, 0, 7, 1));
    }

    fixture.backend.flush_head();

    let state = fixture.hardware.borrow();
    let mut columns: Vec<usize> = state
        .written
        .keys()
        .map(|&(offset, bit)| offset * 8 + bit as usize)
        .collect();
    columns.sort_unstable();
    assert_eq!(columns, (3..10).collect::<Vec<_>>());

    let masks: Vec<u8> = state
        .ops
        .iter()
        .zip(state.ops.iter().skip(1))
        .filter_map(|(op, next)| match (op, next) {
            (RegisterOp::BitMask(mask), RegisterOp::Commit(_)) => Some(*mask),
            _ => None,
        })
        .collect();
    assert_eq!(masks, vec![0x1f, 0xc0]);
}

#[test]
fn palette_growth_uploads_colormap_immediately() {
    let mut fixture = mapped_backend(16, 1, 2, true);
    {
        let buffer = fixture.backend.head_mut().expect("head").buffer_mut();
        buffer.fill(Rectangle::new(0, 0, 8, 1), coarse_color(1));
        buffer.fill(Rectangle::new(8, 0, 8, 1), coarse_color(2));
    }

    fixture.backend.flush_head();

    let state = fixture.hardware.borrow();
    let uploads: Vec<usize> = state
        .ops
        .iter()
        .filter_map(|op| match op {
            RegisterOp::ColorMap(len) => Some(*len),
            _ => None,
        })
        .collect();
    // The unconditional baseline upload, then one per allocated slot.
    assert_eq!(uploads, vec![0, 1, 2]);

    let first_commit = state
        .ops
        .iter()
        .position(|op| matches!(op, RegisterOp::Commit(_)))
        .expect("no commits recorded");
    let last_upload = state
        .ops
        .iter()
        .rposition(|op| matches!(op, RegisterOp::ColorMap(_)))
        .expect("no uploads recorded");
    assert!(last_upload < first_commit);
}

#[test]
fn activation_marks_full_area_before_flush() {
    let mut fixture = mapped_backend(16, 1, 2, false);
    {
        let buffer = fixture.backend.head_mut().expect("head").buffer_mut();
        buffer.clear_updated();
        buffer.damage(Rectangle::new(4, 0, 2, 1));
    }

    fixture.console_active.set(true);
    fixture.backend.activate();

    assert!(fixture.backend.is_active());
    let state = fixture.hardware.borrow();
    let columns: std::collections::HashSet<usize> = state
        .written
        .keys()
        .map(|&(offset, bit)| offset * 8 + bit as usize)
        .collect();
    assert_eq!(columns.len(), 16, "repaint covered {:?}", columns);
}

#[test]
fn console_switch_events_drive_activation() {
    let mut fixture = mapped_backend(16, 1, 2, false);
    let mut events = EventLoop::new().expect("event loop");
    let (mut writer, reader) = UnixStream::pair().expect("socketpair");
    let watch = events.watch_fd(reader.as_raw_fd()).expect("watch");
    fixture.backend.switch_watch = Some(watch);

    fixture.console_active.set(true);
    writer.write_all(b"s").expect("write");
    for event in events.poll(1000).expect("poll") {
        fixture.backend.handle_event(&mut events, &event).expect("handle");
    }
    assert!(fixture.backend.is_active());
    assert!(fixture.hardware.borrow().commits() > 0, "activation did not repaint");

    fixture.console_active.set(false);
    writer.write_all(b"s").expect("write");
    for event in events.poll(1000).expect("poll") {
        fixture.backend.handle_event(&mut events, &event).expect("handle");
    }
    assert!(!fixture.backend.is_active());
}

#[test]
fn head_geometry_follows_the_screen_info() {
    let mut info = planar_info(640, 480, 80);
    info.xoffset = 8;
    info.yoffset = 16;

    let head = Head::new(&info, 80);
    assert_eq!(head.area(), Rectangle::new(8, 16, 640, 480));
    assert_eq!(head.buffer().width(), 640);
    assert_eq!(head.buffer().height(), 480);
    assert_eq!(head.mapped_size, 480 * 80);
    assert!(head.palette().is_empty());
}

#[test]
fn only_the_exact_planar_mode_is_accepted() {
    let good = planar_info(640, 480, 80);
    assert!(screen_info_is_planar(&good));

    let mut wrong_type = good;
    wrong_type.controller_type = 0;
    assert!(!screen_info_is_planar(&wrong_type));

    let mut wrong_aux = good;
    wrong_aux.controller_type_aux = 1;
    assert!(!screen_info_is_planar(&wrong_aux));

    let mut wrong_visual = good;
    wrong_visual.visual = 2;
    assert!(!screen_info_is_planar(&wrong_visual));

    let mut wrong_depth = good;
    wrong_depth.bits_per_pixel = 8;
    assert!(!screen_info_is_planar(&wrong_depth));
}
