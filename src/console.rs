// src/console.rs

//! The virtual-console service.
//!
//! [`Console`] is the seam the backend talks through: console identity and
//! activation, graphics/text mode switching, raw input, and foreground-VT
//! change notification. [`LinuxVt`] is the real implementation over the
//! Linux VT ioctls.
//!
//! Switch notification uses the kernel's process-controlled VT handoff:
//! `VT_SETMODE` with `VT_PROCESS` makes the kernel deliver a release signal
//! when another console wants the display and an acquire signal when we get
//! it back. Both signals are blocked and drained through a nonblocking
//! `signalfd`, so they arrive as ordinary readable-fd events on the caller's
//! event loop instead of interrupting arbitrary code.

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use termios::{tcsetattr, Termios, ECHO, ICANON, ISIG, TCSANOW, VMIN, VTIME};

const KDSETMODE: libc::c_ulong = 0x4b3a;
const KD_TEXT: libc::c_int = 0;
const KD_GRAPHICS: libc::c_int = 1;

const VT_SETMODE: libc::c_ulong = 0x5602;
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_RELDISP: libc::c_ulong = 0x5605;
const VT_ACTIVATE: libc::c_ulong = 0x5606;

const VT_AUTO: i8 = 0;
const VT_PROCESS: i8 = 1;
const VT_ACKACQ: libc::c_int = 2;

/// Character device major of the virtual consoles; minors 1..=63 are real
/// VTs, minor 0 is the `/dev/tty0` alias for whichever VT is visible.
const VT_MAJOR: u64 = 4;
const VT_MINOR_MAX: u64 = 63;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VtStat {
    v_active: u16,
    v_signal: u16,
    v_state: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VtMode {
    mode: i8,
    waitv: i8,
    relsig: i16,
    acqsig: i16,
    frsig: i16,
}

nix::ioctl_read_bad!(vt_getstate, VT_GETSTATE, VtStat);
nix::ioctl_write_ptr_bad!(vt_setmode, VT_SETMODE, VtMode);
nix::ioctl_write_int_bad!(vt_activate, VT_ACTIVATE);
nix::ioctl_write_int_bad!(vt_reldisp, VT_RELDISP);
nix::ioctl_write_int_bad!(kdsetmode, KDSETMODE);

/// Console operations the backend depends on.
pub trait Console {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);

    /// Whether the opened device is a real virtual console.
    fn is_vt(&self) -> bool;

    /// Whether this console is the one currently on the physical display.
    fn is_active(&self) -> bool;

    /// Asks the kernel to bring this console to the foreground. The switch
    /// completes asynchronously; the armed switch watch reports it.
    fn activate(&mut self) -> Result<()>;

    fn set_graphics_mode(&mut self) -> Result<()>;
    fn set_text_mode(&mut self) -> Result<()>;

    /// Puts console input into raw, unbuffered mode.
    fn set_unbuffered_input(&mut self) -> Result<()>;
    fn restore_input(&mut self);

    /// Raw descriptor for key input, valid while open.
    fn input_fd(&self) -> Option<RawFd>;

    /// Arms foreground-change notification and returns the descriptor that
    /// becomes readable on every switch toward or away from this console.
    fn watch_switches(&mut self) -> Result<RawFd>;

    /// Drains pending switch notifications, acknowledging each handoff to
    /// the kernel, and returns whether this console is now active.
    fn process_switch(&mut self) -> Result<bool>;
}

/// [`Console`] over a Linux virtual terminal device.
pub struct LinuxVt {
    path: PathBuf,
    file: Option<File>,
    vt_number: Option<u64>,
    original_termios: Option<Termios>,
    switch_signals: Option<SignalFd>,
    in_graphics_mode: bool,
}

impl LinuxVt {
    pub fn new(path: &Path) -> Self {
        LinuxVt {
            path: path.to_path_buf(),
            file: None,
            vt_number: None,
            original_termios: None,
            switch_signals: None,
            in_graphics_mode: false,
        }
    }

    fn fd(&self) -> Result<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .context("console is not open")
    }

    fn vt_minor(file: &File) -> Result<Option<u64>> {
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(file.as_raw_fd(), &mut stat) } == -1 {
            return Err(io::Error::last_os_error()).context("fstat on console device failed");
        }
        let device = stat.st_rdev;
        let (dev_major, dev_minor) = (u64::from(libc::major(device)), u64::from(libc::minor(device)));
        if dev_major == VT_MAJOR && dev_minor <= VT_MINOR_MAX {
            Ok(Some(dev_minor))
        } else {
            Ok(None)
        }
    }

    fn open_node(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("could not open console {}", path.display()))
    }
}

impl Console for LinuxVt {
    fn open(&mut self) -> Result<()> {
        let mut file = Self::open_node(&self.path)?;
        let mut minor = Self::vt_minor(&file)?;

        // /dev/tty0 aliases whichever VT is visible right now; resolve it
        // to the concrete /dev/ttyN so activation tracking compares against
        // a fixed console.
        if minor == Some(0) {
            let mut state = VtStat {
                v_active: 0,
                v_signal: 0,
                v_state: 0,
            };
            unsafe { vt_getstate(file.as_raw_fd(), &mut state) }
                .context("VT_GETSTATE failed while resolving /dev/tty0")?;
            let resolved = PathBuf::from(format!("/dev/tty{}", state.v_active));
            debug!(
                "LinuxVt: {} resolved to {}",
                self.path.display(),
                resolved.display()
            );
            file = Self::open_node(&resolved)?;
            self.path = resolved;
            minor = Self::vt_minor(&file)?;
        }

        self.vt_number = minor.filter(|&m| m > 0);
        self.file = Some(file);
        info!(
            "LinuxVt: opened {} (vt {:?})",
            self.path.display(),
            self.vt_number
        );
        Ok(())
    }

    fn close(&mut self) {
        if self.file.is_none() {
            return;
        }
        self.restore_input();
        if let Err(e) = self.set_text_mode() {
            warn!("LinuxVt: could not restore text mode: {:#}", e);
        }
        if let Ok(fd) = self.fd() {
            let auto = VtMode {
                mode: VT_AUTO,
                waitv: 0,
                relsig: 0,
                acqsig: 0,
                frsig: 0,
            };
            if let Err(e) = unsafe { vt_setmode(fd, &auto) } {
                warn!("LinuxVt: could not return VT to auto switching: {}", e);
            }
        }
        if self.switch_signals.take().is_some() {
            let mut mask = SigSet::empty();
            mask.add(Signal::SIGUSR1);
            mask.add(Signal::SIGUSR2);
            if let Err(e) = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None) {
                warn!("LinuxVt: could not unblock switch signals: {}", e);
            }
        }
        self.file = None;
        self.vt_number = None;
        info!("LinuxVt: closed {}", self.path.display());
    }

    fn is_vt(&self) -> bool {
        self.vt_number.is_some()
    }

    fn is_active(&self) -> bool {
        let (fd, vt) = match (self.fd(), self.vt_number) {
            (Ok(fd), Some(vt)) => (fd, vt),
            _ => return false,
        };
        let mut state = VtStat {
            v_active: 0,
            v_signal: 0,
            v_state: 0,
        };
        match unsafe { vt_getstate(fd, &mut state) } {
            Ok(_) => u64::from(state.v_active) == vt,
            Err(e) => {
                warn!("LinuxVt: VT_GETSTATE failed: {}", e);
                false
            }
        }
    }

    fn activate(&mut self) -> Result<()> {
        let vt = self.vt_number.context("not a virtual console")?;
        let fd = self.fd()?;
        unsafe { vt_activate(fd, vt as libc::c_int) }
            .with_context(|| format!("VT_ACTIVATE({}) failed", vt))?;
        debug!("LinuxVt: requested switch to vt {}", vt);
        Ok(())
    }

    fn set_graphics_mode(&mut self) -> Result<()> {
        if self.in_graphics_mode {
            return Ok(());
        }
        let fd = self.fd()?;
        unsafe { kdsetmode(fd, KD_GRAPHICS) }.context("KDSETMODE(KD_GRAPHICS) failed")?;
        self.in_graphics_mode = true;
        debug!("LinuxVt: console in graphics mode");
        Ok(())
    }

    fn set_text_mode(&mut self) -> Result<()> {
        if !self.in_graphics_mode {
            return Ok(());
        }
        let fd = self.fd()?;
        unsafe { kdsetmode(fd, KD_TEXT) }.context("KDSETMODE(KD_TEXT) failed")?;
        self.in_graphics_mode = false;
        debug!("LinuxVt: console in text mode");
        Ok(())
    }

    fn set_unbuffered_input(&mut self) -> Result<()> {
        if self.original_termios.is_some() {
            return Ok(());
        }
        let fd = self.fd()?;
        let original = Termios::from_fd(fd).context("could not read console termios")?;
        let mut raw = original;
        raw.c_lflag &= !(ECHO | ICANON | ISIG);
        raw.c_iflag &= !(libc::IXON | libc::IXOFF | libc::ICRNL | libc::INLCR | libc::IGNCR);
        raw.c_cc[VMIN] = 0;
        raw.c_cc[VTIME] = 0;
        tcsetattr(fd, TCSANOW, &raw).context("could not set console input to raw mode")?;
        self.original_termios = Some(original);
        debug!("LinuxVt: console input unbuffered");
        Ok(())
    }

    fn restore_input(&mut self) {
        if let (Some(original), Ok(fd)) = (self.original_termios.take(), self.fd()) {
            if let Err(e) = tcsetattr(fd, TCSANOW, &original) {
                warn!("LinuxVt: could not restore console termios: {}", e);
            }
        }
    }

    fn input_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    fn watch_switches(&mut self) -> Result<RawFd> {
        let fd = self.fd()?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGUSR1);
        mask.add(Signal::SIGUSR2);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .context("could not block VT switch signals")?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("could not create signalfd for VT switches")?;

        let mode = VtMode {
            mode: VT_PROCESS,
            waitv: 0,
            relsig: libc::SIGUSR1 as i16,
            acqsig: libc::SIGUSR2 as i16,
            frsig: 0,
        };
        unsafe { vt_setmode(fd, &mode) }.context("VT_SETMODE(VT_PROCESS) failed")?;

        let raw = signals.as_raw_fd();
        self.switch_signals = Some(signals);
        debug!("LinuxVt: watching for VT switches on signalfd {}", raw);
        Ok(raw)
    }

    fn process_switch(&mut self) -> Result<bool> {
        let fd = self.fd()?;
        let signals = self
            .switch_signals
            .as_mut()
            .context("switch watch is not armed")?;

        let mut seen: Option<bool> = None;
        loop {
            match signals.read_signal() {
                Ok(Some(info)) if info.ssi_signo == libc::SIGUSR1 as u32 => {
                    // The display is being taken away; the kernel blocks the
                    // switch until we acknowledge the release.
                    if let Err(e) = unsafe { vt_reldisp(fd, 1) } {
                        warn!("LinuxVt: VT_RELDISP(release) failed: {}", e);
                    }
                    trace!("LinuxVt: released the display");
                    seen = Some(false);
                }
                Ok(Some(info)) if info.ssi_signo == libc::SIGUSR2 as u32 => {
                    if let Err(e) = unsafe { vt_reldisp(fd, VT_ACKACQ) } {
                        warn!("LinuxVt: VT_RELDISP(ack acquire) failed: {}", e);
                    }
                    trace!("LinuxVt: acquired the display");
                    seen = Some(true);
                }
                Ok(Some(info)) => {
                    warn!("LinuxVt: unexpected signal {} on switch fd", info.ssi_signo);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("LinuxVt: reading switch signalfd failed: {}", e);
                    break;
                }
            }
        }

        Ok(seen.unwrap_or_else(|| self.is_active()))
    }
}

impl Drop for LinuxVt {
    fn drop(&mut self) {
        self.close();
    }
}
