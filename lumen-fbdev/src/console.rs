//! Virtual console ownership.
//!
//! Picks a free console, makes it the controlling terminal and, once
//! [`VirtualConsole::enter_graphics`] succeeds, hands console switching over
//! to the process through a signal. [`VirtualConsole::restore`] undoes all of
//! it and runs at most once; dropping the console restores and closes it.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{DeviceError, Result};
use crate::os::{
    raw_termios, DeviceOs, OpenMode, SignalHandler, VtMode, KD_GRAPHICS, KD_TEXT, K_MEDIUMRAW,
    K_XLATE, MAX_QUERYABLE_VT, VT_ACKACQ, VT_AUTO, VT_PROCESS, VT_RELEASE,
};

const CONTROL_PATHS: [&str; 2] = ["/dev/tty0", "/dev/vc/0"];

/// Console state saved before switching to graphics, restored on teardown.
struct SavedConsoleMode {
    signal: i32,
    termios: libc::termios,
    kb_mode: libc::c_int,
}

pub struct VirtualConsole<O: DeviceOs> {
    os: Arc<O>,
    fd: RawFd,
    number: i32,
    previous: i32,
    graphics: Option<SavedConsoleMode>,
    restored: bool,
}

impl<O: DeviceOs> VirtualConsole<O> {
    /// Allocate a console. `wanted` is honoured when it names a free console
    /// in `1..=31`; otherwise the kernel picks the first free one.
    pub fn acquire(os: Arc<O>, wanted: Option<i32>) -> Result<Self> {
        let control = CONTROL_PATHS
            .iter()
            .find_map(|path| match os.open(path, OpenMode::WriteOnly) {
                Ok(fd) => Some(fd),
                Err(e) => {
                    debug!(path, error = %e, "Console control device unavailable");
                    None
                }
            })
            .ok_or_else(|| {
                DeviceError::ConsoleUnavailable("cannot open /dev/tty0 or /dev/vc/0".into())
            })?;

        let picked = Self::pick_console(&*os, control, wanted);
        os.close(control);
        let (number, previous) = picked?;

        os.detach_controlling_tty();

        let paths = [format!("/dev/tty{number}"), format!("/dev/vc/{number}")];
        let mut last_error = None;
        let mut fd = None;
        for path in &paths {
            match os.open(path, OpenMode::ReadWriteNonBlocking) {
                Ok(opened) => {
                    fd = Some(opened);
                    break;
                }
                Err(e) => last_error = Some((path.clone(), e)),
            }
        }
        let fd = match (fd, last_error) {
            (Some(fd), _) => fd,
            (None, Some((path, source))) => {
                return Err(DeviceError::DeviceUnavailable { path, source })
            }
            (None, None) => return Err(DeviceError::ConsoleUnavailable(format!("tty{number}"))),
        };

        if let Err(e) = os.set_controlling_tty(fd) {
            debug!(vt = number, error = %e, "TIOCSCTTY failed");
        }
        if let Err(e) = os.kb_set_mode(fd, K_XLATE) {
            debug!(vt = number, error = %e, "Failed to reset keyboard mode");
        }

        info!(vt = number, previous, "Virtual console acquired");
        Ok(Self {
            os,
            fd,
            number,
            previous,
            graphics: None,
            restored: false,
        })
    }

    fn pick_console(os: &O, control: RawFd, wanted: Option<i32>) -> Result<(i32, i32)> {
        let state = os
            .vt_get_state(control)
            .map_err(|e| DeviceError::control("VT_GETSTATE", e))?;
        let previous = state.v_active as i32;
        debug!(previous, "Current foreground console");

        let wanted = wanted.filter(|&n| (1..=MAX_QUERYABLE_VT).contains(&n));
        let wanted = match wanted {
            Some(n) if state.is_busy(n) => {
                warn!(vt = n, "Requested console is busy");
                None
            }
            other => other,
        };

        let number = match wanted {
            Some(n) => n,
            None => os.vt_open_query(control).map_err(|e| {
                DeviceError::ConsoleUnavailable(format!("no free virtual console: {e}"))
            })?,
        };
        Ok((number, previous))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    /// Console that was in the foreground before acquisition.
    pub fn previous(&self) -> i32 {
        self.previous
    }

    /// Take over console switching with `signal`, switch the keyboard to raw
    /// scan codes and the display to graphics mode.
    pub fn enter_graphics(&mut self, signal: i32, handler: SignalHandler) -> Result<()> {
        let os = &*self.os;
        let mut mode = os
            .vt_get_mode(self.fd)
            .map_err(|e| DeviceError::control("VT_GETMODE", e))?;
        mode.mode = VT_PROCESS;
        mode.relsig = signal as libc::c_short;
        mode.acqsig = signal as libc::c_short;

        os.install_switch_handler(signal, handler)
            .map_err(|e| DeviceError::control("sigaction", e))?;

        if let Err(e) = os.vt_set_mode(self.fd, &mode) {
            os.restore_signal(signal);
            return Err(DeviceError::control("VT_SETMODE", e));
        }

        let termios = os.get_termios(self.fd).unwrap_or_else(|e| {
            debug!(error = %e, "tcgetattr failed");
            crate::os::blank_termios()
        });
        let kb_mode = os.kb_get_mode(self.fd).unwrap_or_else(|e| {
            debug!(error = %e, "KDGKBMODE failed");
            K_XLATE
        });
        self.graphics = Some(SavedConsoleMode {
            signal,
            termios,
            kb_mode,
        });

        if let Err(e) = os.kb_set_mode(self.fd, K_MEDIUMRAW) {
            warn!(error = %e, "Failed to switch keyboard to raw mode");
        }
        if let Err(e) = os.set_termios(self.fd, &raw_termios(&termios)) {
            warn!(error = %e, "Failed to set raw console line");
        }
        if let Err(e) = os.kd_set_mode(self.fd, KD_GRAPHICS) {
            warn!(error = %e, "Failed to enter graphics mode");
        }

        debug!(vt = self.number, signal, "Console switched to graphics");
        Ok(())
    }

    /// Allow the kernel to complete a switch to this console.
    pub fn acknowledge_acquire(&self) {
        if let Err(e) = self.os.vt_release_display(self.fd, VT_ACKACQ) {
            warn!(vt = self.number, error = %e, "VT_RELDISP acquire failed");
        }
    }

    /// Allow the kernel to complete a switch away from this console.
    pub fn acknowledge_release(&self) {
        if let Err(e) = self.os.vt_release_display(self.fd, VT_RELEASE) {
            warn!(vt = self.number, error = %e, "VT_RELDISP release failed");
        }
    }

    /// Request a switch to console `vt`.
    pub fn request_switch(&self, vt: i32) -> Result<()> {
        self.os
            .vt_activate(self.fd, vt)
            .map_err(|e| DeviceError::control("VT_ACTIVATE", e))
    }

    /// Block until `vt` is in the foreground.
    pub fn wait_active(&self, vt: i32) -> Result<()> {
        self.os
            .vt_wait_active(self.fd, vt)
            .map_err(|e| DeviceError::control("VT_WAITACTIVE", e))
    }

    /// Whether this console is in the foreground right now.
    pub fn is_foreground(&self) -> bool {
        self.os
            .vt_get_state(self.fd)
            .map(|s| s.v_active as i32 == self.number)
            .unwrap_or(false)
    }

    /// Read raw scan codes; `WouldBlock` when none are pending.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.os.read(self.fd, buf)
    }

    /// Interrupt the process group (Esc hotkey).
    pub fn interrupt(&self) {
        self.os.interrupt_process_group();
    }

    /// Give the console back: automatic switching, saved line settings
    /// and keyboard mode, text mode, previous console in the foreground.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        let os = &*self.os;
        if let Some(saved) = self.graphics.take() {
            let mut mode = os.vt_get_mode(self.fd).unwrap_or_default();
            mode = VtMode {
                mode: VT_AUTO,
                relsig: 0,
                acqsig: 0,
                ..mode
            };
            if let Err(e) = os.vt_set_mode(self.fd, &mode) {
                warn!(error = %e, "Failed to restore automatic console switching");
            }
            os.restore_signal(saved.signal);

            if let Err(e) = os.set_termios(self.fd, &saved.termios) {
                warn!(error = %e, "Failed to restore console line settings");
            }
            if let Err(e) = os.kb_set_mode(self.fd, saved.kb_mode) {
                warn!(error = %e, "Failed to restore keyboard mode");
            }
            if let Err(e) = os.kd_set_mode(self.fd, KD_TEXT) {
                warn!(error = %e, "Failed to restore text mode");
            }
        }

        if self.previous > 0 {
            let back = os
                .vt_activate(self.fd, self.previous)
                .and_then(|_| os.vt_wait_active(self.fd, self.previous));
            if let Err(e) = back {
                warn!(vt = self.previous, error = %e, "Failed to return to previous console");
            }
        }
        info!(vt = self.number, previous = self.previous, "Virtual console released");
    }
}

impl<O: DeviceOs> Drop for VirtualConsole<O> {
    fn drop(&mut self) {
        self.restore();
        self.os.close(self.fd);
    }
}
