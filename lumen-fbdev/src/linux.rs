//! Kernel-backed [`DeviceOs`].
//!
//! Console and framebuffer control goes through `libc::ioctl` with the
//! request numbers from `<linux/vt.h>`, `<linux/kd.h>` and `<linux/fb.h>`.
//! Signal dispositions are managed with `nix::sys::signal::sigaction`, which
//! keeps the handler installed across deliveries.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::Mutex;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::os::{
    ColorRamp, DeviceOs, FbFixScreenInfo, FbVarScreenInfo, OpenMode, SignalHandler, VtMode,
    VtStat,
};

// <linux/vt.h>
const VT_OPENQRY: libc::c_ulong = 0x5600;
const VT_GETMODE: libc::c_ulong = 0x5601;
const VT_SETMODE: libc::c_ulong = 0x5602;
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_RELDISP: libc::c_ulong = 0x5605;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;

// <linux/kd.h>
const KDSETMODE: libc::c_ulong = 0x4B3A;
const KDGKBMODE: libc::c_ulong = 0x4B44;
const KDSKBMODE: libc::c_ulong = 0x4B45;

/// `TIOCSCTTY` argument: take the terminal even if another session holds it.
const STEAL_TTY: libc::c_int = 1;

// <linux/fb.h>
const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOPUT_VSCREENINFO: libc::c_ulong = 0x4601;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;
const FBIOPUTCMAP: libc::c_ulong = 0x4605;

/// `struct fb_cmap`
#[repr(C)]
struct FbCmap {
    start: u32,
    len: u32,
    red: *mut u16,
    green: *mut u16,
    blue: *mut u16,
    transp: *mut u16,
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn to_signal(signal: i32) -> io::Result<Signal> {
    Signal::try_from(signal).map_err(io::Error::from)
}

/// [`DeviceOs`] talking to the running Linux kernel.
#[derive(Default)]
pub struct LinuxOs {
    /// Dispositions replaced by `install_switch_handler`, keyed by signal.
    saved_actions: Mutex<HashMap<i32, SigAction>>,
}

impl LinuxOs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceOs for LinuxOs {
    fn open(&self, path: &str, mode: OpenMode) -> io::Result<RawFd> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::WriteOnly => options.write(true),
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::ReadWriteNonBlocking => options
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK),
        };
        let file = options.open(path)?;
        Ok(file.into_raw_fd())
    }

    fn close(&self, fd: RawFd) {
        if let Err(e) = nix::unistd::close(fd) {
            warn!(fd, error = %e, "close failed");
        }
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn detach_controlling_tty(&self) {
        if let Err(e) = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
            debug!(error = %e, "setpgid failed");
        }
        match self.open("/dev/tty", OpenMode::ReadWrite) {
            Ok(fd) => {
                let ret = unsafe { libc::ioctl(fd, libc::TIOCNOTTY as _, 0) };
                if ret < 0 {
                    debug!(error = %io::Error::last_os_error(), "TIOCNOTTY failed");
                }
                self.close(fd);
            }
            Err(e) => debug!(error = %e, "No controlling terminal to drop"),
        }
    }

    fn set_controlling_tty(&self, fd: RawFd) -> io::Result<()> {
        check(unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, STEAL_TTY) })
    }

    fn interrupt_process_group(&self) {
        if let Err(e) = signal::kill(Pid::from_raw(0), Signal::SIGINT) {
            warn!(error = %e, "Failed to interrupt process group");
        }
    }

    fn page_size(&self) -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    fn vt_get_state(&self, fd: RawFd) -> io::Result<VtStat> {
        let mut stat = VtStat::default();
        check(unsafe { libc::ioctl(fd, VT_GETSTATE as _, &mut stat) })?;
        Ok(stat)
    }

    fn vt_open_query(&self, fd: RawFd) -> io::Result<i32> {
        let mut vt: libc::c_int = -1;
        check(unsafe { libc::ioctl(fd, VT_OPENQRY as _, &mut vt) })?;
        if vt < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(vt)
    }

    fn vt_get_mode(&self, fd: RawFd) -> io::Result<VtMode> {
        let mut mode = VtMode::default();
        check(unsafe { libc::ioctl(fd, VT_GETMODE as _, &mut mode) })?;
        Ok(mode)
    }

    fn vt_set_mode(&self, fd: RawFd, mode: &VtMode) -> io::Result<()> {
        check(unsafe { libc::ioctl(fd, VT_SETMODE as _, mode as *const VtMode) })
    }

    fn vt_release_display(&self, fd: RawFd, arg: libc::c_int) -> io::Result<()> {
        check(unsafe { libc::ioctl(fd, VT_RELDISP as _, arg as libc::c_ulong) })
    }

    fn vt_activate(&self, fd: RawFd, vt: i32) -> io::Result<()> {
        check(unsafe { libc::ioctl(fd, VT_ACTIVATE as _, vt as libc::c_ulong) })
    }

    fn vt_wait_active(&self, fd: RawFd, vt: i32) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::ioctl(fd, VT_WAITACTIVE as _, vt as libc::c_ulong) };
            match check(ret) {
                // Our own switch signal interrupts the wait.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn kb_get_mode(&self, fd: RawFd) -> io::Result<libc::c_int> {
        let mut mode: libc::c_int = 0;
        check(unsafe { libc::ioctl(fd, KDGKBMODE as _, &mut mode) })?;
        Ok(mode)
    }

    fn kb_set_mode(&self, fd: RawFd, mode: libc::c_int) -> io::Result<()> {
        check(unsafe { libc::ioctl(fd, KDSKBMODE as _, mode as libc::c_ulong) })
    }

    fn kd_set_mode(&self, fd: RawFd, mode: libc::c_int) -> io::Result<()> {
        check(unsafe { libc::ioctl(fd, KDSETMODE as _, mode as libc::c_ulong) })
    }

    fn get_termios(&self, fd: RawFd) -> io::Result<libc::termios> {
        let mut tio = crate::os::blank_termios();
        check(unsafe { libc::tcgetattr(fd, &mut tio) })?;
        Ok(tio)
    }

    fn set_termios(&self, fd: RawFd, termios: &libc::termios) -> io::Result<()> {
        check(unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) })
    }

    fn install_switch_handler(&self, signal: i32, handler: SignalHandler) -> io::Result<()> {
        let sig = to_signal(signal)?;
        let action = SigAction::new(
            SigHandler::Handler(handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only stores into an atomic.
        let previous = unsafe { signal::sigaction(sig, &action) }.map_err(io::Error::from)?;
        if let Ok(mut saved) = self.saved_actions.lock() {
            saved.entry(signal).or_insert(previous);
        }
        Ok(())
    }

    fn restore_signal(&self, signal: i32) {
        let Ok(sig) = to_signal(signal) else {
            return;
        };
        let previous = self
            .saved_actions
            .lock()
            .ok()
            .and_then(|mut saved| saved.remove(&signal))
            .unwrap_or_else(|| {
                SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
            });
        // SAFETY: restores a disposition previously returned by sigaction.
        if let Err(e) = unsafe { signal::sigaction(sig, &previous) } {
            warn!(signal, error = %e, "Failed to restore signal disposition");
        }
    }

    fn fb_get_var(&self, fd: RawFd) -> io::Result<FbVarScreenInfo> {
        let mut var = FbVarScreenInfo::default();
        check(unsafe { libc::ioctl(fd, FBIOGET_VSCREENINFO as _, &mut var) })?;
        Ok(var)
    }

    fn fb_put_var(&self, fd: RawFd, var: &FbVarScreenInfo) -> io::Result<()> {
        let mut var = *var;
        check(unsafe { libc::ioctl(fd, FBIOPUT_VSCREENINFO as _, &mut var) })
    }

    fn fb_get_fix(&self, fd: RawFd) -> io::Result<FbFixScreenInfo> {
        let mut fix = FbFixScreenInfo::default();
        check(unsafe { libc::ioctl(fd, FBIOGET_FSCREENINFO as _, &mut fix) })?;
        Ok(fix)
    }

    fn fb_put_cmap(&self, fd: RawFd, ramp: &ColorRamp) -> io::Result<()> {
        let mut ramp = ramp.clone();
        let mut cmap = FbCmap {
            start: 0,
            len: 256,
            red: ramp.red.as_mut_ptr(),
            green: ramp.green.as_mut_ptr(),
            blue: ramp.blue.as_mut_ptr(),
            transp: std::ptr::null_mut(),
        };
        check(unsafe { libc::ioctl(fd, FBIOPUTCMAP as _, &mut cmap) })
    }

    fn map(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(base as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))
    }

    fn unmap(&self, base: NonNull<u8>, len: usize) {
        let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, len) };
        if ret < 0 {
            warn!(error = %io::Error::last_os_error(), "munmap failed");
        }
    }
}
