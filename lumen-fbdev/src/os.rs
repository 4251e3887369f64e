//! Device OS Facility
//!
//! Every operating-system interaction the framebuffer session performs goes
//! through [`DeviceOs`]: console and framebuffer control operations, termios,
//! memory mapping and signal registration. [`crate::linux::LinuxOs`] talks to
//! the kernel; [`crate::mock::MockOs`] simulates it for tests.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// `VT_GETMODE` / `VT_SETMODE` modes.
pub const VT_AUTO: libc::c_char = 0x00;
pub const VT_PROCESS: libc::c_char = 0x01;
/// `VT_RELDISP` argument acknowledging a switch to this console.
pub const VT_ACKACQ: libc::c_int = 0x02;
/// `VT_RELDISP` argument allowing a switch away from this console.
pub const VT_RELEASE: libc::c_int = 0x01;

/// Keyboard modes for `KDGKBMODE` / `KDSKBMODE`.
pub const K_XLATE: libc::c_int = 0x01;
pub const K_MEDIUMRAW: libc::c_int = 0x02;

/// Console display modes for `KDSETMODE`.
pub const KD_TEXT: libc::c_int = 0x00;
pub const KD_GRAPHICS: libc::c_int = 0x01;

/// Highest console number whose busy bit `VT_GETSTATE` can report.
pub const MAX_QUERYABLE_VT: i32 = 31;

/// Signal handler signature accepted by [`DeviceOs::install_switch_handler`].
pub type SignalHandler = extern "C" fn(libc::c_int);

/// How a device node is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    WriteOnly,
    ReadWrite,
    ReadWriteNonBlocking,
}

/// `struct vt_stat`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VtStat {
    pub v_active: libc::c_ushort,
    pub v_signal: libc::c_ushort,
    pub v_state: libc::c_ushort,
}

impl VtStat {
    /// Whether console `vt` is in use according to `v_state`.
    pub fn is_busy(&self, vt: i32) -> bool {
        (0..16).contains(&vt) && (self.v_state as u32) & (1u32 << vt) != 0
    }
}

/// `struct vt_mode`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VtMode {
    pub mode: libc::c_char,
    pub waitv: libc::c_char,
    pub relsig: libc::c_short,
    pub acqsig: libc::c_short,
    pub frsig: libc::c_short,
}

/// `struct fb_bitfield`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FbBitField {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

/// `struct fb_var_screeninfo`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FbVarScreenInfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitField,
    pub green: FbBitField,
    pub blue: FbBitField,
    pub transp: FbBitField,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// `struct fb_fix_screeninfo`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FbFixScreenInfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub fb_type: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

/// 256-entry colour lookup table, one ramp per channel.
#[derive(Clone, PartialEq, Eq)]
pub struct ColorRamp {
    pub red: [u16; 256],
    pub green: [u16; 256],
    pub blue: [u16; 256],
}

impl ColorRamp {
    /// Identity ramp: entry `i` maps to `(i << 8) | i` on every channel.
    pub fn identity() -> Self {
        let mut ramp = [0u16; 256];
        for (i, entry) in ramp.iter_mut().enumerate() {
            *entry = ((i as u16) << 8) | i as u16;
        }
        Self {
            red: ramp,
            green: ramp,
            blue: ramp,
        }
    }
}

impl std::fmt::Debug for ColorRamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColorRamp")
            .field("red[255]", &self.red[255])
            .field("green[255]", &self.green[255])
            .field("blue[255]", &self.blue[255])
            .finish()
    }
}

/// An all-zero termios, used as a starting point before `tcgetattr`.
pub fn blank_termios() -> libc::termios {
    // SAFETY: termios is a plain C struct of integers and arrays; all-zero is
    // a valid bit pattern.
    unsafe { std::mem::zeroed() }
}

/// Raw console line settings: no input processing, 8-bit characters, reads
/// return as soon as one byte is available.
pub fn raw_termios(saved: &libc::termios) -> libc::termios {
    let mut tio = *saved;
    tio.c_iflag = (libc::IGNPAR | libc::IGNBRK) & !libc::PARMRK & !libc::ISTRIP;
    tio.c_oflag = 0;
    tio.c_cflag = libc::CREAD | libc::CS8;
    tio.c_lflag = 0;
    tio.c_cc[libc::VTIME] = 0;
    tio.c_cc[libc::VMIN] = 1;
    // SAFETY: cfset*speed only write fields of the struct we own.
    unsafe {
        libc::cfsetispeed(&mut tio, libc::B9600);
        libc::cfsetospeed(&mut tio, libc::B9600);
    }
    tio
}

/// Operating-system operations used by the console and framebuffer code.
///
/// Methods mirror the underlying control operations one to one, so call
/// counts observed through a mock match what would reach the kernel.
pub trait DeviceOs {
    // =========================================================================
    // Files & process
    // =========================================================================

    fn open(&self, path: &str, mode: OpenMode) -> io::Result<RawFd>;
    fn close(&self, fd: RawFd);
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Start a new process group and drop the controlling terminal.
    fn detach_controlling_tty(&self);

    /// Make `fd` the controlling terminal (`TIOCSCTTY`).
    fn set_controlling_tty(&self, fd: RawFd) -> io::Result<()>;

    /// Send `SIGINT` to the process group.
    fn interrupt_process_group(&self);

    fn page_size(&self) -> usize;

    // =========================================================================
    // Virtual consoles
    // =========================================================================

    fn vt_get_state(&self, fd: RawFd) -> io::Result<VtStat>;

    /// First free console number (`VT_OPENQRY`).
    fn vt_open_query(&self, fd: RawFd) -> io::Result<i32>;
    fn vt_get_mode(&self, fd: RawFd) -> io::Result<VtMode>;
    fn vt_set_mode(&self, fd: RawFd, mode: &VtMode) -> io::Result<()>;

    /// `VT_RELDISP` with [`VT_RELEASE`] or [`VT_ACKACQ`].
    fn vt_release_display(&self, fd: RawFd, arg: libc::c_int) -> io::Result<()>;
    fn vt_activate(&self, fd: RawFd, vt: i32) -> io::Result<()>;

    /// Block until console `vt` is in the foreground. No timeout.
    fn vt_wait_active(&self, fd: RawFd, vt: i32) -> io::Result<()>;

    fn kb_get_mode(&self, fd: RawFd) -> io::Result<libc::c_int>;
    fn kb_set_mode(&self, fd: RawFd, mode: libc::c_int) -> io::Result<()>;
    fn kd_set_mode(&self, fd: RawFd, mode: libc::c_int) -> io::Result<()>;
    fn get_termios(&self, fd: RawFd) -> io::Result<libc::termios>;
    fn set_termios(&self, fd: RawFd, termios: &libc::termios) -> io::Result<()>;

    // =========================================================================
    // Signals
    // =========================================================================

    fn install_switch_handler(&self, signal: i32, handler: SignalHandler) -> io::Result<()>;

    /// Put back the disposition that was in place before
    /// [`DeviceOs::install_switch_handler`].
    fn restore_signal(&self, signal: i32);

    // =========================================================================
    // Framebuffer
    // =========================================================================

    fn fb_get_var(&self, fd: RawFd) -> io::Result<FbVarScreenInfo>;
    fn fb_put_var(&self, fd: RawFd, var: &FbVarScreenInfo) -> io::Result<()>;
    fn fb_get_fix(&self, fd: RawFd) -> io::Result<FbFixScreenInfo>;
    fn fb_put_cmap(&self, fd: RawFd, ramp: &ColorRamp) -> io::Result<()>;

    /// Map `len` bytes of the device shared and writable.
    fn map(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>>;
    fn unmap(&self, base: NonNull<u8>, len: usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_ramp() {
        let ramp = ColorRamp::identity();
        assert_eq!(ramp.red[0], 0x0000);
        assert_eq!(ramp.green[0x12], 0x1212);
        assert_eq!(ramp.blue[255], 0xffff);
    }

    #[test]
    fn test_raw_termios() {
        let tio = raw_termios(&blank_termios());
        assert_eq!(tio.c_lflag, 0);
        assert_eq!(tio.c_oflag, 0);
        assert_eq!(tio.c_cc[libc::VMIN], 1);
        assert_ne!(tio.c_cflag & libc::CS8, 0);
        assert_ne!(tio.c_iflag & libc::IGNBRK, 0);
    }

    #[test]
    fn test_vt_busy_bits() {
        let stat = VtStat {
            v_active: 1,
            v_signal: 0,
            v_state: 0b0000_0110,
        };
        assert!(stat.is_busy(1));
        assert!(stat.is_busy(2));
        assert!(!stat.is_busy(3));
        assert!(!stat.is_busy(20));
    }
}
