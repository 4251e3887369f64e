//! In-memory [`DeviceOs`] for tests and development.
//!
//! Simulates a machine with a handful of virtual consoles and one framebuffer. Every
//! call is counted, individual operations can be made to fail, and console
//! switches invoke the installed signal handler the way the kernel delivers
//! the release/acquire signal to a console in process-controlled mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::os::{
    blank_termios, ColorRamp, DeviceOs, FbFixScreenInfo, FbVarScreenInfo, OpenMode,
    SignalHandler, VtMode, VtStat, KD_TEXT, K_XLATE, VT_PROCESS,
};

const PAGE_SIZE: usize = 4096;
const SMEM_BASE: libc::c_ulong = 0xe000_0000;

struct MockState {
    calls: u64,
    failing: HashSet<&'static str>,
    missing: HashSet<String>,

    next_fd: RawFd,
    files: HashMap<RawFd, String>,
    open_paths: Vec<String>,
    opens: usize,
    closes: usize,

    foreground: i32,
    busy: u16,
    free_console: i32,
    process_console: Option<i32>,
    vt_mode: VtMode,
    kb_mode: libc::c_int,
    kd_mode: libc::c_int,
    termios: libc::termios,
    activations: Vec<i32>,
    releases: Vec<libc::c_int>,
    input: VecDeque<u8>,
    interrupts: usize,

    handler: Option<(i32, SignalHandler)>,
    signal_installs: usize,
    signal_restores: usize,

    var: FbVarScreenInfo,
    reject_depth: bool,
    resolution_override: Option<(u32, u32)>,
    smem_start: libc::c_ulong,
    cmap_loads: usize,
    memory: Vec<u8>,
    maps: usize,
    unmaps: usize,
    last_map_len: usize,
}

impl MockState {
    fn console_of(&self, fd: RawFd) -> Option<i32> {
        let path = self.files.get(&fd)?;
        let number = path
            .strip_prefix("/dev/tty")
            .or_else(|| path.strip_prefix("/dev/vc/"))?;
        number.parse().ok().filter(|&n| n > 0)
    }
}

/// Mock device layer.
pub struct MockOs {
    state: Mutex<MockState>,
}

impl MockOs {
    /// Console 1 in the foreground, console 7 free, a 640x480 framebuffer
    /// at 16 bits per pixel.
    pub fn new() -> Self {
        info!("Creating mock device layer");
        let var = FbVarScreenInfo {
            xres: 640,
            yres: 480,
            xres_virtual: 640,
            yres_virtual: 960,
            bits_per_pixel: 16,
            ..Default::default()
        };
        Self {
            state: Mutex::new(MockState {
                calls: 0,
                failing: HashSet::new(),
                missing: HashSet::new(),
                next_fd: 100,
                files: HashMap::new(),
                open_paths: Vec::new(),
                opens: 0,
                closes: 0,
                foreground: 1,
                busy: 0b11,
                free_console: 7,
                process_console: None,
                vt_mode: VtMode::default(),
                kb_mode: K_XLATE,
                kd_mode: KD_TEXT,
                termios: blank_termios(),
                activations: Vec::new(),
                releases: Vec::new(),
                input: VecDeque::new(),
                interrupts: 0,
                handler: None,
                signal_installs: 0,
                signal_restores: 0,
                var,
                reject_depth: false,
                resolution_override: None,
                smem_start: SMEM_BASE,
                cmap_loads: 0,
                memory: Vec::new(),
                maps: 0,
                unmaps: 0,
                last_map_len: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and fail it if `op` was marked failing.
    fn enter(&self, op: &'static str) -> io::Result<MutexGuard<'_, MockState>> {
        let mut st = self.state();
        st.calls += 1;
        if st.failing.contains(op) {
            debug!(op, "Injected failure");
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(st)
    }

    fn count(&self) -> MutexGuard<'_, MockState> {
        let mut st = self.state();
        st.calls += 1;
        st
    }

    /// Bring `vt` to the foreground, signalling the process-controlled
    /// console when it loses or gains the display.
    fn switch_to(&self, vt: i32) {
        let signal = {
            let mut st = self.state();
            if st.foreground == vt {
                return;
            }
            let leaving = st.process_console == Some(st.foreground);
            let entering = st.process_console == Some(vt);
            st.foreground = vt;
            if leaving || entering {
                st.handler
            } else {
                None
            }
        };
        if let Some((signal, handler)) = signal {
            handler(signal);
        }
    }

    // =========================================================================
    // Fault injection & scenario setup
    // =========================================================================

    /// Make every call of `op` (a [`DeviceOs`] method name) fail with `EIO`.
    pub fn fail(&self, op: &'static str) {
        self.state().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state().failing.remove(op);
    }

    /// Make opening `path` fail with `ENOENT`.
    pub fn remove_path(&self, path: &str) {
        self.state().missing.insert(path.to_string());
    }

    pub fn set_busy_console(&self, vt: i32) {
        if (0..16).contains(&vt) {
            self.state().busy |= 1 << vt;
        }
    }

    pub fn set_free_console(&self, vt: i32) {
        self.state().free_console = vt;
    }

    /// Accept mode changes but stay at 16 bits per pixel.
    pub fn reject_depth(&self) {
        self.state().reject_depth = true;
    }

    pub fn accept_depth(&self) {
        self.state().reject_depth = false;
    }

    /// Force the resolution reported after the next mode change.
    pub fn override_resolution(&self, xres: u32, yres: u32) {
        self.state().resolution_override = Some((xres, yres));
    }

    /// Place the framebuffer memory `offset` bytes into its page.
    pub fn set_smem_offset(&self, offset: usize) {
        self.state().smem_start = SMEM_BASE + (offset % PAGE_SIZE) as libc::c_ulong;
    }

    /// Simulate the user switching consoles (Alt+Fn).
    pub fn simulate_switch(&self, vt: i32) {
        self.switch_to(vt);
    }

    /// Queue scan codes for the next console read.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state().input.extend(bytes.iter().copied());
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Total number of [`DeviceOs`] calls made so far.
    pub fn calls(&self) -> u64 {
        self.state().calls
    }

    /// Successfully opened paths, in order.
    pub fn open_paths(&self) -> Vec<String> {
        self.state().open_paths.clone()
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn signal_installs(&self) -> usize {
        self.state().signal_installs
    }

    pub fn signal_restores(&self) -> usize {
        self.state().signal_restores
    }

    pub fn handler_installed(&self) -> bool {
        self.state().handler.is_some()
    }

    pub fn free_console(&self) -> i32 {
        self.state().free_console
    }

    pub fn foreground(&self) -> i32 {
        self.state().foreground
    }

    pub fn vt_mode(&self) -> VtMode {
        self.state().vt_mode
    }

    pub fn kb_mode(&self) -> libc::c_int {
        self.state().kb_mode
    }

    pub fn kd_mode(&self) -> libc::c_int {
        self.state().kd_mode
    }

    /// `VT_ACTIVATE` targets, in order.
    pub fn activations(&self) -> Vec<i32> {
        self.state().activations.clone()
    }

    /// `VT_RELDISP` arguments, in order.
    pub fn releases(&self) -> Vec<libc::c_int> {
        self.state().releases.clone()
    }

    pub fn interrupts(&self) -> usize {
        self.state().interrupts
    }

    pub fn var(&self) -> FbVarScreenInfo {
        self.state().var
    }

    pub fn cmap_loads(&self) -> usize {
        self.state().cmap_loads
    }

    pub fn maps(&self) -> usize {
        self.state().maps
    }

    pub fn unmaps(&self) -> usize {
        self.state().unmaps
    }

    pub fn last_map_len(&self) -> usize {
        self.state().last_map_len
    }

    /// Copy of the whole framebuffer memory.
    pub fn memory(&self) -> Vec<u8> {
        self.state().memory.clone()
    }

    /// Pixel at `(x, y)` as laid out by the current mode, if that memory
    /// exists.
    pub fn pixel(&self, x: usize, y: usize) -> Option<u32> {
        let st = self.state();
        let offset = st.smem_start as usize & (PAGE_SIZE - 1);
        let start = offset + y * st.var.xres as usize * 4 + x * 4;
        let bytes = st.memory.get(start..start + 4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Default for MockOs {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceOs for MockOs {
    fn open(&self, path: &str, _mode: OpenMode) -> io::Result<RawFd> {
        let mut st = self.enter("open")?;
        if st.missing.contains(path) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let fd = st.next_fd;
        st.next_fd += 1;
        st.files.insert(fd, path.to_string());
        st.open_paths.push(path.to_string());
        st.opens += 1;
        Ok(fd)
    }

    fn close(&self, fd: RawFd) {
        let mut st = self.count();
        st.files.remove(&fd);
        st.closes += 1;
    }

    fn read(&self, _fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.enter("read")?;
        if st.input.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(st.input.len());
        for (slot, byte) in buf.iter_mut().zip(st.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn detach_controlling_tty(&self) {
        drop(self.count());
    }

    fn set_controlling_tty(&self, _fd: RawFd) -> io::Result<()> {
        self.enter("set_controlling_tty").map(|_| ())
    }

    fn interrupt_process_group(&self) {
        self.count().interrupts += 1;
    }

    fn page_size(&self) -> usize {
        drop(self.count());
        PAGE_SIZE
    }

    fn vt_get_state(&self, _fd: RawFd) -> io::Result<VtStat> {
        let st = self.enter("vt_get_state")?;
        Ok(VtStat {
            v_active: st.foreground as u16,
            v_signal: 0,
            v_state: st.busy | (1u16 << (st.foreground as u32 & 15)),
        })
    }

    fn vt_open_query(&self, _fd: RawFd) -> io::Result<i32> {
        let st = self.enter("vt_open_query")?;
        Ok(st.free_console)
    }

    fn vt_get_mode(&self, _fd: RawFd) -> io::Result<VtMode> {
        let st = self.enter("vt_get_mode")?;
        Ok(st.vt_mode)
    }

    fn vt_set_mode(&self, fd: RawFd, mode: &VtMode) -> io::Result<()> {
        let mut st = self.enter("vt_set_mode")?;
        st.vt_mode = *mode;
        st.process_console = if mode.mode == VT_PROCESS {
            st.console_of(fd)
        } else {
            None
        };
        Ok(())
    }

    fn vt_release_display(&self, _fd: RawFd, arg: libc::c_int) -> io::Result<()> {
        let mut st = self.enter("vt_release_display")?;
        st.releases.push(arg);
        Ok(())
    }

    fn vt_activate(&self, _fd: RawFd, vt: i32) -> io::Result<()> {
        self.enter("vt_activate")?.activations.push(vt);
        self.switch_to(vt);
        Ok(())
    }

    fn vt_wait_active(&self, _fd: RawFd, vt: i32) -> io::Result<()> {
        let st = self.enter("vt_wait_active")?;
        if st.foreground == vt {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EBUSY))
        }
    }

    fn kb_get_mode(&self, _fd: RawFd) -> io::Result<libc::c_int> {
        let st = self.enter("kb_get_mode")?;
        Ok(st.kb_mode)
    }

    fn kb_set_mode(&self, _fd: RawFd, mode: libc::c_int) -> io::Result<()> {
        self.enter("kb_set_mode")?.kb_mode = mode;
        Ok(())
    }

    fn kd_set_mode(&self, _fd: RawFd, mode: libc::c_int) -> io::Result<()> {
        self.enter("kd_set_mode")?.kd_mode = mode;
        Ok(())
    }

    fn get_termios(&self, _fd: RawFd) -> io::Result<libc::termios> {
        let st = self.enter("get_termios")?;
        Ok(st.termios)
    }

    fn set_termios(&self, _fd: RawFd, termios: &libc::termios) -> io::Result<()> {
        self.enter("set_termios")?.termios = *termios;
        Ok(())
    }

    fn install_switch_handler(&self, signal: i32, handler: SignalHandler) -> io::Result<()> {
        let mut st = self.enter("install_switch_handler")?;
        st.handler = Some((signal, handler));
        st.signal_installs += 1;
        Ok(())
    }

    fn restore_signal(&self, _signal: i32) {
        let mut st = self.count();
        st.handler = None;
        st.signal_restores += 1;
    }

    fn fb_get_var(&self, _fd: RawFd) -> io::Result<FbVarScreenInfo> {
        let st = self.enter("fb_get_var")?;
        Ok(st.var)
    }

    fn fb_put_var(&self, _fd: RawFd, var: &FbVarScreenInfo) -> io::Result<()> {
        let mut st = self.enter("fb_put_var")?;
        let mut applied = *var;
        if st.reject_depth {
            applied.bits_per_pixel = 16;
        }
        if let Some((xres, yres)) = st.resolution_override {
            applied.xres = xres;
            applied.yres = yres;
            applied.xres_virtual = xres;
            applied.yres_virtual = yres;
        }
        st.var = applied;
        Ok(())
    }

    fn fb_get_fix(&self, _fd: RawFd) -> io::Result<FbFixScreenInfo> {
        let st = self.enter("fb_get_fix")?;
        let line_length = st.var.xres * st.var.bits_per_pixel / 8;
        Ok(FbFixScreenInfo {
            smem_start: st.smem_start,
            smem_len: line_length * st.var.yres,
            line_length,
            ..Default::default()
        })
    }

    fn fb_put_cmap(&self, _fd: RawFd, ramp: &ColorRamp) -> io::Result<()> {
        let mut st = self.enter("fb_put_cmap")?;
        debug!(?ramp, "Colour map loaded");
        st.cmap_loads += 1;
        Ok(())
    }

    fn map(&self, _fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
        let mut st = self.enter("map")?;
        if st.memory.len() < len {
            st.memory.resize(len, 0);
        }
        st.maps += 1;
        st.last_map_len = len;
        NonNull::new(st.memory.as_mut_ptr()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    fn unmap(&self, _base: NonNull<u8>, _len: usize) {
        self.count().unmaps += 1;
    }
}
