//! PS/2 mouse input (`/dev/input/mice`).
//!
//! Each packet is three bytes: flags (bit 0 left button, bits 4 and 5 the
//! sign of the x and y deltas), then the low eight bits of dx and dy. Motion
//! is accelerated quadratically with the pointer speed.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use lumen_core::{Dispatcher, Event, FileId, FileOps, Pointer, Screen};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, Result};

pub const DEFAULT_MOUSE_DEVICE: &str = "/dev/input/mice";

const PACKET_LEN: usize = 3;
const READ_CHUNK: usize = 32;

const BUTTON_LEFT: u8 = 0x01;
const X_NEGATIVE: u8 = 0x10;
const Y_NEGATIVE: u8 = 0x20;

/// Pointer acceleration: at twice `threshold` counts per packet the pointer
/// moves `numerator / denominator` times faster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Acceleration {
    pub numerator: i32,
    pub denominator: i32,
    pub threshold: i32,
}

impl Default for Acceleration {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 1,
            threshold: 4,
        }
    }
}

impl Acceleration {
    fn apply(&self, dx: i32, dy: i32) -> (i32, i32) {
        let speed = ((dx * dx + dy * dy) as f64).sqrt();
        let slope = (self.numerator as f64 / self.denominator as f64 - 1.0)
            / (self.threshold as f64 * 2.0);
        let accel = slope * speed + 1.0;
        ((accel * dx as f64) as i32, (accel * dy as f64) as i32)
    }
}

/// Pointer position and packet decoder, independent of any device.
#[derive(Debug, Clone)]
pub struct MouseState {
    x: i32,
    y: i32,
    buttons: u32,
    accel: Acceleration,
    residual: Vec<u8>,
    width: i32,
    height: i32,
}

impl MouseState {
    /// Pointer starts at the centre of a `width` x `height` screen.
    pub fn new(width: i32, height: i32, accel: Acceleration) -> Self {
        Self {
            x: width / 2,
            y: height / 2,
            buttons: 0,
            accel,
            residual: Vec::with_capacity(PACKET_LEN),
            width,
            height,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn buttons(&self) -> u32 {
        self.buttons
    }

    fn pointer(&self) -> Pointer {
        Pointer {
            x: self.x,
            y: self.y,
            buttons: self.buttons,
        }
    }

    fn clamp(&mut self) {
        self.x = self.x.clamp(0, self.width);
        self.y = self.y.clamp(0, self.height);
    }

    /// Decode raw bytes into events. Incomplete trailing packets are kept
    /// for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Event> {
        let mut data = std::mem::take(&mut self.residual);
        data.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut packets = data.chunks_exact(PACKET_LEN);
        for packet in &mut packets {
            let flags = packet[0];
            let mut dx = packet[1] as i32;
            if flags & X_NEGATIVE != 0 {
                dx -= 256;
            }
            let mut dy = packet[2] as i32;
            if flags & Y_NEGATIVE != 0 {
                dy -= 256;
            }
            dy = -dy;

            if dx != 0 || dy != 0 {
                let (dx, dy) = self.accel.apply(dx, dy);
                self.x += dx;
                self.y += dy;
                self.clamp();
                events.push(Event::Motion(self.pointer()));
            }

            let buttons = (flags & BUTTON_LEFT) as u32;
            if buttons != self.buttons {
                self.buttons = buttons;
                events.push(if buttons & BUTTON_LEFT as u32 != 0 {
                    Event::ButtonDown(self.pointer())
                } else {
                    Event::ButtonUp(self.pointer())
                });
            }
        }
        self.residual = packets.remainder().to_vec();
        events
    }

    /// Adopt new screen bounds; emits a motion if the pointer had to move.
    pub fn set_bounds(&mut self, width: i32, height: i32) -> Option<Event> {
        self.width = width;
        self.height = height;
        let before = (self.x, self.y);
        self.clamp();
        (before != (self.x, self.y)).then(|| Event::Motion(self.pointer()))
    }
}

/// A mouse device feeding a screen through the dispatcher.
pub struct LinuxMouse {
    state: Rc<RefCell<MouseState>>,
    screen: Rc<RefCell<Screen>>,
    watcher: FileId,
}

impl LinuxMouse {
    /// Open `path` and start delivering its events to `screen`.
    pub fn open(
        path: &str,
        screen: Rc<RefCell<Screen>>,
        dispatcher: &mut Dispatcher,
        accel: Acceleration,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| DeviceError::DeviceUnavailable {
                path: path.to_string(),
                source,
            })?;

        let (width, height) = {
            let screen = screen.borrow();
            (screen.width(), screen.height())
        };
        let state = Rc::new(RefCell::new(MouseState::new(width, height, accel)));

        let fd = file.as_raw_fd();
        let reader_state = state.clone();
        let reader_screen = screen.clone();
        let device = path.to_string();
        let watcher = dispatcher.watch_file(fd, FileOps::Read, move |_, _, _| {
            let mut buf = [0u8; READ_CHUNK];
            let n = match file.read(&mut buf) {
                Ok(0) => {
                    info!(device = %device, "Mouse device closed");
                    return false;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    warn!(device = %device, error = %e, "Mouse read failed");
                    return false;
                }
            };

            let events = reader_state.borrow_mut().feed(&buf[..n]);
            if let Ok(mut screen) = reader_screen.try_borrow_mut() {
                for event in &events {
                    screen.dispatch(event);
                }
            }
            true
        })?;

        info!(path, ?accel, "Mouse attached");
        Ok(Self {
            state,
            screen,
            watcher,
        })
    }

    pub fn position(&self) -> (i32, i32) {
        self.state.borrow().position()
    }

    /// Re-clamp the pointer after the screen changed size.
    pub fn screen_changed(&self) {
        let Ok(mut screen) = self.screen.try_borrow_mut() else {
            return;
        };
        let moved = self
            .state
            .borrow_mut()
            .set_bounds(screen.width(), screen.height());
        if let Some(event) = moved {
            debug!(?event, "Pointer moved into new screen bounds");
            screen.dispatch(&event);
        }
    }

    /// Stop watching the device; the descriptor is closed with the watcher.
    pub fn close(self, dispatcher: &mut Dispatcher) {
        if let Err(e) = dispatcher.remove_file(self.watcher) {
            debug!(error = %e, "Mouse watcher already gone");
        }
    }
}
