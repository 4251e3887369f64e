//! Joystick input (`/dev/input/js*`).

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use lumen_core::{Dispatcher, Event, FileId, FileOps, Screen};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, Result};

pub const DEFAULT_JOYSTICK_DIR: &str = "/dev/input";

/// Size of `struct js_event`.
pub const JS_EVENT_LEN: usize = 8;

const JS_EVENT_BUTTON: u8 = 0x01;
const JS_EVENT_AXIS: u8 = 0x02;

/// Decode one `struct js_event { u32 time; i16 value; u8 type; u8 number; }`.
///
/// Initial-state records (type flagged `JS_EVENT_INIT`) and unknown types
/// yield `None`.
pub fn decode_js_event(record: &[u8; JS_EVENT_LEN]) -> Option<Event> {
    let value = i16::from_ne_bytes([record[4], record[5]]);
    let control = record[7] as u16;
    match record[6] {
        JS_EVENT_BUTTON => Some(Event::JoyButton { control, value }),
        JS_EVENT_AXIS => Some(Event::JoyAxis { control, value }),
        _ => None,
    }
}

/// All joystick devices found at open time.
pub struct Joysticks {
    watchers: Vec<(PathBuf, FileId)>,
}

impl Joysticks {
    /// Open every `js*` node in `dir` and route its events to `screen`.
    /// Nodes that cannot be opened are skipped.
    pub fn open_all(
        dir: impl AsRef<Path>,
        screen: Rc<RefCell<Screen>>,
        dispatcher: &mut Dispatcher,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|source| DeviceError::DeviceUnavailable {
            path: dir.display().to_string(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("js"))
            .map(|entry| entry.path())
            .collect();
        paths.sort();

        let mut watchers = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::watch(&path, screen.clone(), dispatcher) {
                Ok(id) => {
                    info!(device = %path.display(), "Joystick attached");
                    watchers.push((path, id));
                }
                Err(e) => warn!(device = %path.display(), error = %e, "Skipping joystick"),
            }
        }
        Ok(Self { watchers })
    }

    fn watch(path: &Path, screen: Rc<RefCell<Screen>>, dispatcher: &mut Dispatcher) -> Result<FileId> {
        let mut file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| DeviceError::DeviceUnavailable {
                path: path.display().to_string(),
                source,
            })?;
        let fd = file.as_raw_fd();
        let device = path.display().to_string();

        Ok(dispatcher.watch_file(fd, FileOps::Read, move |_, _, _| {
            let mut record = [0u8; JS_EVENT_LEN];
            let mut events = Vec::new();
            loop {
                match file.read(&mut record) {
                    Ok(JS_EVENT_LEN) => events.extend(decode_js_event(&record)),
                    // Short read: nothing usable left.
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(device = %device, error = %e, "Joystick read failed");
                        return false;
                    }
                }
            }

            if let Ok(mut screen) = screen.try_borrow_mut() {
                for event in &events {
                    screen.dispatch(event);
                }
            }
            true
        })?)
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Stop watching every device.
    pub fn close(self, dispatcher: &mut Dispatcher) {
        for (path, id) in self.watchers {
            if let Err(e) = dispatcher.remove_file(id) {
                debug!(device = %path.display(), error = %e, "Joystick watcher already gone");
            }
        }
    }
}
