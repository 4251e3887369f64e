//! Normalized input events.
//!
//! Every input driver (console keyboard, mouse, joystick) produces these and
//! hands them to [`crate::Screen::dispatch`]. Nothing here records which
//! physical device an event came from.

/// Pointer state carried by motion and button events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pointer {
    /// Absolute screen coordinates.
    pub x: i32,
    pub y: i32,
    /// Button bitmask at the time of the event.
    pub buttons: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Motion(Pointer),
    ButtonDown(Pointer),
    ButtonUp(Pointer),
    /// Key pressed; `key` is the raw scan code.
    KeyDown { key: u16 },
    KeyUp { key: u16 },
    JoyButton { control: u16, value: i16 },
    JoyAxis { control: u16, value: i16 },
}

impl Event {
    /// Pointer position for pointer events.
    pub fn pointer(&self) -> Option<Pointer> {
        match self {
            Event::Motion(p) | Event::ButtonDown(p) | Event::ButtonUp(p) => Some(*p),
            _ => None,
        }
    }
}
