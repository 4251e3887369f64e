//! Console keyboard scan codes.
//!
//! In medium-raw mode the console delivers one byte per key transition: the
//! low seven bits are the key code, bit 7 marks a release.

use lumen_core::Event;

pub const KEY_ESC: u8 = 1;
pub const KEY_F1: u8 = 59;
pub const KEY_F10: u8 = 68;

const RELEASE_BIT: u8 = 0x80;

/// Hotkeys handled by the backend itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotkeys {
    /// F1..F10 switch to consoles 1..10.
    pub vt_switch_keys: bool,
    /// Esc interrupts the process group.
    pub escape_interrupts: bool,
}

impl Default for Hotkeys {
    fn default() -> Self {
        Self {
            vt_switch_keys: true,
            escape_interrupts: true,
        }
    }
}

/// What a single scan code asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Bring console `n` to the foreground.
    SwitchConsole(i32),
    Interrupt,
    Deliver(Event),
    /// Release of a hotkey.
    Ignore,
}

pub fn classify(code: u8, hotkeys: &Hotkeys) -> KeyAction {
    let down = code & RELEASE_BIT == 0;
    let key = code & !RELEASE_BIT;

    match key {
        KEY_F1..=KEY_F10 if hotkeys.vt_switch_keys => {
            if down {
                KeyAction::SwitchConsole((key - KEY_F1 + 1) as i32)
            } else {
                KeyAction::Ignore
            }
        }
        KEY_ESC if hotkeys.escape_interrupts => {
            if down {
                KeyAction::Interrupt
            } else {
                KeyAction::Ignore
            }
        }
        _ if down => KeyAction::Deliver(Event::KeyDown { key: key as u16 }),
        _ => KeyAction::Deliver(Event::KeyUp { key: key as u16 }),
    }
}
