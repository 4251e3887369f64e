//! # Lumen Framebuffer Backend
//!
//! Drives a Linux framebuffer (`/dev/fb*`) from a dedicated virtual console,
//! cooperating with the kernel's console switching.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               FbdevSession               │
//! │  switch work item · keyboard watcher     │
//! └──────┬──────────────────────┬────────────┘
//!        ▼                      ▼
//! ┌───────────────┐     ┌───────────────┐
//! │ VirtualConsole│     │   FbDevice    │
//! └──────┬────────┘     └──────┬────────┘
//!        └──────────┬──────────┘
//!                   ▼
//!         ┌───────────────────┐
//!         │  DeviceOs trait   │
//!         │ LinuxOs · MockOs  │
//!         └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lumen_core::Dispatcher;
//! use lumen_fbdev::{FbdevConfig, FbdevSession, LinuxOs};
//!
//! let config = FbdevConfig::load();
//! config.init_logging()?;
//! config.validate()?;
//!
//! let mut dispatcher = Dispatcher::new()?;
//! let mut session = FbdevSession::acquire(
//!     Arc::new(LinuxOs::new()),
//!     &mut dispatcher,
//!     &config.session_options()?,
//! )?;
//! session.attach_inputs(&mut dispatcher, &config.input);
//! session.activate()?;
//! dispatcher.run()?;
//! session.teardown(&mut dispatcher);
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod fb;
pub mod joystick;
pub mod keyboard;
pub mod linux;
pub mod mock;
pub mod mouse;
pub mod os;
pub mod session;

pub use config::{FbdevConfig, LogFormat, DEFAULT_CONFIG_PATH};
pub use error::{DeviceError, Result};
pub use joystick::{decode_js_event, Joysticks};
pub use keyboard::Hotkeys;
pub use linux::LinuxOs;
pub use mock::MockOs;
pub use mouse::{Acceleration, LinuxMouse, MouseState};
pub use os::DeviceOs;
pub use session::{session_live, switch_pending, FbdevSession, SessionOptions, SessionState};
