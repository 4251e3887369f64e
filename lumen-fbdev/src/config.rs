//! Configuration for the framebuffer backend.
//!
//! Loaded from YAML with defaults for every field:
//!
//! ```yaml
//! log_level: info
//! log_format: pretty
//! console:
//!   vt: 7
//!   switch_signal: SIGUSR1
//! framebuffer:
//!   device: /dev/fb0
//! input:
//!   mouse_device: /dev/input/mice
//!   acceleration: { numerator: 2, denominator: 1, threshold: 4 }
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, Result};
use crate::joystick::DEFAULT_JOYSTICK_DIR;
use crate::keyboard::Hotkeys;
use crate::mouse::{Acceleration, DEFAULT_MOUSE_DEVICE};
use crate::os::MAX_QUERYABLE_VT;
use crate::session::SessionOptions;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lumen/fbdev.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Backend configuration loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FbdevConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    pub log_format: LogFormat,

    pub console: ConsoleConfig,

    pub framebuffer: FramebufferConfig,

    pub input: InputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Console number to take over (unset = first free console)
    pub vt: Option<i32>,

    /// Signal used for console release/acquire notifications
    pub switch_signal: String,

    /// F1..F10 switch consoles
    pub vt_switch_keys: bool,

    /// Esc sends SIGINT to the process group
    pub escape_interrupts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramebufferConfig {
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// PS/2 mouse device (unset = no mouse)
    pub mouse_device: Option<String>,

    /// Directory scanned for `js*` joystick nodes (unset = no joysticks)
    pub joystick_dir: Option<String>,

    pub acceleration: Acceleration,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            vt: None,
            switch_signal: "SIGUSR1".to_string(),
            vt_switch_keys: true,
            escape_interrupts: true,
        }
    }
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self {
            device: "/dev/fb0".to_string(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            mouse_device: Some(DEFAULT_MOUSE_DEVICE.to_string()),
            joystick_dir: Some(DEFAULT_JOYSTICK_DIR.to_string()),
            acceleration: Acceleration::default(),
        }
    }
}

impl Default for FbdevConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            console: ConsoleConfig::default(),
            framebuffer: FramebufferConfig::default(),
            input: InputConfig::default(),
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> DeviceError {
    DeviceError::InvalidConfig {
        field: field.to_string(),
        message: message.into(),
    }
}

impl FbdevConfig {
    /// Load configuration from the default path or fall back to defaults.
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path. Missing or unreadable files
    /// yield the defaults.
    pub fn load_from_path(path: &str) -> Self {
        let path = PathBuf::from(path);

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_yaml::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded configuration");
                    debug!(?config, "Effective configuration");
                    config
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to parse config file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read config file, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(
                "log_level",
                format!("must be one of: {:?}", valid_levels),
            ));
        }

        if let Some(vt) = self.console.vt {
            if !(1..=MAX_QUERYABLE_VT).contains(&vt) {
                return Err(invalid(
                    "console.vt",
                    format!("must be between 1 and {MAX_QUERYABLE_VT}"),
                ));
            }
        }

        self.switch_signal()?;

        if self.framebuffer.device.is_empty() {
            return Err(invalid("framebuffer.device", "must not be empty"));
        }

        let accel = &self.input.acceleration;
        if accel.denominator == 0 || accel.threshold <= 0 {
            return Err(invalid(
                "input.acceleration",
                "denominator must be non-zero and threshold positive",
            ));
        }

        Ok(())
    }

    /// The configured switch signal as a signal number.
    pub fn switch_signal(&self) -> Result<i32> {
        let name = self.console.switch_signal.trim().to_uppercase();
        let name = if name.starts_with("SIG") {
            name
        } else {
            format!("SIG{name}")
        };
        let signal = Signal::from_str(&name)
            .map_err(|_| invalid("console.switch_signal", format!("unknown signal {name}")))?;
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            return Err(invalid(
                "console.switch_signal",
                "signal cannot be caught",
            ));
        }
        Ok(signal as i32)
    }

    /// Session parameters derived from this configuration.
    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions {
            wanted_vt: self.console.vt,
            switch_signal: self.switch_signal()?,
            fb_device: self.framebuffer.device.clone(),
            hotkeys: Hotkeys {
                vt_switch_keys: self.console.vt_switch_keys,
                escape_interrupts: self.console.escape_interrupts,
            },
        })
    }

    /// Install the global log subscriber in the configured format.
    pub fn init_logging(&self) -> anyhow::Result<()> {
        match self.log_format {
            LogFormat::Json => lumen_common::init_logging_json(&self.log_level),
            LogFormat::Pretty => lumen_common::init_logging(&self.log_level),
        }
    }
}
