//! # Lumen Common
//!
//! Shared utilities for the Lumen crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use lumen_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(vt = 7, "Console acquired");
//! ```

pub mod logging;

pub use logging::{build_filter, init_logging, init_logging_json};
