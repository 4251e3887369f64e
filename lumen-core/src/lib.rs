//! # Lumen Core
//!
//! Scheduling primitives of the Lumen windowing toolkit.
//!
//! ## Architecture
//!
//! ```text
//! input devices / console signals
//!               │
//!               ▼
//! ┌───────────────────────────┐      ┌──────────────────┐
//! │        Dispatcher         │─────▶│   Ordered Queue  │
//! │ files → timeouts → work   │      │ (snapshot walks) │
//! └─────────────┬─────────────┘      └──────────────────┘
//!               │ repaint when damaged
//!               ▼
//! ┌───────────────────────────┐
//! │          Screen           │──▶ backend span writer
//! └───────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lumen_core::{Dispatcher, WorkPriority};
//!
//! let mut dispatcher = Dispatcher::new()?;
//! dispatcher.add_work(WorkPriority::Redisplay, |_| true);
//! dispatcher.run()?;
//! ```

pub mod dispatch;
pub mod error;
pub mod event;
pub mod queue;
pub mod screen;

pub use dispatch::{
    Dispatcher, FileId, FileOps, TimeoutId, WakeId, Waker, WorkId, WorkPriority,
};
pub use error::{ErrorCategory, LumenError, Result};
pub use event::{Event, Pointer};
pub use queue::{NodeId, Order, Queue, QueueError, Walk};
pub use screen::{Argb32, ListenerId, Propagation, Rect, Screen, SolidBackground, SpanSource};
