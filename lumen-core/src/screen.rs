//! Screen Surface
//!
//! The abstract display surface a backend drives. It owns no pixels: it tracks
//! a damage rectangle, pulls span contents from a [`SpanSource`] when asked to
//! repaint, and pushes them to the backend through the registered span writer.
//! Input events are routed to z-ordered listeners with the queue walk, so a
//! listener may detach itself while handling an event.

use tracing::{debug, trace};

use crate::event::Event;
use crate::queue::{NodeId, Order, Queue};

/// 32-bit ARGB pixel.
pub type Argb32 = u32;

/// Receives one horizontal run of pixels: `(left, top, right, pixels)`.
pub type SpanWriter = Box<dyn FnMut(i32, i32, i32, &[Argb32])>;

/// Event handler; the return value decides what happens next.
pub type Listener = Box<dyn FnMut(&Event) -> Propagation>;

/// Half-open rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Smallest rectangle covering both; empty inputs are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        }
    }
}

/// Supplies pixel contents for a span during a repaint.
pub trait SpanSource {
    /// Fill `out` with the pixels of row `top` starting at column `left`.
    fn fill_span(&mut self, left: i32, top: i32, out: &mut [Argb32]);
}

/// Span source painting a single colour.
#[derive(Debug, Clone, Copy)]
pub struct SolidBackground(pub Argb32);

impl SpanSource for SolidBackground {
    fn fill_span(&mut self, _left: i32, _top: i32, out: &mut [Argb32]) {
        out.fill(self.0);
    }
}

/// What a listener wants after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Offer the event to the next listener.
    Continue,
    /// The event was consumed.
    Stop,
    /// Consume the event and unregister this listener.
    Detach,
}

/// Handle returned by [`Screen::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(NodeId);

struct ListenerEntry {
    layer: i32,
    handler: Option<Listener>,
}

fn listener_order(candidate: &ListenerEntry, existing: &ListenerEntry) -> Order {
    // Higher layers sit on top and see events first.
    Order::ascending(&-candidate.layer, &-existing.layer)
}

pub struct Screen {
    width: i32,
    height: i32,
    damage: Rect,
    span_writer: Option<SpanWriter>,
    source: Box<dyn SpanSource>,
    listeners: Queue<ListenerEntry>,
    scratch: Vec<Argb32>,
    updates: u64,
}

impl Screen {
    /// Create a screen painted with an opaque black background.
    pub fn new(width: i32, height: i32) -> Self {
        debug!(width, height, "Screen created");
        Self {
            width,
            height,
            damage: Rect::default(),
            span_writer: None,
            source: Box::new(SolidBackground(0xff00_0000)),
            listeners: Queue::new(),
            scratch: Vec::new(),
            updates: 0,
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Register the backend's span writer.
    pub fn set_span_writer(&mut self, writer: SpanWriter) {
        self.span_writer = Some(writer);
    }

    pub fn clear_span_writer(&mut self) {
        self.span_writer = None;
    }

    pub fn set_span_source(&mut self, source: Box<dyn SpanSource>) {
        self.source = source;
        self.damage_all();
    }

    /// Change the geometry; everything becomes stale.
    pub fn resize(&mut self, width: i32, height: i32) {
        self.width = width;
        self.height = height;
        self.damage = Rect::default();
        self.damage_all();
    }

    /// Mark a rectangle as stale. Coordinates are clipped to the screen.
    pub fn damage(&mut self, left: i32, top: i32, right: i32, bottom: i32) {
        let rect = Rect::new(left, top, right, bottom).intersect(&self.bounds());
        if !rect.is_empty() {
            self.damage = self.damage.union(&rect);
        }
    }

    pub fn damage_all(&mut self) {
        self.damage(0, 0, self.width, self.height);
    }

    pub fn damaged(&self) -> bool {
        !self.damage.is_empty()
    }

    pub fn damage_rect(&self) -> Rect {
        self.damage
    }

    /// Number of repaint passes that actually pushed spans.
    pub fn update_count(&self) -> u64 {
        self.updates
    }

    /// Repaint the damaged region through the span writer and clear damage.
    pub fn update(&mut self) {
        if self.damage.is_empty() {
            return;
        }
        let rect = self.damage;
        self.damage = Rect::default();

        let Some(writer) = self.span_writer.as_mut() else {
            trace!("Repaint skipped, no span writer registered");
            return;
        };

        let width = (rect.right - rect.left) as usize;
        self.scratch.resize(width, 0);
        for row in rect.top..rect.bottom {
            self.source.fill_span(rect.left, row, &mut self.scratch);
            writer(rect.left, row, rect.right, &self.scratch);
        }
        self.updates += 1;
    }

    /// Register an event listener; higher layers are offered events first,
    /// equal layers in registration order.
    pub fn add_listener<F>(&mut self, layer: i32, handler: F) -> ListenerId
    where
        F: FnMut(&Event) -> Propagation + 'static,
    {
        ListenerId(self.listeners.insert(
            ListenerEntry {
                layer,
                handler: Some(Box::new(handler)),
            },
            listener_order,
        ))
    }

    /// Move a listener to another layer.
    pub fn raise(&mut self, id: ListenerId, layer: i32) -> bool {
        match self.listeners.get_mut(id.0) {
            Some(entry) => entry.layer = layer,
            None => return false,
        }
        self.listeners.reorder(id.0, listener_order)
    }

    /// Unregister a listener. Unknown or already removed listeners are
    /// ignored.
    pub fn remove_listener(&mut self, id: ListenerId) {
        if !self.listeners.is_deleted(id.0) {
            let _ = self.listeners.delete(id.0);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Offer an event to the listeners, top layer first. Returns whether a
    /// listener consumed it.
    pub fn dispatch(&mut self, event: &Event) -> bool {
        let mut walk = match self.listeners.begin_walk() {
            Ok(walk) => walk,
            // Dispatch from inside a listener never reaches here: listeners
            // have no access to the screen.
            Err(_) => return false,
        };

        let mut consumed = false;
        while let Some(id) = self.listeners.walk_next(&mut walk) {
            if self.listeners.is_deleted(id) {
                continue;
            }
            let Some(mut handler) = self.listeners.get_mut(id).and_then(|e| e.handler.take())
            else {
                continue;
            };

            let outcome = handler(event);
            if let Some(entry) = self.listeners.get_mut(id) {
                entry.handler = Some(handler);
            }

            match outcome {
                Propagation::Continue => continue,
                Propagation::Stop => {
                    consumed = true;
                    break;
                }
                Propagation::Detach => {
                    let _ = self.listeners.delete(id);
                    consumed = true;
                    break;
                }
            }
        }
        self.listeners.end_walk(walk);

        trace!(?event, consumed, "Event dispatched");
        consumed
    }
}
