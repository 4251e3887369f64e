//! Framebuffer Session
//!
//! Owns one virtual console and one framebuffer for the lifetime of the
//! process-wide session:
//!
//! ```text
//! acquire ──▶ Ready ◀──────────────┐
//!               │ switch signal      │
//!               ▼                    │
//!             Active ──signal──▶ SwitchingAway
//!
//! any state ──teardown / drop──▶ TornDown
//! ```
//!
//! A session value only exists once acquisition has succeeded, so there is
//! no observable state before `Ready`.
//!
//! The switch signal handler only raises [`SWITCH_PENDING`]; the session's
//! redisplay work item consumes the flag on the next dispatcher pass and
//! performs the actual hand-over with the kernel there.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lumen_core::{Dispatcher, Event, FileId, FileOps, Screen, WakeId, WorkId, WorkPriority};
use tracing::{debug, info, trace, warn};

use crate::config::InputConfig;
use crate::console::VirtualConsole;
use crate::error::{DeviceError, Result};
use crate::fb::FbDevice;
use crate::joystick::Joysticks;
use crate::keyboard::{classify, Hotkeys, KeyAction};
use crate::mouse::LinuxMouse;
use crate::os::DeviceOs;

/// Set while a session exists.
static SESSION_LIVE: AtomicBool = AtomicBool::new(false);

/// Raised by the console switch signal, consumed by the session work item.
static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);

/// Scan codes read per readiness notification.
const KEY_BATCH: usize = 16;

extern "C" fn on_console_switch(_signal: libc::c_int) {
    SWITCH_PENDING.store(true, Ordering::SeqCst);
}

/// Whether a console switch signal is waiting to be processed.
pub fn switch_pending() -> bool {
    SWITCH_PENDING.load(Ordering::SeqCst)
}

/// Whether a session currently owns the console.
pub fn session_live() -> bool {
    SESSION_LIVE.load(Ordering::SeqCst)
}

/// Claim on the process-wide session; released on drop.
struct SessionSlot(());

impl SessionSlot {
    fn claim() -> Option<Self> {
        SESSION_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SessionSlot(()))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        SESSION_LIVE.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Console and framebuffer held, display not owned.
    Ready,
    /// Display owned, pixels reach the hardware.
    Active,
    SwitchingAway,
    TornDown,
}

/// Parameters for [`FbdevSession::acquire`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Console to use; `None` or an unusable number picks the first free one.
    pub wanted_vt: Option<i32>,
    /// Signal the kernel sends on console release and acquire.
    pub switch_signal: i32,
    pub fb_device: String,
    pub hotkeys: Hotkeys,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            wanted_vt: None,
            switch_signal: libc::SIGUSR1,
            fb_device: "/dev/fb0".to_string(),
            hotkeys: Hotkeys::default(),
        }
    }
}

struct Inner<O: DeviceOs> {
    // Closed before the console.
    fb: FbDevice<O>,
    console: VirtualConsole<O>,
    screen: Rc<RefCell<Screen>>,
    hotkeys: Hotkeys,
    /// Our console is in the foreground.
    vt_active: bool,
    /// The framebuffer is configured and mapped.
    active: bool,
    state: SessionState,
}

impl<O: DeviceOs> Inner<O> {
    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, vt = self.console.number(), "Session state change");
            self.state = state;
        }
    }

    /// Hand the display over. Returns whether the screen geometry changed.
    fn switch(&mut self, activate: bool) -> bool {
        self.vt_active = activate;

        if !activate {
            self.set_state(SessionState::SwitchingAway);
            self.console.acknowledge_release();
            self.active = false;
            self.fb.unmap();
            self.set_state(SessionState::Ready);
            info!(vt = self.console.number(), "Display released");
            return false;
        }

        self.console.acknowledge_acquire();
        match self.fb.apply_config() {
            Ok(()) => {
                self.active = true;
                self.set_state(SessionState::Active);

                let (width, height) = (self.fb.width() as i32, self.fb.height() as i32);
                info!(vt = self.console.number(), width, height, "Display acquired");
                let Ok(mut screen) = self.screen.try_borrow_mut() else {
                    warn!("Screen busy, full repaint skipped");
                    return false;
                };
                let resized = (width, height) != (screen.width(), screen.height());
                if resized {
                    screen.resize(width, height);
                } else {
                    screen.damage_all();
                }
                resized
            }
            Err(e) => {
                warn!(error = %e, "Framebuffer reconfiguration failed, staying inactive");
                self.active = false;
                self.set_state(SessionState::Ready);
                false
            }
        }
    }

    fn put_span(&mut self, left: i32, top: i32, right: i32, pixels: &[u32]) {
        if self.active {
            self.fb.put_span(left, top, right, pixels);
        } else {
            trace!(left, top, right, "Span dropped, display not owned");
        }
    }

    /// Read pending scan codes, act on hotkeys and return the key events.
    fn read_keys(&mut self) -> Vec<Event> {
        let mut codes = [0u8; KEY_BATCH];
        let count = match self.console.read(&mut codes) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!(error = %e, "Console read failed");
                0
            }
        };

        let mut events = Vec::with_capacity(count);
        for &code in &codes[..count] {
            match classify(code, &self.hotkeys) {
                KeyAction::SwitchConsole(vt) => {
                    debug!(vt, "Console switch hotkey");
                    if let Err(e) = self.console.request_switch(vt) {
                        warn!(vt, error = %e, "Console switch request failed");
                    }
                }
                KeyAction::Interrupt => {
                    info!("Escape pressed, interrupting process group");
                    self.console.interrupt();
                }
                KeyAction::Deliver(event) => events.push(event),
                KeyAction::Ignore => {}
            }
        }
        events
    }

    fn shutdown(&mut self) {
        self.active = false;
        self.fb.unmap();
        self.console.restore();
        self.set_state(SessionState::TornDown);
    }
}

/// Consume a pending switch and repaint if we own the display. Returns
/// whether the screen geometry changed.
fn service<O: DeviceOs>(inner: &RefCell<Inner<O>>) -> bool {
    let mut resized = false;
    if SWITCH_PENDING.swap(false, Ordering::SeqCst) {
        let mut inner = inner.borrow_mut();
        let activate = !inner.vt_active;
        resized = inner.switch(activate);
    }

    let screen = {
        let inner = inner.borrow();
        if !inner.active {
            return resized;
        }
        inner.screen.clone()
    };
    // Spans flow back into `inner` through the span writer, so no borrow of
    // it may be held here.
    if let Ok(mut screen) = screen.try_borrow_mut() {
        if screen.damaged() {
            screen.update();
        }
    }
    resized
}

fn needs_pass<O: DeviceOs>(inner: &Weak<RefCell<Inner<O>>>) -> bool {
    let Some(inner) = inner.upgrade() else {
        return false;
    };
    if switch_pending() {
        return true;
    }
    let Ok(inner) = inner.try_borrow() else {
        return false;
    };
    inner.active
        && inner
            .screen
            .try_borrow()
            .map(|s| s.damaged())
            .unwrap_or(false)
}

struct Registration {
    work: WorkId,
    watcher: FileId,
    wake: WakeId,
}

/// The live console framebuffer session.
///
/// At most one exists per process. Dropping it (or calling
/// [`FbdevSession::teardown`]) gives the console back in text mode and
/// switches to the console that was in the foreground before.
pub struct FbdevSession<O: DeviceOs + 'static> {
    inner: Option<Rc<RefCell<Inner<O>>>>,
    screen: Rc<RefCell<Screen>>,
    mice: Rc<RefCell<Vec<LinuxMouse>>>,
    joysticks: Option<Joysticks>,
    registration: Option<Registration>,
    // Released last.
    _slot: SessionSlot,
}

impl<O: DeviceOs + 'static> FbdevSession<O> {
    /// Take over a virtual console and the framebuffer and register with
    /// `dispatcher`. The display is not owned yet; see
    /// [`FbdevSession::activate`].
    ///
    /// Fails with [`DeviceError::SessionExists`], without touching any
    /// device, while another session is live. Any other failure releases
    /// everything acquired so far.
    pub fn acquire(os: Arc<O>, dispatcher: &mut Dispatcher, options: &SessionOptions) -> Result<Self> {
        let slot = SessionSlot::claim().ok_or_else(|| {
            warn!("Framebuffer session already live");
            DeviceError::SessionExists
        })?;
        debug!(?options, "Acquiring framebuffer session");
        SWITCH_PENDING.store(false, Ordering::SeqCst);

        let mut console = VirtualConsole::acquire(os.clone(), options.wanted_vt)?;
        console.enter_graphics(options.switch_signal, on_console_switch)?;
        let fb = FbDevice::open(os, &options.fb_device)?;

        let (width, height) = (fb.width() as i32, fb.height() as i32);
        if width <= 0 || height <= 0 {
            return Err(DeviceError::ConfigurationRejected(format!(
                "framebuffer reports {width}x{height}"
            )));
        }

        let screen = Rc::new(RefCell::new(Screen::new(width, height)));
        let inner = Rc::new(RefCell::new(Inner {
            fb,
            console,
            screen: screen.clone(),
            hotkeys: options.hotkeys,
            vt_active: false,
            active: false,
            state: SessionState::Ready,
        }));

        let writer = Rc::downgrade(&inner);
        screen
            .borrow_mut()
            .set_span_writer(Box::new(move |left, top, right, pixels| {
                if let Some(inner) = writer.upgrade() {
                    if let Ok(mut inner) = inner.try_borrow_mut() {
                        inner.put_span(left, top, right, pixels);
                    }
                }
            }));

        let mut session = Self {
            inner: Some(inner),
            screen,
            mice: Rc::new(RefCell::new(Vec::new())),
            joysticks: None,
            registration: None,
            _slot: slot,
        };
        session.register(dispatcher)?;

        info!(
            vt = session.vt_number(),
            previous = session.previous_vt(),
            width,
            height,
            "Framebuffer session ready"
        );
        Ok(session)
    }

    fn register(&mut self, dispatcher: &mut Dispatcher) -> Result<()> {
        let inner = self.inner()?;
        let fd = inner.borrow().console.fd();

        let keys = Rc::downgrade(&inner);
        let screen = self.screen.clone();
        let watcher = dispatcher.watch_file(fd, FileOps::Read, move |_, _, _| {
            let Some(inner) = keys.upgrade() else {
                return false;
            };
            let events = inner.borrow_mut().read_keys();
            // Listeners may touch the session, so dispatch after the borrow
            // is gone.
            drop(inner);
            if let Ok(mut screen) = screen.try_borrow_mut() {
                for event in &events {
                    screen.dispatch(event);
                }
            }
            true
        })?;

        let work_inner = Rc::downgrade(&inner);
        let mice = self.mice.clone();
        let work = dispatcher.add_work(WorkPriority::Redisplay, move |_| {
            let Some(inner) = work_inner.upgrade() else {
                return false;
            };
            if service(&inner) {
                for mouse in mice.borrow().iter() {
                    mouse.screen_changed();
                }
            }
            true
        });

        let pending = Rc::downgrade(&inner);
        let wake = dispatcher.add_wake_condition(move || needs_pass(&pending));

        self.registration = Some(Registration {
            work,
            watcher,
            wake,
        });
        Ok(())
    }

    fn inner(&self) -> Result<Rc<RefCell<Inner<O>>>> {
        self.inner
            .clone()
            .ok_or_else(|| DeviceError::ConsoleUnavailable("session torn down".into()))
    }

    /// Bring our console to the foreground if needed, wait for it, then
    /// process the resulting switch. Returns whether the display is owned.
    pub fn activate(&mut self) -> Result<bool> {
        let inner = self.inner()?;
        {
            let inner = inner.borrow();
            if !inner.vt_active {
                let vt = inner.console.number();
                inner.console.request_switch(vt)?;
                inner.console.wait_active(vt)?;
            }
        }

        if service(&inner) {
            for mouse in self.mice.borrow().iter() {
                mouse.screen_changed();
            }
        }
        let active = inner.borrow().active;
        Ok(active)
    }

    /// Write one row of pixels straight to the display. Dropped silently
    /// while the display is not owned.
    pub fn write_span(&self, left: i32, top: i32, right: i32, pixels: &[u32]) {
        if let Some(inner) = self.inner.as_ref() {
            if let Ok(mut inner) = inner.try_borrow_mut() {
                inner.put_span(left, top, right, pixels);
            }
        }
    }

    /// Route mouse events to this session's screen and keep the pointer
    /// inside it across mode changes.
    pub fn attach_mouse(&mut self, mouse: LinuxMouse) {
        self.mice.borrow_mut().push(mouse);
    }

    /// Open the input devices named in `input`. Devices that cannot be
    /// opened are logged and skipped; returns how many were attached.
    pub fn attach_inputs(&mut self, dispatcher: &mut Dispatcher, input: &InputConfig) -> usize {
        let mut attached = 0;

        if let Some(path) = input.mouse_device.as_deref() {
            match LinuxMouse::open(path, self.screen.clone(), dispatcher, input.acceleration) {
                Ok(mouse) => {
                    self.attach_mouse(mouse);
                    attached += 1;
                }
                Err(e) => warn!(device = path, error = %e, "Mouse not available"),
            }
        }

        if let Some(dir) = input.joystick_dir.as_deref() {
            match Joysticks::open_all(dir, self.screen.clone(), dispatcher) {
                Ok(joysticks) => {
                    attached += joysticks.len();
                    if let Some(previous) = self.joysticks.replace(joysticks) {
                        previous.close(dispatcher);
                    }
                }
                Err(e) => warn!(dir, error = %e, "Joysticks not available"),
            }
        }

        attached
    }

    pub fn screen(&self) -> Rc<RefCell<Screen>> {
        self.screen.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .as_ref()
            .and_then(|i| i.try_borrow().ok().map(|i| i.state))
            .unwrap_or(SessionState::TornDown)
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|i| i.try_borrow().ok().map(|i| i.active))
            .unwrap_or(false)
    }

    pub fn is_vt_active(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|i| i.try_borrow().ok().map(|i| i.vt_active))
            .unwrap_or(false)
    }

    pub fn vt_number(&self) -> i32 {
        self.inner
            .as_ref()
            .map(|i| i.borrow().console.number())
            .unwrap_or(-1)
    }

    pub fn previous_vt(&self) -> i32 {
        self.inner
            .as_ref()
            .map(|i| i.borrow().console.previous())
            .unwrap_or(-1)
    }

    /// Unregister from `dispatcher` and release the console and framebuffer.
    pub fn teardown(mut self, dispatcher: &mut Dispatcher) {
        if let Some(registration) = self.registration.take() {
            if let Err(e) = dispatcher.remove_work(registration.work) {
                debug!(error = %e, "Session work item already gone");
            }
            if let Err(e) = dispatcher.remove_file(registration.watcher) {
                debug!(error = %e, "Console watcher already gone");
            }
            if let Err(e) = dispatcher.remove_wake_condition(registration.wake) {
                debug!(error = %e, "Wake condition already gone");
            }
        }
        for mouse in self.mice.borrow_mut().drain(..) {
            mouse.close(dispatcher);
        }
        if let Some(joysticks) = self.joysticks.take() {
            joysticks.close(dispatcher);
        }
        // Drop does the rest.
    }
}

impl<O: DeviceOs + 'static> Drop for FbdevSession<O> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            match inner.try_borrow_mut() {
                Ok(mut inner) => inner.shutdown(),
                Err(_) => warn!("Session busy during teardown, console left as is"),
            }
            if let Ok(mut screen) = self.screen.try_borrow_mut() {
                screen.clear_span_writer();
            }
            // Closes the framebuffer, then the console.
            drop(inner);
        }
        SWITCH_PENDING.store(false, Ordering::SeqCst);
        info!("Framebuffer session torn down");
    }
}
