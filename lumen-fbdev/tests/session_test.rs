//! Integration tests for the framebuffer session.
//!
//! These tests drive the whole session lifecycle against the mock device
//! layer. A session is process-wide, so every test holds `SERIAL`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lumen_core::{Dispatcher, ErrorCategory, Event, Propagation, SpanSource};
use lumen_fbdev::config::InputConfig;
use lumen_fbdev::os::{KD_GRAPHICS, KD_TEXT, K_MEDIUMRAW, K_XLATE, VT_ACKACQ, VT_AUTO, VT_RELEASE};
use lumen_fbdev::{
    session_live, switch_pending, DeviceError, FbdevSession, MockOs, SessionOptions, SessionState,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

const FILL: u32 = 0xff20_4060;

/// Span source recording every requested row.
struct Recorder(Rc<RefCell<Vec<(i32, i32, usize)>>>);

impl SpanSource for Recorder {
    fn fill_span(&mut self, left: i32, top: i32, out: &mut [u32]) {
        self.0.borrow_mut().push((left, top, out.len()));
        out.fill(FILL);
    }
}

fn acquire(os: &Arc<MockOs>, dispatcher: &mut Dispatcher) -> FbdevSession<MockOs> {
    FbdevSession::acquire(os.clone(), dispatcher, &SessionOptions::default()).unwrap()
}

fn record(session: &FbdevSession<MockOs>) -> Rc<RefCell<Vec<(i32, i32, usize)>>> {
    let rows = Rc::new(RefCell::new(Vec::new()));
    session
        .screen()
        .borrow_mut()
        .set_span_source(Box::new(Recorder(rows.clone())));
    rows
}

fn listen(session: &FbdevSession<MockOs>) -> Rc<RefCell<Vec<Event>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    session.screen().borrow_mut().add_listener(0, move |event| {
        sink.borrow_mut().push(*event);
        Propagation::Continue
    });
    seen
}

/// Mock descriptors are never open in this process, so the console watcher
/// is reported ready on every pass and the wait must not block.
fn pass(dispatcher: &mut Dispatcher) {
    dispatcher.dispatch_once(Some(Duration::ZERO)).unwrap();
}

fn assert_full_repaint(rows: &[(i32, i32, usize)], width: usize, height: i32) {
    assert_eq!(rows.len(), height as usize);
    for (row, &(left, top, len)) in rows.iter().enumerate() {
        assert_eq!((left, top, len), (0, row as i32, width));
    }
}

#[test]
fn test_acquire_enters_graphics_without_owning_display() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();

    let session = acquire(&os, &mut dispatcher);
    assert!(session_live());
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!session.is_active());
    assert_eq!(session.vt_number(), 7);
    assert_eq!(session.previous_vt(), 1);
    assert_eq!(os.kd_mode(), KD_GRAPHICS);
    assert_eq!(os.kb_mode(), K_MEDIUMRAW);
    assert!(os.handler_installed());
    assert_eq!(os.maps(), 0);
    assert_eq!(dispatcher.work_count(), 1);
    assert_eq!(dispatcher.file_count(), 1);

    session.teardown(&mut dispatcher);
    assert!(!session_live());
}

#[test]
fn test_activate_configures_and_paints() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    let rows = record(&session);

    assert!(session.activate().unwrap());
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.is_vt_active());
    assert_eq!(os.foreground(), 7);
    assert_eq!(os.releases(), vec![VT_ACKACQ]);
    assert_eq!(os.var().bits_per_pixel, 32);
    assert_eq!(os.cmap_loads(), 1);
    assert_eq!(os.maps(), 1);
    assert!(!switch_pending());

    assert_full_repaint(&rows.borrow(), 640, 480);
    assert_eq!(os.pixel(0, 0), Some(FILL));
    assert_eq!(os.pixel(639, 479), Some(FILL));

    // Already in the foreground: nothing more to do.
    assert!(session.activate().unwrap());
    assert_eq!(os.activations(), vec![7]);

    session.teardown(&mut dispatcher);
}

#[test]
fn test_second_session_rejected_without_device_calls() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let session = acquire(&os, &mut dispatcher);
    let calls = os.calls();

    let other = Arc::new(MockOs::new());
    let err = FbdevSession::acquire(other.clone(), &mut dispatcher, &SessionOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, DeviceError::SessionExists));
    assert_eq!(err.category(), ErrorCategory::ResourceUnavailable);
    assert_eq!(other.calls(), 0);
    assert_eq!(os.calls(), calls);
    assert_eq!(dispatcher.work_count(), 1);

    // The first session is unaffected.
    assert!(session_live());
    assert_eq!(session.state(), SessionState::Ready);
    session.teardown(&mut dispatcher);
}

#[test]
fn test_failed_acquire_releases_everything() {
    let _guard = serial();

    let scenarios: [fn(&MockOs); 3] = [
        |os| os.remove_path("/dev/fb0"),
        |os| os.fail("fb_get_var"),
        |os| os.fail("vt_set_mode"),
    ];
    for setup in scenarios {
        let os = Arc::new(MockOs::new());
        setup(&os);
        let mut dispatcher = Dispatcher::new().unwrap();

        let err = FbdevSession::acquire(os.clone(), &mut dispatcher, &SessionOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.category(), ErrorCategory::ResourceUnavailable);
        assert!(!session_live());
        assert_eq!(os.opens(), os.closes());
        assert_eq!(os.signal_installs(), os.signal_restores());
        assert!(!os.handler_installed());
        assert_eq!(os.vt_mode().mode, VT_AUTO);
        assert_eq!(dispatcher.work_count(), 0);
        assert_eq!(dispatcher.file_count(), 0);
    }

    // A failed attempt leaves the slot free for the next one.
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    acquire(&os, &mut dispatcher).teardown(&mut dispatcher);
}

#[test]
fn test_no_console_available() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    os.remove_path("/dev/tty0");
    os.remove_path("/dev/vc/0");
    let mut dispatcher = Dispatcher::new().unwrap();

    let err = FbdevSession::acquire(os.clone(), &mut dispatcher, &SessionOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, DeviceError::ConsoleUnavailable(_)));
    assert_eq!(os.opens(), 0);
    assert_eq!(os.signal_installs(), 0);
    assert!(!session_live());
}

#[test]
fn test_switch_away_and_back_repaints_everything() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    let rows = record(&session);
    session.activate().unwrap();
    rows.borrow_mut().clear();

    // User switches to console 1.
    os.simulate_switch(1);
    assert!(switch_pending());
    pass(&mut dispatcher);
    assert!(!switch_pending());
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!session.is_active());
    assert!(!session.is_vt_active());
    assert_eq!(os.releases().last(), Some(&VT_RELEASE));
    assert_eq!(os.unmaps(), 1);

    // Drawing while away reaches neither the device nor the source.
    let memory = os.memory();
    session.write_span(0, 0, 4, &[0xdead_beef; 4]);
    session.screen().borrow_mut().damage(0, 0, 10, 10);
    pass(&mut dispatcher);
    assert_eq!(os.memory(), memory);
    assert!(rows.borrow().is_empty());

    // And back again.
    os.simulate_switch(7);
    pass(&mut dispatcher);
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(os.releases().last(), Some(&VT_ACKACQ));
    assert_eq!(os.maps(), 2);
    assert_full_repaint(&rows.borrow(), 640, 480);

    session.teardown(&mut dispatcher);
}

#[test]
fn test_spans_while_active_reach_memory() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    session.activate().unwrap();

    session.write_span(10, 5, 13, &[1, 2, 3]);
    assert_eq!(os.pixel(10, 5), Some(1));
    assert_eq!(os.pixel(12, 5), Some(3));
    assert_eq!(os.pixel(13, 5), Some(0xff00_0000));

    // Clipped at the right edge.
    session.write_span(638, 0, 642, &[7, 8, 9, 10]);
    assert_eq!(os.pixel(639, 0), Some(8));
    assert_eq!(os.pixel(0, 1), Some(0xff00_0000));

    session.teardown(&mut dispatcher);
}

#[test]
fn test_reactivation_failure_stays_ready() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    session.activate().unwrap();

    os.simulate_switch(1);
    pass(&mut dispatcher);

    os.reject_depth();
    os.simulate_switch(7);
    pass(&mut dispatcher);
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.is_vt_active());
    assert!(!session.is_active());
    assert_eq!(os.maps(), 1);

    let memory = os.memory();
    session.write_span(0, 0, 2, &[5, 5]);
    assert_eq!(os.memory(), memory);

    // The next round trip succeeds again.
    os.accept_depth();
    os.simulate_switch(1);
    pass(&mut dispatcher);
    assert!(!session.is_vt_active());
    os.simulate_switch(7);
    pass(&mut dispatcher);
    assert_eq!(session.state(), SessionState::Active);

    session.teardown(&mut dispatcher);
}

#[test]
fn test_mode_change_resizes_screen() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    let rows = record(&session);
    session.activate().unwrap();
    rows.borrow_mut().clear();

    os.simulate_switch(1);
    pass(&mut dispatcher);
    os.override_resolution(800, 600);
    os.simulate_switch(7);
    pass(&mut dispatcher);

    let screen = session.screen();
    assert_eq!((screen.borrow().width(), screen.borrow().height()), (800, 600));
    assert_full_repaint(&rows.borrow(), 800, 600);
    assert_eq!(os.pixel(799, 599), Some(FILL));

    session.teardown(&mut dispatcher);
}

#[test]
fn test_keyboard_events_and_hotkeys() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    let seen = listen(&session);
    session.activate().unwrap();

    // 'a' down and up, then Esc.
    os.push_input(&[30, 30 | 0x80, 1, 1 | 0x80]);
    pass(&mut dispatcher);
    assert_eq!(
        *seen.borrow(),
        vec![Event::KeyDown { key: 30 }, Event::KeyUp { key: 30 }]
    );
    assert_eq!(os.interrupts(), 1);

    // F2 asks for console 2; the switch away runs in the same pass.
    os.push_input(&[60, 60 | 0x80]);
    pass(&mut dispatcher);
    assert_eq!(os.activations().last(), Some(&2));
    assert_eq!(os.foreground(), 2);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(seen.borrow().len(), 2);

    session.teardown(&mut dispatcher);
}

#[test]
fn test_hotkeys_can_be_disabled() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut options = SessionOptions::default();
    options.hotkeys.vt_switch_keys = false;
    options.hotkeys.escape_interrupts = false;
    let session = FbdevSession::acquire(os.clone(), &mut dispatcher, &options).unwrap();
    let seen = listen(&session);

    os.push_input(&[1, 59]);
    pass(&mut dispatcher);
    assert_eq!(
        *seen.borrow(),
        vec![Event::KeyDown { key: 1 }, Event::KeyDown { key: 59 }]
    );
    assert_eq!(os.interrupts(), 0);
    assert!(os.activations().is_empty());

    session.teardown(&mut dispatcher);
}

#[test]
fn test_teardown_restores_console() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    session.activate().unwrap();

    session.teardown(&mut dispatcher);
    assert!(!session_live());
    assert!(!switch_pending());
    assert_eq!(os.kd_mode(), KD_TEXT);
    assert_eq!(os.kb_mode(), K_XLATE);
    assert_eq!(os.vt_mode().mode, VT_AUTO);
    assert_eq!(os.foreground(), 1);
    assert_eq!(os.opens(), os.closes());
    assert_eq!(os.maps(), os.unmaps());
    assert_eq!(os.signal_installs(), os.signal_restores());
    assert_eq!(dispatcher.work_count(), 0);
    assert_eq!(dispatcher.file_count(), 0);
    assert_eq!(dispatcher.wake_condition_count(), 0);

    // The dispatcher keeps running without the session.
    pass(&mut dispatcher);
}

#[test]
fn test_repeated_sessions_leave_no_registrations() {
    let _guard = serial();
    let mut dispatcher = Dispatcher::new().unwrap();

    for _ in 0..3 {
        let os = Arc::new(MockOs::new());
        let session = acquire(&os, &mut dispatcher);
        assert_eq!(dispatcher.wake_condition_count(), 1);
        session.teardown(&mut dispatcher);
    }
    assert_eq!(dispatcher.work_count(), 0);
    assert_eq!(dispatcher.file_count(), 0);
    assert_eq!(dispatcher.wake_condition_count(), 0);
}

#[test]
fn test_dropped_session_retires_its_work() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let session = acquire(&os, &mut dispatcher);

    drop(session);
    assert!(!session_live());
    assert_eq!(os.kd_mode(), KD_TEXT);

    pass(&mut dispatcher);
    assert_eq!(dispatcher.work_count(), 0);
}

#[test]
fn test_attach_inputs_routes_to_screen() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let mouse = dir.path().join("mice");
    // Left button down, 10 counts to the right.
    std::fs::write(&mouse, [0x09, 10, 0]).unwrap();

    let mut js = [0u8; 8];
    js[4..6].copy_from_slice(&1i16.to_ne_bytes());
    js[6] = 0x01;
    js[7] = 4;
    std::fs::write(dir.path().join("js0"), js).unwrap();

    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);
    let seen = listen(&session);

    let input = InputConfig {
        mouse_device: Some(mouse.to_string_lossy().into_owned()),
        joystick_dir: Some(dir.path().to_string_lossy().into_owned()),
        ..InputConfig::default()
    };
    assert_eq!(session.attach_inputs(&mut dispatcher, &input), 2);
    assert_eq!(dispatcher.file_count(), 3);

    pass(&mut dispatcher);
    let seen = seen.borrow();
    // Default acceleration: factor 2.25 at speed 10.
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::Motion(p) if (p.x, p.y) == (342, 240))));
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::ButtonDown(p) if p.buttons == 1)));
    assert!(seen.contains(&Event::JoyButton { control: 4, value: 1 }));

    session.teardown(&mut dispatcher);
}

#[test]
fn test_missing_input_devices_are_skipped() {
    let _guard = serial();
    let os = Arc::new(MockOs::new());
    let mut dispatcher = Dispatcher::new().unwrap();
    let mut session = acquire(&os, &mut dispatcher);

    let input = InputConfig {
        mouse_device: Some("/nonexistent/lumen/mice".to_string()),
        joystick_dir: Some("/nonexistent/lumen/input".to_string()),
        ..InputConfig::default()
    };
    assert_eq!(session.attach_inputs(&mut dispatcher, &input), 0);
    assert_eq!(dispatcher.file_count(), 1);

    session.teardown(&mut dispatcher);
}
