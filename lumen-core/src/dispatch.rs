//! Dispatch Loop
//!
//! Single-threaded cooperative scheduler. Each pass:
//!
//! 1. blocks in `poll(2)` on every watched descriptor plus the wakeup pipe,
//!    and invokes the callback of every descriptor reported ready;
//! 2. runs expired timeouts;
//! 3. runs every pending work item once;
//! 4. repaints attached screens that carry damage.
//!
//! Every queue is traversed with the snapshot walk from [`crate::queue`], so
//! callbacks may add or remove watchers, timeouts and work items (including
//! themselves) without disturbing the current pass. A callback returning
//! `false` (or `None` for timeouts) is retired.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use tracing::{debug, trace, warn};

use crate::error::{LumenError, Result};
use crate::queue::{NodeId, Order, Queue};
use crate::screen::Screen;

/// Priority class of a work item. Higher classes run first; redisplay runs
/// after everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkPriority {
    Redisplay = 0,
    Paint = 1,
    Layout = 2,
}

/// Direction a file watcher waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOps {
    Read,
    Write,
}

impl FileOps {
    fn poll_events(self) -> libc::c_short {
        match self {
            FileOps::Read => libc::POLLIN,
            FileOps::Write => libc::POLLOUT,
        }
    }
}

pub type WorkFn = Box<dyn FnMut(&mut Dispatcher) -> bool>;
pub type FileFn = Box<dyn FnMut(&mut Dispatcher, RawFd, FileOps) -> bool>;
pub type TimeoutFn = Box<dyn FnMut(&mut Dispatcher) -> Option<Duration>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkId(NodeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(NodeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(NodeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeId(NodeId);

struct Work {
    priority: WorkPriority,
    callback: Option<WorkFn>,
}

struct FileWatch {
    fd: RawFd,
    ops: FileOps,
    callback: Option<FileFn>,
}

struct Timeout {
    deadline: Instant,
    callback: Option<TimeoutFn>,
}

type WakeCondition = Box<dyn Fn() -> bool>;

fn work_order(candidate: &Work, existing: &Work) -> Order {
    Order::ascending(&Reverse(candidate.priority), &Reverse(existing.priority))
}

fn file_order(candidate: &FileWatch, existing: &FileWatch) -> Order {
    Order::ascending(&candidate.fd, &existing.fd)
}

fn timeout_order(candidate: &Timeout, existing: &Timeout) -> Order {
    Order::ascending(&candidate.deadline, &existing.deadline)
}

fn wake_order(_: &WakeCondition, _: &WakeCondition) -> Order {
    Order::ascending(&(), &())
}

/// Delete unless the callback already removed itself.
fn retire<T>(queue: &mut Queue<T>, id: NodeId) {
    if !queue.is_deleted(id) {
        let _ = queue.delete(id);
    }
}

/// Thread-safe handle that interrupts a blocked [`Dispatcher`] wait.
#[derive(Clone)]
pub struct Waker {
    pipe: Arc<File>,
}

impl Waker {
    pub fn wake(&self) -> Result<()> {
        match (&*self.pipe).write(&[1]) {
            Ok(_) => Ok(()),
            // Pipe full: a wakeup is already pending.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(LumenError::Wakeup(e)),
        }
    }
}

pub struct Dispatcher {
    work: Queue<Work>,
    files: Queue<FileWatch>,
    timeouts: Queue<Timeout>,
    screens: Vec<Rc<RefCell<Screen>>>,
    wake_conditions: Queue<WakeCondition>,
    wakeup: File,
    waker: Waker,
    running: bool,
    passes: u64,
}

impl Dispatcher {
    /// Create a dispatcher with its wakeup pipe.
    pub fn new() -> Result<Self> {
        let (rx, tx) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| LumenError::Wakeup(io::Error::from(e)))?;

        Ok(Self {
            work: Queue::new(),
            files: Queue::new(),
            timeouts: Queue::new(),
            screens: Vec::new(),
            wake_conditions: Queue::new(),
            wakeup: File::from(rx),
            waker: Waker {
                pipe: Arc::new(File::from(tx)),
            },
            running: false,
            passes: 0,
        })
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Number of completed passes.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn work_count(&self) -> usize {
        self.work.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn timeout_count(&self) -> usize {
        self.timeouts.len()
    }

    pub fn wake_condition_count(&self) -> usize {
        self.wake_conditions.len()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Queue a work item that runs once per pass until it returns `false`.
    pub fn add_work<F>(&mut self, priority: WorkPriority, callback: F) -> WorkId
    where
        F: FnMut(&mut Dispatcher) -> bool + 'static,
    {
        WorkId(self.work.insert(
            Work {
                priority,
                callback: Some(Box::new(callback)),
            },
            work_order,
        ))
    }

    pub fn remove_work(&mut self, id: WorkId) -> Result<()> {
        Ok(self.work.delete(id.0)?)
    }

    /// Watch a descriptor; the callback runs whenever it is ready and is
    /// retired when it returns `false`.
    pub fn watch_file<F>(&mut self, fd: RawFd, ops: FileOps, callback: F) -> Result<FileId>
    where
        F: FnMut(&mut Dispatcher, RawFd, FileOps) -> bool + 'static,
    {
        if fd < 0 {
            return Err(LumenError::InvalidDescriptor(fd));
        }
        debug!(fd, ?ops, "Watching file descriptor");
        Ok(FileId(self.files.insert(
            FileWatch {
                fd,
                ops,
                callback: Some(Box::new(callback)),
            },
            file_order,
        )))
    }

    pub fn remove_file(&mut self, id: FileId) -> Result<()> {
        Ok(self.files.delete(id.0)?)
    }

    /// Run `callback` once `delay` has elapsed. Returning `Some(next)` re-arms
    /// it `next` from now.
    pub fn add_timeout<F>(&mut self, delay: Duration, callback: F) -> TimeoutId
    where
        F: FnMut(&mut Dispatcher) -> Option<Duration> + 'static,
    {
        TimeoutId(self.timeouts.insert(
            Timeout {
                deadline: Instant::now() + delay,
                callback: Some(Box::new(callback)),
            },
            timeout_order,
        ))
    }

    pub fn remove_timeout(&mut self, id: TimeoutId) -> Result<()> {
        Ok(self.timeouts.delete(id.0)?)
    }

    /// Repaint `screen` at the end of every pass in which it is damaged.
    pub fn attach_screen(&mut self, screen: Rc<RefCell<Screen>>) {
        self.screens.push(screen);
    }

    pub fn detach_screen(&mut self, screen: &Rc<RefCell<Screen>>) {
        self.screens.retain(|s| !Rc::ptr_eq(s, screen));
    }

    /// A condition checked before blocking; while it holds the wait does not
    /// block.
    pub fn add_wake_condition<F>(&mut self, condition: F) -> WakeId
    where
        F: Fn() -> bool + 'static,
    {
        WakeId(self.wake_conditions.insert(Box::new(condition), wake_order))
    }

    pub fn remove_wake_condition(&mut self, id: WakeId) -> Result<()> {
        Ok(self.wake_conditions.delete(id.0)?)
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// Run passes until [`Dispatcher::quit`] is called from a callback.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        debug!("Entering dispatch loop");
        while self.running {
            self.dispatch_once(None)?;
        }
        debug!(passes = self.passes, "Dispatch loop finished");
        Ok(())
    }

    pub fn quit(&mut self) {
        self.running = false;
    }

    /// One full pass. `limit` caps how long the wait may block (`None` waits
    /// for the next event or timeout). Returns the number of ready watchers.
    pub fn dispatch_once(&mut self, limit: Option<Duration>) -> Result<usize> {
        let timeout = self.wait_timeout(limit);
        let ready = self.run_files(timeout)?;
        self.run_timeouts()?;
        self.run_work()?;
        self.repaint();
        self.passes += 1;
        Ok(ready)
    }

    fn wait_timeout(&self, limit: Option<Duration>) -> libc::c_int {
        let pending = self.wake_conditions.iter().any(|(_, c)| c())
            || self.screens.iter().any(|s| s.borrow().damaged());
        if pending {
            return 0;
        }

        let now = Instant::now();
        let next_timeout = self
            .timeouts
            .iter()
            .next()
            .map(|(_, t)| t.deadline.saturating_duration_since(now));

        let wait = match (next_timeout, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match wait {
            None => -1,
            // Round up so an almost-due timeout does not spin.
            Some(d) => {
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }

    fn run_files(&mut self, timeout: libc::c_int) -> Result<usize> {
        let mut walk = self.files.begin_walk()?;

        let mut ids = Vec::with_capacity(self.files.len());
        let mut polls = Vec::with_capacity(self.files.len() + 1);
        polls.push(libc::pollfd {
            fd: self.wakeup.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        while let Some(id) = self.files.walk_next(&mut walk) {
            if let Some(watch) = self.files.get(id) {
                ids.push(id);
                polls.push(libc::pollfd {
                    fd: watch.fd,
                    events: watch.ops.poll_events(),
                    revents: 0,
                });
            }
        }

        let rc = unsafe { libc::poll(polls.as_mut_ptr(), polls.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            self.files.end_walk(walk);
            if err.kind() == io::ErrorKind::Interrupted {
                // A signal (console switch) landed; let the rest of the pass
                // observe it.
                trace!("Wait interrupted by signal");
                return Ok(0);
            }
            return Err(LumenError::PollFailed(err));
        }

        if polls[0].revents != 0 {
            self.drain_wakeup();
        }

        let mut ready = 0;
        for (id, poll) in ids.iter().zip(&polls[1..]) {
            let mask = poll.events | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
            if poll.revents & mask == 0 || self.files.is_deleted(*id) {
                continue;
            }
            let Some((fd, ops, mut callback)) = self
                .files
                .get_mut(*id)
                .and_then(|w| w.callback.take().map(|cb| (w.fd, w.ops, cb)))
            else {
                continue;
            };

            ready += 1;
            let keep = callback(self, fd, ops);
            if self.files.is_deleted(*id) {
                continue;
            }
            if keep {
                if let Some(watch) = self.files.get_mut(*id) {
                    watch.callback = Some(callback);
                }
            } else {
                debug!(fd, "File watcher retired");
                retire(&mut self.files, *id);
            }
        }

        self.files.end_walk(walk);
        Ok(ready)
    }

    fn run_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut walk = self.timeouts.begin_walk()?;

        while let Some(id) = self.timeouts.walk_next(&mut walk) {
            if self.timeouts.is_deleted(id) {
                continue;
            }
            let due = self
                .timeouts
                .get(id)
                .map(|t| t.deadline <= now)
                .unwrap_or(false);
            if !due {
                continue;
            }
            let Some(mut callback) = self.timeouts.get_mut(id).and_then(|t| t.callback.take())
            else {
                continue;
            };

            let next = callback(self);
            if self.timeouts.is_deleted(id) {
                continue;
            }
            match next {
                Some(delay) => {
                    if let Some(timeout) = self.timeouts.get_mut(id) {
                        timeout.deadline = Instant::now() + delay;
                        timeout.callback = Some(callback);
                    }
                    self.timeouts.reorder(id, timeout_order);
                }
                None => retire(&mut self.timeouts, id),
            }
        }

        self.timeouts.end_walk(walk);
        Ok(())
    }

    fn run_work(&mut self) -> Result<()> {
        let mut walk = self.work.begin_walk()?;

        while let Some(id) = self.work.walk_next(&mut walk) {
            if self.work.is_deleted(id) {
                continue;
            }
            let Some(mut callback) = self.work.get_mut(id).and_then(|w| w.callback.take()) else {
                continue;
            };

            let keep = callback(self);
            if self.work.is_deleted(id) {
                continue;
            }
            if keep {
                if let Some(work) = self.work.get_mut(id) {
                    work.callback = Some(callback);
                }
            } else {
                retire(&mut self.work, id);
            }
        }

        self.work.end_walk(walk);
        Ok(())
    }

    fn repaint(&mut self) {
        for screen in &self.screens {
            let mut screen = screen.borrow_mut();
            if screen.damaged() {
                screen.update();
            }
        }
    }

    fn drain_wakeup(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wakeup.read(&mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "Failed to drain wakeup pipe");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_work_runs_by_priority() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        for (priority, name) in [
            (WorkPriority::Redisplay, "redisplay"),
            (WorkPriority::Layout, "layout"),
            (WorkPriority::Paint, "paint-a"),
            (WorkPriority::Paint, "paint-b"),
        ] {
            let log = log.clone();
            dispatcher.add_work(priority, move |_| {
                log.borrow_mut().push(name);
                true
            });
        }

        dispatcher.dispatch_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["layout", "paint-a", "paint-b", "redisplay"]
        );
    }

    #[test]
    fn test_work_returning_false_is_retired() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        dispatcher.add_work(WorkPriority::Paint, move |_| {
            r.set(r.get() + 1);
            false
        });

        dispatcher.dispatch_once(Some(Duration::ZERO)).unwrap();
        dispatcher.dispatch_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(runs.get(), 1);
        assert_eq!(dispatcher.work_count(), 0);
    }

    #[test]
    fn test_work_removes_itself_and_peer() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let runs = Rc::new(RefCell::new(Vec::new()));
        let own_id: Rc<Cell<Option<WorkId>>> = Rc::new(Cell::new(None));
        let peer_id: Rc<Cell<Option<WorkId>>> = Rc::new(Cell::new(None));

        let (r, own, peer) = (runs.clone(), own_id.clone(), peer_id.clone());
        let first = dispatcher.add_work(WorkPriority::Layout, move |d| {
            r.borrow_mut().push("first");
            d.remove_work(own.get().unwrap()).unwrap();
            d.remove_work(peer.get().unwrap()).unwrap();
            // Added mid-pass: not run this pass.
            let r2 = r.clone();
            d.add_work(WorkPriority::Layout, move |_| {
                r2.borrow_mut().push("late");
                true
            });
            true
        });
        let r = runs.clone();
        let second = dispatcher.add_work(WorkPriority::Paint, move |_| {
            r.borrow_mut().push("second");
            true
        });
        own_id.set(Some(first));
        peer_id.set(Some(second));

        dispatcher.dispatch_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*runs.borrow(), vec!["first"]);
        assert_eq!(dispatcher.work_count(), 1);

        dispatcher.dispatch_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*runs.borrow(), vec!["first", "late"]);
        assert!(dispatcher.remove_work(first).is_err());
    }

    #[test]
    fn test_file_watcher_fires_on_readable() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let (rx, tx) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let mut rx = File::from(rx);
        let mut tx = File::from(tx);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let fd = rx.as_raw_fd();
        dispatcher
            .watch_file(fd, FileOps::Read, move |_, _, ops| {
                assert_eq!(ops, FileOps::Read);
                let mut buf = [0u8; 8];
                let n = rx.read(&mut buf).unwrap_or(0);
                s.borrow_mut().extend_from_slice(&buf[..n]);
                n > 0
            })
            .unwrap();

        assert_eq!(dispatcher.dispatch_once(Some(Duration::ZERO)).unwrap(), 0);
        tx.write_all(b"hi").unwrap();
        assert_eq!(dispatcher.dispatch_once(Some(Duration::from_secs(1))).unwrap(), 1);
        assert_eq!(*seen.borrow(), b"hi".to_vec());
    }

    #[test]
    fn test_invalid_descriptor_is_rejected() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let err = dispatcher
            .watch_file(-1, FileOps::Read, |_, _, _| true)
            .unwrap_err();
        assert!(matches!(err, LumenError::InvalidDescriptor(-1)));
    }

    #[test]
    fn test_timeouts_fire_and_rearm() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        dispatcher.add_timeout(Duration::ZERO, move |_| {
            f.set(f.get() + 1);
            if f.get() < 3 {
                Some(Duration::ZERO)
            } else {
                None
            }
        });

        for _ in 0..5 {
            dispatcher.dispatch_once(Some(Duration::from_millis(5))).unwrap();
        }
        assert_eq!(fired.get(), 3);
        assert_eq!(dispatcher.timeout_count(), 0);
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let waker = dispatcher.waker();
        let handle = std::thread::spawn(move || waker.wake().unwrap());
        handle.join().unwrap();

        let started = Instant::now();
        dispatcher.dispatch_once(Some(Duration::from_secs(5))).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_damaged_screen_is_repainted() {
        let mut dispatcher = Dispatcher::new().unwrap();
        let screen = Rc::new(RefCell::new(Screen::new(4, 2)));
        let rows = Rc::new(Cell::new(0));
        let r = rows.clone();
        screen
            .borrow_mut()
            .set_span_writer(Box::new(move |_, _, _, _| r.set(r.get() + 1)));
        dispatcher.attach_screen(screen.clone());

        screen.borrow_mut().damage_all();
        dispatcher.dispatch_once(None).unwrap();
        assert_eq!(rows.get(), 2);
        assert!(!screen.borrow().damaged());
    }

    #[test]
    fn test_quit_stops_run() {
        let mut dispatcher = Dispatcher::new().unwrap();
        dispatcher.add_timeout(Duration::from_millis(1), |d| {
            d.quit();
            None
        });
        dispatcher.run().unwrap();
        assert!(dispatcher.passes() >= 1);
    }
}
