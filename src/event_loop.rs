// Copyright 2020 Joyent, Inc.

//! Single threaded scheduler: a mio readiness multiplexer plus a timer
//! queue.
//!
//! Everything runs on the thread that calls `poll`/`run_forever`.  A
//! callback runs to completion before the next one starts, and callbacks
//! may freely register, unregister and schedule through their own clone of
//! the `EventLoop` handle.
//!
//! mio reports readiness edge triggered, so read callbacks must consume
//! everything available (until `WouldBlock`) before returning.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_int;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use slog::{debug, error, info, o, trace, warn, Drain, Logger};

use crate::config::LoopConfig;
use crate::dispatch::{self, Failure};
use crate::error::HandlerError;
use crate::timer::{TimerCallback, TimerQueue};

/// Readiness reported for a registered handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub error: bool,
}

impl<'a> From<&'a Event> for Readiness {
    fn from(event: &'a Event) -> Readiness {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

type ReadCallback = Rc<RefCell<dyn FnMut(Token, Readiness) -> io::Result<()>>>;

/// Counters kept by the loop.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoopStats {
    pub iterations: u64,
    pub timers_run: u64,
    pub timers_failed: u64,
    /// Wall clock time spent inside timer callbacks.
    pub busy: Duration,
}

struct CrashGuard {
    remaining: Option<u32>,
    kill_handler: Option<TimerCallback>,
}

struct Inner {
    log: Logger,
    config: LoopConfig,
    started: Instant,
    poll: RefCell<Option<Poll>>,
    events: RefCell<Events>,
    readers: RefCell<HashMap<Token, ReadCallback>>,
    next_token: Cell<usize>,
    timers: RefCell<TimerQueue>,
    running: Cell<bool>,
    crash: RefCell<CrashGuard>,
    stats: Cell<LoopStats>,
}

/// Cheaply cloneable handle on one event loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.config.name)
            .field("readers", &self.inner.readers.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .field("running", &self.inner.running.get())
            .finish()
    }
}

fn shut_down() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "event loop has been shut down")
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Our SIGINT handler, installed for the duration of one `run_forever`.
/// Dropping it puts back whatever was there before.
struct InterruptGuard {
    previous: SigAction,
}

impl InterruptGuard {
    fn install() -> io::Result<InterruptGuard> {
        INTERRUPTED.store(false, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_interrupt),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic.
        let previous = unsafe { signal::sigaction(Signal::SIGINT, &action) }
            .map_err(io::Error::from)?;
        Ok(InterruptGuard { previous })
    }

    fn interrupted(&self) -> bool {
        INTERRUPTED.swap(false, Ordering::SeqCst)
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        // SAFETY: restores an action the kernel handed us.
        let _ = unsafe { signal::sigaction(Signal::SIGINT, &self.previous) };
    }
}

impl EventLoop {
    /// Fails if the multiplexer cannot be created or `crash_budget` is
    /// `Some(0)`.
    pub fn new(config: LoopConfig, log: Option<&Logger>) -> io::Result<EventLoop> {
        if config.crash_budget == Some(0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "crash_budget must be at least 1 (None disables it)",
            ));
        }
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("component" => "event_loop",
            "name" => config.name.clone()));
        let poll = Poll::new()?;
        let events = Events::with_capacity(config.event_capacity.max(1));
        let crash = CrashGuard {
            remaining: config.crash_budget,
            kill_handler: None,
        };
        info!(log, "started";
            "max_wait_ms" => config.max_wait.as_millis() as u64,
            "crash_budget" => format!("{:?}", config.crash_budget));

        Ok(EventLoop {
            inner: Rc::new(Inner {
                log,
                config,
                started: Instant::now(),
                poll: RefCell::new(Some(poll)),
                events: RefCell::new(events),
                readers: RefCell::new(HashMap::new()),
                next_token: Cell::new(0),
                timers: RefCell::new(TimerQueue::new()),
                running: Cell::new(true),
                crash: RefCell::new(crash),
                stats: Cell::new(LoopStats::default()),
            }),
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.log
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn stats(&self) -> LoopStats {
        self.inner.stats.get()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Number of handles currently registered for readability.
    pub fn registered(&self) -> usize {
        self.inner.readers.borrow().len()
    }

    /// Number of pending timer buckets.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Start watching `source` for readability.  The returned token
    /// identifies the registration and is passed to `callback`.
    pub fn register_read<S, F>(&self, source: &mut S, callback: F) -> io::Result<Token>
    where
        S: Source + ?Sized,
        F: FnMut(Token, Readiness) -> io::Result<()> + 'static,
    {
        let token = Token(self.inner.next_token.get());
        {
            let poll = self.inner.poll.borrow();
            let poll = poll.as_ref().ok_or_else(shut_down)?;
            poll.registry().register(source, token, Interest::READABLE)?;
        }
        self.inner.next_token.set(token.0 + 1);
        self.inner
            .readers
            .borrow_mut()
            .insert(token, Rc::new(RefCell::new(callback)));
        trace!(self.inner.log, "registered"; "token" => token.0);
        Ok(token)
    }

    /// Stop watching `source`.  Its callback is dropped; a callback that is
    /// running when it unregisters itself finishes normally.
    pub fn unregister_read<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.inner.readers.borrow_mut().remove(&token);
        trace!(self.inner.log, "unregistered"; "token" => token.0);
        let poll = self.inner.poll.borrow();
        match poll.as_ref() {
            Some(poll) => poll.registry().deregister(source),
            None => Ok(()),
        }
    }

    /// Run `callback` once `due` has passed.  Callbacks for the identical
    /// instant run together, in the order they were scheduled.  There is
    /// no cancellation; a callback that may outlive its purpose has to
    /// check for itself.
    pub fn run_at<F>(&self, due: Instant, callback: F)
    where
        F: FnOnce() -> Result<(), HandlerError> + 'static,
    {
        self.inner.timers.borrow_mut().schedule(due, Box::new(callback));
    }

    pub fn run_after<F>(&self, delay: Duration, callback: F) -> Instant
    where
        F: FnOnce() -> Result<(), HandlerError> + 'static,
    {
        let due = Instant::now() + delay;
        self.run_at(due, callback);
        due
    }

    /// Run a callback if the crash budget runs out.  Without one the loop
    /// stops instead.
    pub fn set_kill_handler<F>(&self, handler: F)
    where
        F: FnOnce() -> Result<(), HandlerError> + 'static,
    {
        self.inner.crash.borrow_mut().kill_handler = Some(Box::new(handler));
    }

    /// One iteration: wait for readiness or the next timer (at most
    /// `max_wait`), run ready callbacks, then run the earliest timer bucket
    /// if it is due.  Only one bucket runs per iteration; later overdue
    /// buckets make the next iteration's wait zero.
    pub fn poll(&self, max_wait: Duration) -> io::Result<()> {
        let log = &self.inner.log;
        let deadline = self.inner.timers.borrow().next_deadline();
        let active = !self.inner.readers.borrow().is_empty();

        let mut stats = self.inner.stats.get();
        stats.iterations += 1;
        self.inner.stats.set(stats);

        let wait = match deadline {
            Some(due) => due.saturating_duration_since(Instant::now()).min(max_wait),
            None => max_wait,
        };

        if !active && deadline.is_none() {
            warn!(log, "nothing registered and no timers pending, idling";
                "wait_ms" => max_wait.as_millis() as u64);
            if max_wait > Duration::from_secs(0) {
                thread::sleep(max_wait);
            }
            return Ok(());
        }

        if active {
            trace!(log, "waiting for readiness"; "wait_ms" => wait.as_millis() as u64);
            let ready = self.wait_ready(wait)?;
            trace!(log, "ready handles"; "count" => ready.len());
            for (token, readiness) in ready {
                let callback = self.inner.readers.borrow().get(&token).cloned();
                let callback = match callback {
                    Some(callback) => callback,
                    None => continue,
                };
                let result = (&mut *callback.borrow_mut())(token, readiness);
                if let Err(e) = result {
                    error!(log, "readiness callback failed";
                        "token" => token.0, "err" => %e);
                }
            }
        } else {
            trace!(log, "no handles, sleeping until timer"; "wait_ms" => wait.as_millis() as u64);
            if wait > Duration::from_secs(0) {
                thread::sleep(wait);
            }
        }

        let due = self.inner.timers.borrow_mut().pop_due(Instant::now());
        if let Some((_, bucket)) = due {
            for callback in bucket {
                self.run_guarded(callback);
            }
        }
        Ok(())
    }

    fn wait_ready(&self, wait: Duration) -> io::Result<Vec<(Token, Readiness)>> {
        let mut poll = self.inner.poll.borrow_mut();
        let poll = poll.as_mut().ok_or_else(shut_down)?;
        let mut events = self.inner.events.borrow_mut();
        match poll.poll(&mut events, Some(wait)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        }
        Ok(events
            .iter()
            .map(|event| (event.token(), Readiness::from(event)))
            .collect())
    }

    fn run_guarded(&self, callback: TimerCallback) {
        let started = Instant::now();
        let failure = match dispatch::catch(callback) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Failure::from_handler_error(&e)),
            Err(caught) => Some(Failure::from_panic(caught)),
        };

        let mut stats = self.inner.stats.get();
        stats.timers_run += 1;
        stats.busy += started.elapsed();
        if failure.is_some() {
            stats.timers_failed += 1;
        }
        self.inner.stats.set(stats);

        if let Some(failure) = failure {
            failure.log(&self.inner.log, None);
            self.charge_crash();
        }
    }

    fn charge_crash(&self) {
        let kill_handler = {
            let mut crash = self.inner.crash.borrow_mut();
            match crash.remaining {
                Some(remaining) if remaining > 0 => {
                    crash.remaining = Some(remaining - 1);
                    if remaining > 1 {
                        return;
                    }
                }
                _ => return,
            }
            crash.kill_handler.take()
        };

        error!(self.inner.log, "crash budget exhausted");
        match kill_handler {
            Some(handler) => self.run_guarded(handler),
            None => self.inner.running.set(false),
        }
    }

    /// Poll until `shutdown` is called or SIGINT arrives.  The previous
    /// SIGINT disposition is restored on return.
    pub fn run_forever(&self) -> io::Result<()> {
        let guard = if self.inner.config.handle_interrupt {
            Some(InterruptGuard::install()?)
        } else {
            None
        };
        let max_wait = self.inner.config.max_wait;
        while self.inner.running.get() {
            if guard.as_ref().map_or(false, InterruptGuard::interrupted) {
                info!(self.inner.log, "interrupted");
                self.shutdown();
                break;
            }
            self.poll(max_wait)?;
        }
        debug!(self.inner.log, "run_forever exiting"; "stats" => ?self.stats());
        Ok(())
    }

    /// Stop `run_forever` and release the multiplexer.  Registrations made
    /// afterwards fail.
    pub fn shutdown(&self) {
        if self.inner.running.replace(false) || self.inner.poll.borrow().is_some() {
            info!(self.inner.log, "shutting down";
                "uptime_ms" => self.uptime().as_millis() as u64);
        }
        self.inner.readers.borrow_mut().clear();
        self.inner.poll.borrow_mut().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    use mio::unix::SourceFd;
    use slog::Discard;

    fn new_loop(config: LoopConfig) -> EventLoop {
        EventLoop::new(config, Some(&Logger::root(Discard, o!()))).unwrap()
    }

    fn quiet() -> LoopConfig {
        LoopConfig {
            handle_interrupt: false,
            ..LoopConfig::default()
        }
    }

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str)
        -> impl FnOnce() -> Result<(), HandlerError> + 'static
    {
        let log = Rc::clone(log);
        move || {
            log.borrow_mut().push(tag);
            Ok(())
        }
    }

    #[test]
    fn identical_deadlines_fire_together_in_order() {
        let ev = new_loop(quiet());
        let fired = Rc::new(RefCell::new(Vec::new()));
        let due = Instant::now();
        ev.run_at(due, recorder(&fired, "first"));
        ev.run_at(due, recorder(&fired, "second"));
        assert_eq!(ev.pending_timers(), 1);

        ev.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(*fired.borrow(), vec!["first", "second"]);
        assert_eq!(ev.pending_timers(), 0);
    }

    #[test]
    fn zero_delay_fires_on_next_poll() {
        let ev = new_loop(quiet());
        let fired = Rc::new(RefCell::new(Vec::new()));
        ev.run_after(Duration::from_secs(0), recorder(&fired, "now"));
        ev.poll(Duration::from_secs(1)).unwrap();
        assert_eq!(*fired.borrow(), vec!["now"]);
    }

    #[test]
    fn one_overdue_bucket_per_iteration() {
        let ev = new_loop(quiet());
        let fired = Rc::new(RefCell::new(Vec::new()));
        let base = Instant::now();
        ev.run_at(base, recorder(&fired, "a"));
        ev.run_at(base + Duration::from_micros(1), recorder(&fired, "b"));
        thread::sleep(Duration::from_millis(2));

        let started = Instant::now();
        ev.poll(Duration::from_secs(1)).unwrap();
        assert_eq!(*fired.borrow(), vec!["a"]);
        ev.poll(Duration::from_secs(1)).unwrap();
        assert_eq!(*fired.borrow(), vec!["a", "b"]);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn wait_is_bounded_by_next_timer() {
        let ev = new_loop(quiet());
        let fired = Rc::new(RefCell::new(Vec::new()));
        ev.run_after(Duration::from_millis(20), recorder(&fired, "late"));
        let started = Instant::now();
        while fired.borrow().is_empty() {
            ev.poll(Duration::from_secs(5)).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn failing_timers_are_contained_and_counted() {
        let ev = new_loop(quiet());
        let fired = Rc::new(RefCell::new(Vec::new()));
        let due = Instant::now();
        ev.run_at(due, || Err("broken".into()));
        ev.run_at(due, || panic!("worse"));
        ev.run_at(due, recorder(&fired, "survivor"));
        ev.poll(Duration::from_millis(10)).unwrap();

        assert_eq!(*fired.borrow(), vec!["survivor"]);
        let stats = ev.stats();
        assert_eq!(stats.timers_run, 3);
        assert_eq!(stats.timers_failed, 2);
        assert!(ev.is_running());
    }

    #[test]
    fn exhausted_crash_budget_runs_kill_handler() {
        let ev = new_loop(LoopConfig {
            crash_budget: Some(2),
            ..quiet()
        });
        let fired = Rc::new(RefCell::new(Vec::new()));
        ev.set_kill_handler(recorder(&fired, "killed"));

        ev.run_after(Duration::from_secs(0), || Err("one".into()));
        ev.poll(Duration::from_millis(10)).unwrap();
        assert!(fired.borrow().is_empty());

        ev.run_after(Duration::from_secs(0), || Err("two".into()));
        ev.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(*fired.borrow(), vec!["killed"]);
        assert!(ev.is_running());
    }

    #[test]
    fn zero_crash_budget_is_rejected() {
        let config = LoopConfig {
            crash_budget: Some(0),
            ..quiet()
        };
        let err = EventLoop::new(config, Some(&Logger::root(Discard, o!())))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn first_failure_exhausts_budget_of_one() {
        let ev = new_loop(LoopConfig {
            crash_budget: Some(1),
            ..quiet()
        });
        let fired = Rc::new(RefCell::new(Vec::new()));
        ev.set_kill_handler(recorder(&fired, "killed"));
        ev.run_after(Duration::from_secs(0), || panic!("first"));
        ev.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(*fired.borrow(), vec!["killed"]);
    }

    #[test]
    fn exhausted_crash_budget_without_handler_stops() {
        let ev = new_loop(LoopConfig {
            crash_budget: Some(1),
            ..quiet()
        });
        ev.run_after(Duration::from_secs(0), || Err("fatal".into()));
        ev.run_forever().unwrap();
        assert!(!ev.is_running());
    }

    #[test]
    fn shutdown_from_timer_ends_run_forever() {
        let ev = new_loop(quiet());
        let handle = ev.clone();
        ev.run_after(Duration::from_millis(5), move || {
            handle.shutdown();
            Ok(())
        });
        ev.run_forever().unwrap();
        assert!(!ev.is_running());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        assert!(ev.register_read(&mut SourceFd(&fd), |_, _| Ok(())).is_err());
    }

    // The only test in this binary that touches SIGINT.
    #[test]
    fn interrupt_stops_loop_and_restores_previous_handler() {
        let ignore =
            SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let original =
            unsafe { signal::sigaction(Signal::SIGINT, &ignore) }.unwrap();

        let ev = new_loop(LoopConfig {
            handle_interrupt: true,
            max_wait: Duration::from_millis(10),
            ..quiet()
        });
        let fired = Rc::new(RefCell::new(Vec::new()));
        // Left over from an earlier loop; must not end this one.
        INTERRUPTED.store(true, Ordering::SeqCst);
        let sink = Rc::clone(&fired);
        ev.run_after(Duration::from_millis(5), move || {
            sink.borrow_mut().push("raised");
            signal::raise(Signal::SIGINT)?;
            Ok(())
        });
        ev.run_forever().unwrap();
        assert_eq!(*fired.borrow(), vec!["raised"]);
        assert!(!ev.is_running());

        let current =
            unsafe { signal::sigaction(Signal::SIGINT, &original) }.unwrap();
        assert_eq!(current.handler(), SigHandler::SigIgn);
    }

    #[test]
    fn readiness_callback_gets_token_and_mask() {
        let ev = new_loop(quiet());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let reader = server.try_clone().unwrap();
        let fd = server.as_raw_fd();
        let token = ev
            .register_read(&mut SourceFd(&fd), move |token, readiness| {
                let mut buf = [0u8; 16];
                let n = (&reader).read(&mut buf)?;
                sink.borrow_mut().push((token, readiness.readable, n));
                Ok(())
            })
            .unwrap();
        assert_eq!(ev.registered(), 1);

        client.write_all(b"hello").unwrap();
        for _ in 0..50 {
            ev.poll(Duration::from_millis(20)).unwrap();
            if !seen.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(*seen.borrow(), vec![(token, true, 5)]);

        ev.unregister_read(&mut SourceFd(&fd), token).unwrap();
        assert_eq!(ev.registered(), 0);
    }
}
