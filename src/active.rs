// Copyright 2020 Joyent, Inc.

//! An outbound connection that keeps itself connected.
//!
//! ```text
//!  startup --connect ok--> connecting --message--> running
//!     |                       |    ^                 |
//!     |                 lost  |    | connect ok      | lost / write failed
//!     v                       v    |                 v
//!     +--connect failed--> wait-retry <--------------+
//!
//!  close() from any state --> closed (terminal)
//! ```
//!
//! Retries are scheduled on the event loop with a delay of
//! `min(failures * step, cap)`; the failure count resets once a message
//! arrives.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use slog::{debug, info, o, Drain, Logger};

use crate::codec::{Kwargs, Message};
use crate::config::{LinkConfig, RetryPolicy};
use crate::dispatch::MethodRegistry;
use crate::error::LinkError;
use crate::event_loop::EventLoop;
use crate::link::{service_readable, FramedLink, LinkRole};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Startup,
    Connecting,
    WaitRetry,
    Running,
    Closed,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Startup => "startup",
            PeerState::Connecting => "connecting",
            PeerState::WaitRetry => "wait-retry",
            PeerState::Running => "running",
            PeerState::Closed => "closed",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called with the peer's name and its new state.
pub type StateChangeFn = Box<dyn FnMut(&str, PeerState)>;

struct Core {
    name: String,
    addr: SocketAddr,
    ev: EventLoop,
    target: Rc<MethodRegistry>,
    policy: RetryPolicy,
    link: RefCell<FramedLink>,
    state: Cell<PeerState>,
    failures: Cell<u32>,
    connects: Cell<u64>,
    log_budget: Cell<u32>,
    next_retry: Cell<Option<(Instant, Duration)>>,
    on_state_change: RefCell<Option<StateChangeFn>>,
    /// Transitions not yet reported to `on_state_change`.
    unreported: RefCell<VecDeque<PeerState>>,
    notifying: Cell<bool>,
    this: Weak<Core>,
}

impl LinkRole for Core {
    fn link(&self) -> &RefCell<FramedLink> {
        &self.link
    }

    fn target(&self) -> &MethodRegistry {
        &self.target
    }

    fn message_arrived(&self) {
        self.failures.set(0);
        self.update_state(PeerState::Running, "message received");
    }

    fn link_lost(&self, reason: LinkError) {
        self.link.borrow_mut().detach(&self.ev);
        self.schedule_retry();
        self.update_state(PeerState::WaitRetry, &reason.to_string());
    }
}

impl Core {
    fn log(&self) -> Logger {
        self.link.borrow().log.clone()
    }

    fn update_state(&self, new: PeerState, why: &str) {
        let old = self.state.get();
        if old == new {
            return;
        }
        self.state.set(new);

        let log = self.log();
        let budget = self.log_budget.get();
        if budget > 0 {
            self.log_budget.set(budget - 1);
            info!(log, "state changed";
                "from" => old.as_str(), "to" => new.as_str(), "why" => why);
        } else {
            debug!(log, "state changed";
                "from" => old.as_str(), "to" => new.as_str(), "why" => why);
        }

        self.unreported.borrow_mut().push_back(new);
        if !self.notifying.replace(true) {
            self.notify();
        }
    }

    /// Report queued transitions in order.  The callback may change the
    /// state again; those changes are queued and reported after it returns.
    fn notify(&self) {
        let mut callback = self.on_state_change.borrow_mut().take();
        loop {
            let next = self.unreported.borrow_mut().pop_front();
            let state = match next {
                Some(state) => state,
                None => break,
            };
            if let Some(callback) = callback.as_mut() {
                callback(&self.name, state);
            }
        }
        *self.on_state_change.borrow_mut() = callback;
        self.notifying.set(false);
    }

    fn try_connect(&self) {
        if self.state.get() == PeerState::Closed || self.link.borrow().is_open() {
            return;
        }

        let connected =
            TcpStream::connect_timeout(&self.addr, self.policy.connect_timeout)
                .and_then(|stream| {
                    stream.set_nodelay(true)?;
                    let weak = self.this.clone();
                    self.link.borrow_mut().attach(&self.ev, stream, move |_, _| {
                        if let Some(core) = weak.upgrade() {
                            service_readable(&*core);
                        }
                        Ok(())
                    })
                });

        match connected {
            Ok(()) => {
                self.failures.set(0);
                self.next_retry.set(None);
                self.connects.set(self.connects.get() + 1);
                self.update_state(PeerState::Connecting, "connected");
            }
            Err(e) => {
                let why = format!("connect to {} failed: {}", self.addr, e);
                self.update_state(PeerState::WaitRetry, &why);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&self) {
        let failures = self.failures.get().saturating_add(1);
        self.failures.set(failures);
        let delay = self.policy.delay_for(failures);
        debug!(self.log(), "retry scheduled";
            "failures" => failures, "delay_ms" => delay.as_millis() as u64);

        let weak = self.this.clone();
        let due = self.ev.run_after(delay, move || {
            if let Some(core) = weak.upgrade() {
                core.try_connect();
            }
            Ok(())
        });
        self.next_retry.set(Some((due, delay)));
    }

    fn close(&self) {
        self.link.borrow_mut().detach(&self.ev);
        self.next_retry.set(None);
        self.update_state(PeerState::Closed, "close called");
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.link.get_mut().detach(&self.ev);
    }
}

/// Connects to `addr` and reconnects whenever the connection is refused,
/// drops or fails a write, until `close` is called.
#[derive(Clone)]
pub struct ActivePeer {
    core: Rc<Core>,
}

impl fmt::Debug for ActivePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePeer")
            .field("name", &self.core.name)
            .field("addr", &self.core.addr)
            .field("state", &self.core.state.get())
            .finish()
    }
}

impl ActivePeer {
    /// Create the peer and make the first connection attempt right away.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        ev: &EventLoop,
        addr: SocketAddr,
        target: Rc<MethodRegistry>,
        name: &str,
        on_state_change: Option<StateChangeFn>,
        policy: RetryPolicy,
        config: &LinkConfig,
        log: Option<&Logger>,
    ) -> ActivePeer {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("name" => String::from(name),
            "target" => addr.to_string()));

        let core = Rc::new_cyclic(|this| Core {
            name: String::from(name),
            addr,
            ev: ev.clone(),
            target,
            policy,
            link: RefCell::new(FramedLink::new(log, config.max_payload)),
            state: Cell::new(PeerState::Startup),
            failures: Cell::new(0),
            connects: Cell::new(0),
            log_budget: Cell::new(config.state_log_limit),
            next_retry: Cell::new(None),
            on_state_change: RefCell::new(on_state_change),
            unreported: RefCell::new(VecDeque::new()),
            notifying: Cell::new(false),
            this: this.clone(),
        });
        core.try_connect();
        ActivePeer { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.core.addr
    }

    pub fn state(&self) -> PeerState {
        self.core.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.core.link.borrow().is_open()
    }

    /// Consecutive failed attempts since the last successful connect or
    /// received message.
    pub fn failures(&self) -> u32 {
        self.core.failures.get()
    }

    /// When the most recently scheduled reconnect attempt is due, and the
    /// back-off delay it was scheduled with.  `None` once connected or
    /// closed.
    pub fn next_retry(&self) -> Option<(Instant, Duration)> {
        self.core.next_retry.get()
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> u64 {
        self.core.connects.get()
    }

    pub fn messages_in(&self) -> u64 {
        self.core.link.borrow().messages_in
    }

    pub fn messages_out(&self) -> u64 {
        self.core.link.borrow().messages_out
    }

    /// Send `method(args)` if connected.  Returns whether the frame was
    /// written; while disconnected the message is dropped, and a failed
    /// write drops the connection and schedules a reconnect.
    pub fn invoke(&self, method: &str, args: Option<Kwargs>) -> bool {
        self.send(&Message::new(method, args))
    }

    pub fn send(&self, message: &Message) -> bool {
        if !self.is_open() {
            return false;
        }
        let result = self.core.link.borrow_mut().send(message);
        match result {
            Ok(()) => true,
            Err(LinkError::Protocol(e)) => {
                info!(self.core.log(), "message not sent";
                    "method" => &message.method, "err" => %e);
                false
            }
            Err(reason) => {
                self.core.link_lost(reason);
                false
            }
        }
    }

    /// Close the connection for good.  Pending retries find the peer
    /// closed and do nothing.
    pub fn close(&self) {
        self.core.close();
    }
}
