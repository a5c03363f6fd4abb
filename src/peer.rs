// Copyright 2020 Joyent, Inc.

//! A peer on an already connected socket.  Any failure ends it for good.

use std::cell::RefCell;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::rc::{Rc, Weak};

use slog::{info, o, Drain, Logger};

use crate::codec::{Kwargs, Message};
use crate::config::LinkConfig;
use crate::dispatch::MethodRegistry;
use crate::error::LinkError;
use crate::event_loop::EventLoop;
use crate::link::{service_readable, FramedLink, LinkRole};

type DisconnectFn = Box<dyn FnOnce()>;

struct Core {
    name: String,
    ev: EventLoop,
    target: Rc<MethodRegistry>,
    link: RefCell<FramedLink>,
    on_disconnect: RefCell<Option<DisconnectFn>>,
}

impl LinkRole for Core {
    fn link(&self) -> &RefCell<FramedLink> {
        &self.link
    }

    fn target(&self) -> &MethodRegistry {
        &self.target
    }

    fn link_lost(&self, reason: LinkError) {
        let log = self.link.borrow().log.clone();
        info!(log, "connection lost"; "reason" => %reason);
        let notify = self.on_disconnect.borrow_mut().take();
        if let Some(notify) = notify {
            notify();
        }
        self.close();
    }
}

impl Core {
    fn close(&self) -> bool {
        let mut link = self.link.borrow_mut();
        let closed = link.detach(&self.ev);
        if closed {
            info!(link.log, "closed";
                "msgs_in" => link.messages_in,
                "msgs_out" => link.messages_out);
        }
        closed
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.link.get_mut().detach(&self.ev);
    }
}

/// Serves one connected socket: inbound messages are dispatched on
/// `target`, outbound ones are written with `invoke`.
#[derive(Clone)]
pub struct PassivePeer {
    core: Rc<Core>,
}

impl fmt::Debug for PassivePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassivePeer")
            .field("name", &self.core.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PassivePeer {
    /// Wrap `stream` and start serving it.  `on_disconnect` runs once if
    /// the connection breaks (not on an explicit `close`).
    pub fn new(
        ev: &EventLoop,
        stream: TcpStream,
        target: Rc<MethodRegistry>,
        name: &str,
        on_disconnect: Option<Box<dyn FnOnce()>>,
        config: &LinkConfig,
        log: Option<&Logger>,
    ) -> std::io::Result<PassivePeer> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("name" => String::from(name)));
        let core = Rc::new(Core {
            name: String::from(name),
            ev: ev.clone(),
            target,
            link: RefCell::new(FramedLink::new(log, config.max_payload)),
            on_disconnect: RefCell::new(on_disconnect),
        });

        let weak: Weak<Core> = Rc::downgrade(&core);
        core.link.borrow_mut().attach(ev, stream, move |_, _| {
            if let Some(core) = weak.upgrade() {
                service_readable(&*core);
            }
            Ok(())
        })?;
        {
            let link = core.link.borrow();
            info!(link.log, "serving connection";
                "peer" => format!("{:?}", link.peer_addr()));
        }
        Ok(PassivePeer { core })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_open(&self) -> bool {
        self.core.link.borrow().is_open()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.link.borrow().peer_addr()
    }

    pub fn messages_in(&self) -> u64 {
        self.core.link.borrow().messages_in
    }

    pub fn messages_out(&self) -> u64 {
        self.core.link.borrow().messages_out
    }

    /// Send `method(args)` to the other end.  The frame is written before
    /// this returns.
    pub fn invoke(
        &self,
        method: &str,
        args: Option<Kwargs>,
    ) -> Result<(), LinkError> {
        self.send(&Message::new(method, args))
    }

    pub fn send(&self, message: &Message) -> Result<(), LinkError> {
        self.core.link.borrow_mut().send(message)
    }

    /// Unregister and close the socket.  Later calls do nothing.
    pub fn close(&self) {
        self.core.close();
    }
}
