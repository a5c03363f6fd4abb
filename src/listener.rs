// Copyright 2020 Joyent, Inc.

//! Accepts inbound connections and hands each one to a callback.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use mio::unix::SourceFd;
use mio::Token;
use nix::sys::socket::{listen, Backlog};
use slog::{debug, info, o, Drain, Logger};

use crate::error::BindError;
use crate::event_loop::EventLoop;

const LISTEN_BACKLOG: i32 = 4;

type AcceptFn = Box<dyn FnMut(TcpStream, SocketAddr)>;

struct Core {
    name: String,
    log: Logger,
    ev: EventLoop,
    local_addr: SocketAddr,
    socket: RefCell<Option<TcpListener>>,
    token: Cell<Option<Token>>,
    requests: Cell<u64>,
    on_accept: RefCell<AcceptFn>,
}

impl Core {
    /// Accept until the backlog is empty.  An accept error other than
    /// `WouldBlock` is returned to the event loop.
    fn accept_pending(&self) -> io::Result<()> {
        loop {
            let accepted = match self.socket.borrow().as_ref() {
                Some(socket) => socket.accept(),
                None => return Ok(()),
            };
            let (stream, from) = match accepted {
                Ok(conn) => conn,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(())
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.requests.set(self.requests.get() + 1);
            info!(self.log, "incoming connection"; "from" => %from);
            (&mut *self.on_accept.borrow_mut())(stream, from);
        }
    }

    fn close(&self) {
        let socket = match self.socket.borrow_mut().take() {
            Some(socket) => socket,
            None => return,
        };
        if let Some(token) = self.token.take() {
            let fd = socket.as_raw_fd();
            if let Err(e) = self.ev.unregister_read(&mut SourceFd(&fd), token) {
                debug!(self.log, "deregister failed"; "err" => %e);
            }
        }
        info!(self.log, "stopped listening";
            "requests" => self.requests.get());
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone)]
pub struct PassiveListener {
    core: Rc<Core>,
}

impl fmt::Debug for PassiveListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveListener")
            .field("name", &self.core.name)
            .field("local_addr", &self.core.local_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

fn bind_socket<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
    let socket = TcpListener::bind(addr)?;
    let backlog = Backlog::new(LISTEN_BACKLOG).map_err(io::Error::from)?;
    listen(&socket, backlog).map_err(io::Error::from)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl PassiveListener {
    /// Bind `addr`, listen and start accepting on `ev`.  Every accepted
    /// connection is passed to `on_accept` with the address it came from.
    pub fn bind<A, F>(
        ev: &EventLoop,
        addr: A,
        name: &str,
        on_accept: F,
        log: Option<&Logger>,
    ) -> Result<PassiveListener, BindError>
    where
        A: ToSocketAddrs + fmt::Debug,
        F: FnMut(TcpStream, SocketAddr) + 'static,
    {
        let bind_error = |source: io::Error| BindError {
            addr: format!("{:?}", addr),
            source,
        };
        let socket = bind_socket(&addr).map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;

        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("name" => String::from(name)));
        let fd = socket.as_raw_fd();

        let core = Rc::new(Core {
            name: String::from(name),
            log,
            ev: ev.clone(),
            local_addr,
            socket: RefCell::new(Some(socket)),
            token: Cell::new(None),
            requests: Cell::new(0),
            on_accept: RefCell::new(Box::new(on_accept)),
        });

        let weak: Weak<Core> = Rc::downgrade(&core);
        let token = ev
            .register_read(&mut SourceFd(&fd), move |_, _| match weak.upgrade() {
                Some(core) => core.accept_pending(),
                None => Ok(()),
            })
            .map_err(bind_error)?;
        core.token.set(Some(token));

        info!(core.log, "listening"; "address" => %local_addr);
        Ok(PassiveListener { core })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.core.socket.borrow().is_some()
    }

    /// Connections accepted so far.
    pub fn requests(&self) -> u64 {
        self.core.requests.get()
    }

    /// Stop accepting and release the socket.  Later calls do nothing.
    pub fn close(&self) {
        self.core.close();
    }
}
