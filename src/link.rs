// Copyright 2020 Joyent, Inc.

//! The framed connection shared by both peer kinds.
//!
//! A `FramedLink` owns the socket, the reassembly state and the message
//! counters.  What happens when a message arrives or the link breaks is
//! up to the owning role, through `LinkRole`.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;

use bytes::BytesMut;
use mio::unix::SourceFd;
use mio::Token;
use slog::{debug, warn, Logger};

use crate::codec::{encode_message, FrameCodec, Message};
use crate::dispatch::{dispatch, MethodRegistry};
use crate::error::{LinkError, TransportError};
use crate::event_loop::{EventLoop, Readiness};

const READ_CHUNK: usize = 64 * 1024;

/// What one drain of the socket produced.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub messages: Vec<Message>,
    pub failure: Option<LinkError>,
}

pub(crate) struct FramedLink {
    pub log: Logger,
    stream: Option<TcpStream>,
    token: Option<Token>,
    peer_addr: Option<SocketAddr>,
    codec: FrameCodec,
    read_buf: Vec<u8>,
    pub messages_in: u64,
    pub messages_out: u64,
}

impl FramedLink {
    pub fn new(log: Logger, max_payload: usize) -> FramedLink {
        FramedLink {
            log,
            stream: None,
            token: None,
            peer_addr: None,
            codec: FrameCodec::with_max_payload(max_payload),
            read_buf: vec![0; READ_CHUNK],
            messages_in: 0,
            messages_out: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Take ownership of a connected socket and watch it for readability.
    pub fn attach<F>(
        &mut self,
        ev: &EventLoop,
        stream: TcpStream,
        on_ready: F,
    ) -> io::Result<()>
    where
        F: FnMut(Token, Readiness) -> io::Result<()> + 'static,
    {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let token = ev.register_read(&mut SourceFd(&fd), on_ready)?;
        self.peer_addr = stream.peer_addr().ok();
        self.codec.reset();
        self.stream = Some(stream);
        self.token = Some(token);
        Ok(())
    }

    /// Unregister and close the socket.  Returns false if it was already
    /// closed.
    pub fn detach(&mut self, ev: &EventLoop) -> bool {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => return false,
        };
        if let Some(token) = self.token.take() {
            let fd = stream.as_raw_fd();
            if let Err(e) = ev.unregister_read(&mut SourceFd(&fd), token) {
                debug!(self.log, "deregister failed"; "err" => %e);
            }
        }
        drop(stream);
        self.codec.reset();
        true
    }

    /// Read everything the socket has, at most `requested_read_size()`
    /// bytes at a time, stopping at `WouldBlock` or the first failure.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();
        loop {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => break,
            };
            let want = self.codec.requested_read_size().min(self.read_buf.len());
            let n = match stream.read(&mut self.read_buf[..want]) {
                Ok(0) => {
                    drained.failure = Some(TransportError::Closed.into());
                    break;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drained.failure = Some(e.into());
                    break;
                }
            };
            match self.codec.feed(&self.read_buf[..n]) {
                Ok(Some(message)) => {
                    self.messages_in += 1;
                    drained.messages.push(message);
                }
                Ok(None) => {}
                Err(e) => {
                    drained.failure = Some(e.into());
                    break;
                }
            }
        }
        drained
    }

    /// Encode and write one frame, blocking until it is fully written.
    pub fn send(&mut self, message: &Message) -> Result<(), LinkError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(LinkError::Transport(TransportError::NotConnected))?;
        let mut buf = BytesMut::new();
        encode_message(message, &mut buf)?;

        stream.set_nonblocking(false)?;
        let written = stream.write_all(&buf);
        let restored = stream.set_nonblocking(true);
        written?;
        restored?;
        self.messages_out += 1;
        Ok(())
    }
}

/// Role specific reactions of a link owner.
pub(crate) trait LinkRole {
    fn link(&self) -> &RefCell<FramedLink>;

    fn target(&self) -> &MethodRegistry;

    /// A message was reassembled and is about to be dispatched.
    fn message_arrived(&self) {}

    /// The link failed.  The role decides whether it is discarded or
    /// reconnected.
    fn link_lost(&self, reason: LinkError);
}

/// Readiness handler common to every role: drain the socket, dispatch what
/// arrived, then report a failure if the drain ended in one.
pub(crate) fn service_readable<R: LinkRole + ?Sized>(role: &R) {
    let drained = role.link().borrow_mut().drain();
    let log = role.link().borrow().log.clone();

    for message in drained.messages {
        if !role.link().borrow().is_open() {
            debug!(log, "link closed by handler, dropping message";
                "method" => &message.method);
            continue;
        }
        role.message_arrived();
        let _ = dispatch(role.target(), &message, &log);
    }

    if let Some(reason) = drained.failure {
        if role.link().borrow().is_open() {
            warn!(log, "link lost"; "reason" => %reason);
            role.link_lost(reason);
        }
    }
}
