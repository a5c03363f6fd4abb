// Copyright 2020 Joyent, Inc.

//! Error types for the codec, the transport and the dispatch boundary.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// A malformed frame.  Fatal to the connection it arrived on, never to the
/// process.
#[derive(Debug)]
pub enum ProtocolError {
    /// The 10-byte length field is not a decimal number.
    BadHeader(Vec<u8>),
    /// The advertised payload is larger than the link accepts.
    Oversize { len: usize, max: usize },
    /// More bytes were fed than the codec asked for.
    Overrun { offered: usize, requested: usize },
    /// The payload does not decode to a `(method, arguments)` pair.
    Payload(serde_json::Error),
    /// The message could not be serialized.
    Encode(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadHeader(raw) => write!(
                f,
                "invalid frame length field: {:?}",
                String::from_utf8_lossy(raw)
            ),
            ProtocolError::Oversize { len, max } => write!(
                f,
                "frame payload of {} bytes exceeds the {} byte limit",
                len, max
            ),
            ProtocolError::Overrun { offered, requested } => write!(
                f,
                "fed {} bytes when only {} were requested",
                offered, requested
            ),
            ProtocolError::Payload(e) => {
                write!(f, "failed to decode frame payload: {}", e)
            }
            ProtocolError::Encode(e) => {
                write!(f, "failed to encode message: {}", e)
            }
        }
    }
}

impl StdError for ProtocolError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ProtocolError::Payload(e) | ProtocolError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

/// Anything that means the socket underneath a connection is gone.
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the connection (a read returned zero bytes).
    Closed,
    Reset,
    NotConnected,
    BrokenPipe,
    Io(io::Error),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransportError::Reset,
            io::ErrorKind::NotConnected => TransportError::NotConnected,
            io::ErrorKind::BrokenPipe => TransportError::BrokenPipe,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => {
                TransportError::Closed
            }
            _ => TransportError::Io(error),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => {
                write!(f, "read returned zero bytes, connection has terminated")
            }
            TransportError::Reset => write!(f, "connection reset by peer"),
            TransportError::NotConnected => {
                write!(f, "transport endpoint is not connected")
            }
            TransportError::BrokenPipe => write!(f, "broken pipe"),
            TransportError::Io(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Why a framed link stopped being usable.
#[derive(Debug)]
pub enum LinkError {
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl From<TransportError> for LinkError {
    fn from(error: TransportError) -> Self {
        LinkError::Transport(error)
    }
}

impl From<ProtocolError> for LinkError {
    fn from(error: ProtocolError) -> Self {
        LinkError::Protocol(error)
    }
}

impl From<io::Error> for LinkError {
    fn from(error: io::Error) -> Self {
        LinkError::Transport(TransportError::from(error))
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Transport(e) => e.fmt(f),
            LinkError::Protocol(e) => e.fmt(f),
        }
    }
}

impl StdError for LinkError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            LinkError::Transport(e) => Some(e),
            LinkError::Protocol(e) => Some(e),
        }
    }
}

/// Error type handlers return.
pub type HandlerError = Box<dyn StdError>;

/// A remote invocation that could not be carried out.  These are always
/// caught at the dispatch boundary and logged; they never reach the loop.
#[derive(Debug)]
pub enum DispatchError {
    UnknownMethod(String),
    BadArguments {
        method: String,
        source: serde_json::Error,
    },
    Handler {
        method: String,
        source: HandlerError,
    },
    Panicked {
        method: String,
        message: String,
        /// Where the panic happened, then the captured backtrace.
        trace: String,
    },
}

impl DispatchError {
    pub fn method(&self) -> &str {
        match self {
            DispatchError::UnknownMethod(method)
            | DispatchError::BadArguments { method, .. }
            | DispatchError::Handler { method, .. }
            | DispatchError::Panicked { method, .. } => method,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::UnknownMethod(method) => {
                write!(f, "no such method: {}", method)
            }
            DispatchError::BadArguments { method, source } => {
                write!(f, "bad arguments for {}: {}", method, source)
            }
            DispatchError::Handler { method, source } => {
                write!(f, "{} failed: {}", method, source)
            }
            DispatchError::Panicked { method, message, .. } => {
                write!(f, "{} panicked: {}", method, message)
            }
        }
    }
}

impl StdError for DispatchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            DispatchError::BadArguments { source, .. } => Some(source),
            DispatchError::Handler { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// The listening socket could not be set up.
#[derive(Debug)]
pub struct BindError {
    pub addr: String,
    pub source: io::Error,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to listen on {}: {}", self.addr, self.source)
    }
}

impl StdError for BindError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}
