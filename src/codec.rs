// Copyright 2020 Joyent, Inc.

//! Frame encoding and incremental reassembly.
//!
//! A frame is a 10 byte ASCII decimal length (right justified, space
//! padded) followed by exactly that many payload bytes.  The payload is the
//! JSON array `[method, arguments]` where `arguments` is an object or
//! `null`.

use std::convert::TryFrom;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 10;

/// Largest length the 10 digit header can carry.
pub const MAX_FRAME_PAYLOAD: u64 = 9_999_999_999;

/// `MAX_FRAME_PAYLOAD`, clamped to what this platform can address.
fn frame_limit() -> usize {
    usize::try_from(MAX_FRAME_PAYLOAD).unwrap_or(usize::MAX)
}

const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Keyword arguments of a remote invocation.
pub type Kwargs = Map<String, Value>;

/// One remote invocation: a method name and its optional keyword
/// arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub method: String,
    pub args: Option<Kwargs>,
}

impl Message {
    pub fn new<S: Into<String>>(method: S, args: Option<Kwargs>) -> Message {
        Message {
            method: method.into(),
            args,
        }
    }

    /// Build a message from a JSON object.  Anything other than an object
    /// (including `null`) is sent without arguments.
    pub fn with_value<S: Into<String>>(method: S, args: Value) -> Message {
        let args = match args {
            Value::Object(map) => Some(map),
            _ => None,
        };
        Message::new(method, args)
    }

    fn decode(payload: &[u8]) -> Result<Message, ProtocolError> {
        let (method, args): (String, Option<Kwargs>) =
            serde_json::from_slice(payload).map_err(ProtocolError::Payload)?;
        Ok(Message { method, args })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.args {
            Some(args) => {
                write!(f, "{}({})", self.method, Value::Object(args.clone()))
            }
            None => write!(f, "{}()", self.method),
        }
    }
}

/// Append the frame for `msg` to `buf`.
pub fn encode_message(
    msg: &Message,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(&(&msg.method, &msg.args))
        .map_err(ProtocolError::Encode)?;
    encode_frame(&payload, buf)
}

/// Append a raw frame carrying `payload` to `buf`.
pub fn encode_frame(
    payload: &[u8],
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if payload.len() > frame_limit() {
        return Err(ProtocolError::Oversize {
            len: payload.len(),
            max: frame_limit(),
        });
    }
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(format!("{:>10}", payload.len()).as_bytes());
    buf.put_slice(payload);
    Ok(())
}

fn parse_header(raw: &[u8]) -> Result<u64, ProtocolError> {
    std::str::from_utf8(raw)
        .ok()
        .map(str::trim)
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| digits.parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::BadHeader(raw.to_vec()))
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ReadState {
    Header,
    Payload(usize),
}

/// Per-connection reassembly state.
///
/// The caller reads at most `requested_read_size()` bytes from its socket
/// and hands them to `feed`.  Nothing is exposed until the whole frame has
/// been buffered.
#[derive(Debug)]
pub struct FrameCodec {
    pending: BytesMut,
    state: ReadState,
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new()
    }
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> FrameCodec {
        FrameCodec {
            pending: BytesMut::with_capacity(HEADER_LEN),
            state: ReadState::Header,
            max_payload: max_payload.min(frame_limit()),
        }
    }

    /// How many bytes the next read should ask for.  Always at least one.
    pub fn requested_read_size(&self) -> usize {
        match self.state {
            ReadState::Header => HEADER_LEN - self.pending.len(),
            ReadState::Payload(remaining) => remaining,
        }
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::Header && self.pending.is_empty()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.state = ReadState::Header;
    }

    /// Consume bytes read from the stream.  Returns the message once its
    /// frame is complete.  A zero length frame completes as soon as its
    /// header is in and carries no message.
    ///
    /// Any error leaves the codec reset; the stream it came from cannot be
    /// resynchronized and should be dropped.
    pub fn feed(
        &mut self,
        data: &[u8],
    ) -> Result<Option<Message>, ProtocolError> {
        match self.feed_frame(data) {
            Ok(Some(payload)) if payload.is_empty() => Ok(None),
            Ok(Some(payload)) => Message::decode(&payload).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Like `feed`, but hands back the raw payload of a completed frame.
    pub fn feed_frame(
        &mut self,
        data: &[u8],
    ) -> Result<Option<Bytes>, ProtocolError> {
        let requested = self.requested_read_size();
        if data.len() > requested {
            self.reset();
            return Err(ProtocolError::Overrun {
                offered: data.len(),
                requested,
            });
        }

        self.pending.extend_from_slice(data);
        match self.state {
            ReadState::Header if self.pending.len() < HEADER_LEN => Ok(None),
            ReadState::Header => {
                let len = match parse_header(&self.pending) {
                    Ok(len) => len,
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                };
                let len = match usize::try_from(len) {
                    Ok(len) if len <= self.max_payload => len,
                    _ => {
                        self.reset();
                        return Err(ProtocolError::Oversize {
                            len: usize::try_from(len).unwrap_or(usize::MAX),
                            max: self.max_payload,
                        });
                    }
                };
                self.pending.clear();
                if len == 0 {
                    return Ok(Some(Bytes::new()));
                }
                self.pending.reserve(len);
                self.state = ReadState::Payload(len);
                Ok(None)
            }
            ReadState::Payload(remaining) => {
                let remaining = remaining - data.len();
                if remaining > 0 {
                    self.state = ReadState::Payload(remaining);
                    return Ok(None);
                }
                self.state = ReadState::Header;
                Ok(Some(self.pending.split().freeze()))
            }
        }
    }
}
