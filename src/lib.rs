// Copyright 2020 Joyent, Inc.

//! msglink: fire-and-forget remote method invocation
//!
//! Two processes, possibly on different machines, call named methods on each
//! other's objects over a persistent TCP connection.  There is no response,
//! no acknowledgement and no correlation: a message is a method name plus
//! optional keyword arguments, and the receiving side runs it and moves on.
//! Both ends of a connection can send.
//!
//! Wire format
//!
//! Each message travels as one frame:
//!
//! * LENGTH   10 ASCII bytes, the decimal byte count of DATA, right
//!            justified and space padded (`"        13"`).  Only the numeric
//!            value matters when reading.
//!
//! * DATA     LENGTH bytes of JSON: the array `[method, arguments]` where
//!            `arguments` is an object of keyword arguments or `null`.
//!
//! A zero length frame is legal and carries no message.
//!
//! Pieces
//!
//! * `EventLoop` drives everything from one thread: socket readiness through
//!   mio, plus a queue of timers (`run_at`/`run_after`).
//! * `PassiveListener` accepts connections and hands each socket to a
//!   callback, which typically wraps it in a `PassivePeer`.
//! * `PassivePeer` serves an already connected socket until it breaks.
//! * `ActivePeer` connects out and keeps reconnecting with a capped linear
//!   back-off until it is closed.
//! * Inbound messages are dispatched on a `MethodRegistry`.  An unknown
//!   method, bad arguments, a handler error or a handler panic is logged as
//!   a structured record and never tears down the connection or the loop.
//!
//! Writes happen inline in `invoke` and block until the frame is on the
//! socket; there is no send queue.  Keep messages small.

#![allow(missing_docs)]

pub mod active;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event_loop;
mod link;
pub mod listener;
pub mod peer;
pub mod timer;

pub use crate::active::{ActivePeer, PeerState, StateChangeFn};
pub use crate::codec::{FrameCodec, Kwargs, Message};
pub use crate::config::{LinkConfig, LoopConfig, RetryPolicy};
pub use crate::dispatch::{dispatch, Failure, HandlerResult, MethodRegistry};
pub use crate::error::{
    BindError, DispatchError, HandlerError, LinkError, ProtocolError,
    TransportError,
};
pub use crate::event_loop::{EventLoop, LoopStats, Readiness};
pub use crate::listener::PassiveListener;
pub use crate::peer::PassivePeer;
