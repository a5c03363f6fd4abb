// Copyright 2020 Joyent, Inc.

//! Construction-time settings.  Every field has a default, so a host can
//! deserialize a partial JSON document into any of these.

use std::time::Duration;

use serde_derive::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub name: String,
    /// Upper bound on a single multiplexer wait in `run_forever`.
    pub max_wait: Duration,
    pub event_capacity: usize,
    /// The kill handler runs (or the loop stops) on the `n`th failed timer
    /// callback.  `None` tolerates any number; `Some(0)` is rejected by
    /// `EventLoop::new`.
    pub crash_budget: Option<u32>,
    /// Install a SIGINT handler in `run_forever` and shut down on interrupt.
    pub handle_interrupt: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            name: String::from("event_loop"),
            max_wait: Duration::from_secs(5),
            event_capacity: 128,
            crash_budget: None,
            handle_interrupt: true,
        }
    }
}

/// Reconnect back-off of an `ActivePeer`: linear in the number of
/// consecutive failures, capped.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub step: Duration,
    pub cap: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            step: Duration::from_millis(500),
            cap: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows the `failures`th consecutive
    /// failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        self.step
            .checked_mul(failures)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub max_payload: usize,
    /// State changes logged at info level before an active peer goes
    /// quiet and logs them at debug.
    pub state_log_limit: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            max_payload: 16 * 1024 * 1024,
            state_log_limit: 30,
        }
    }
}
