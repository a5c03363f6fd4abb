// Copyright 2020 Joyent, Inc.

//! Method registry and the dispatch boundary.
//!
//! A target is a `MethodRegistry`: a table from method name to handler.
//! `dispatch` looks a name up and runs the handler, turning an unknown
//! name, an argument mismatch, a returned error or a panic into a
//! structured log record.  Nothing escapes to the caller's event loop.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use serde::de::DeserializeOwned;
use serde_json::Value;
use slog::{debug, error, Logger};

use crate::codec::{Kwargs, Message};
use crate::error::{DispatchError, HandlerError};

pub type HandlerResult = Result<(), HandlerError>;

enum CallError {
    Arguments(serde_json::Error),
    Handler(HandlerError),
}

type MethodFn = Box<dyn Fn(Option<&Kwargs>) -> Result<(), CallError>>;

/// The capability surface of a target object.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodFn>,
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

impl MethodRegistry {
    pub fn new() -> MethodRegistry {
        MethodRegistry::default()
    }

    /// Register a handler that receives the keyword arguments as sent.
    /// Replaces any handler already registered under `name`.
    pub fn register<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Option<&Kwargs>) -> HandlerResult + 'static,
    {
        self.methods.insert(
            String::from(name),
            Box::new(move |args| handler(args).map_err(CallError::Handler)),
        );
        self
    }

    /// Register a handler whose parameters are the fields of `A`.  Missing
    /// arguments deserialize from an empty mapping, so `A` should give
    /// optional parameters a default.
    pub fn register_typed<A, F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        A: DeserializeOwned,
        F: Fn(A) -> HandlerResult + 'static,
    {
        self.methods.insert(
            String::from(name),
            Box::new(move |args| {
                let args = Value::Object(args.cloned().unwrap_or_default());
                let params: A = serde_json::from_value(args)
                    .map_err(CallError::Arguments)?;
                handler(params).map_err(CallError::Handler)
            }),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.methods.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Structured description of a failed invocation, as logged.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    /// `method-fail` when nothing was invoked, `exception` otherwise.
    pub fail: &'static str,
    pub kind: String,
    pub value: String,
    pub trace: String,
}

impl Failure {
    pub(crate) fn exception(kind: &str, value: String, trace: String) -> Failure {
        Failure {
            fail: "exception",
            kind: String::from(kind),
            value,
            trace,
        }
    }

    pub(crate) fn from_handler_error(error: &HandlerError) -> Failure {
        Failure::exception(
            "handler-error",
            error.to_string(),
            error_chain(error.as_ref()),
        )
    }

    pub(crate) fn from_panic(caught: Panic) -> Failure {
        Failure::exception("panic", caught.message, caught.trace)
    }

    pub fn log(&self, log: &Logger, args: Option<&Kwargs>) {
        let args = args
            .map(|a| Value::Object(a.clone()).to_string())
            .unwrap_or_default();
        if self.fail == "method-fail" {
            error!(log, "method fail";
                "fail" => self.fail,
                "kind" => &self.kind,
                "value" => &self.value,
                "args" => args);
        } else {
            error!(log, "invoked code failed";
                "fail" => self.fail,
                "type" => &self.kind,
                "value" => &self.value,
                "trace" => &self.trace,
                "args" => args);
        }
    }
}

impl<'a> From<&'a DispatchError> for Failure {
    fn from(error: &'a DispatchError) -> Failure {
        match error {
            DispatchError::UnknownMethod(method) => Failure {
                fail: "method-fail",
                kind: String::from("AttributeError"),
                value: method.clone(),
                trace: String::new(),
            },
            DispatchError::BadArguments { source, .. } => Failure::exception(
                "bad-arguments",
                source.to_string(),
                error_chain(source),
            ),
            DispatchError::Handler { source, .. } => {
                Failure::from_handler_error(source)
            }
            DispatchError::Panicked { message, trace, .. } => {
                Failure::exception("panic", message.clone(), trace.clone())
            }
        }
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut chain = vec![error.to_string()];
    let mut cause = error.source();
    while let Some(e) = cause {
        chain.push(e.to_string());
        cause = e.source();
    }
    chain.join("\ncaused by: ")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// A panic caught by `catch`.
#[derive(Debug)]
pub(crate) struct Panic {
    pub message: String,
    /// Panic location followed by the backtrace.
    pub trace: String,
}

thread_local! {
    static CATCHING: Cell<bool> = Cell::new(false);
    static LAST_PANIC: RefCell<Option<String>> = RefCell::new(None);
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the current one.  Panics raised inside `catch`
/// on this thread are recorded for the failure record instead of being
/// printed; all others go to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !CATCHING.with(Cell::get) {
                previous(info);
                return;
            }
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| String::from("unknown location"));
            let trace =
                format!("panicked at {}\n{}", location, Backtrace::force_capture());
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(trace));
        }));
    });
}

/// Run `f`, catching a panic together with where it happened.
pub(crate) fn catch<R, F>(f: F) -> Result<R, Panic>
where
    F: FnOnce() -> R,
{
    install_panic_hook();
    let outer = CATCHING.with(|c| c.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CATCHING.with(|c| c.set(outer));
    result.map_err(|payload| Panic {
        message: panic_message(&*payload),
        trace: LAST_PANIC
            .with(|last| last.borrow_mut().take())
            .unwrap_or_else(|| String::from("no trace captured")),
    })
}

/// Invoke `message` on `target`.  Failures are logged and returned for
/// inspection; callers are free to ignore them.
pub fn dispatch(
    target: &MethodRegistry,
    message: &Message,
    log: &Logger,
) -> Result<(), DispatchError> {
    let result = match target.methods.get(&message.method) {
        None => Err(DispatchError::UnknownMethod(message.method.clone())),
        Some(method) => {
            debug!(log, "dispatching"; "method" => &message.method);
            let args = message.args.as_ref();
            match catch(|| method(args)) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(CallError::Arguments(source))) => {
                    Err(DispatchError::BadArguments {
                        method: message.method.clone(),
                        source,
                    })
                }
                Ok(Err(CallError::Handler(source))) => {
                    Err(DispatchError::Handler {
                        method: message.method.clone(),
                        source,
                    })
                }
                Err(caught) => Err(DispatchError::Panicked {
                    method: message.method.clone(),
                    message: caught.message,
                    trace: caught.trace,
                }),
            }
        }
    };

    if let Err(e) = &result {
        Failure::from(e).log(log, message.args.as_ref());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};
    use std::io;
    use std::rc::Rc;

    use serde_derive::Deserialize;
    use serde_json::json;
    use slog::{o, Discard};

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    #[derive(Deserialize)]
    struct Resize {
        width: u32,
        #[serde(default)]
        height: Option<u32>,
    }

    #[test]
    fn unknown_method_is_a_method_fail_record() {
        let registry = MethodRegistry::new();
        let err = dispatch(&registry, &Message::new("nope", None), &log())
            .unwrap_err();
        let failure = Failure::from(&err);
        assert_eq!(failure.fail, "method-fail");
        assert_eq!(failure.kind, "AttributeError");
        assert_eq!(failure.value, "nope");
    }

    #[test]
    fn raw_handler_sees_arguments() {
        let seen = Rc::new(RefCell::new(None));
        let mut registry = MethodRegistry::new();
        let sink = Rc::clone(&seen);
        registry.register("store", move |args| {
            *sink.borrow_mut() = args.cloned();
            Ok(())
        });

        let msg = Message::with_value("store", json!({"key": "a", "val": 3}));
        dispatch(&registry, &msg, &log()).unwrap();
        assert_eq!(*seen.borrow(), msg.args);

        dispatch(&registry, &Message::new("store", None), &log()).unwrap();
        assert_eq!(*seen.borrow(), None);
    }

    #[test]
    fn typed_handler_binds_parameters() {
        let area = Rc::new(Cell::new(0));
        let mut registry = MethodRegistry::new();
        let out = Rc::clone(&area);
        registry.register_typed("resize", move |r: Resize| {
            out.set(r.width * r.height.unwrap_or(1));
            Ok(())
        });

        let msg = Message::with_value("resize", json!({"width": 4, "height": 5}));
        dispatch(&registry, &msg, &log()).unwrap();
        assert_eq!(area.get(), 20);

        let msg = Message::with_value("resize", json!({"width": 3}));
        dispatch(&registry, &msg, &log()).unwrap();
        assert_eq!(area.get(), 3);
    }

    #[test]
    fn argument_mismatch_is_reported() {
        let mut registry = MethodRegistry::new();
        registry.register_typed("resize", |_: Resize| Ok(()));
        let msg = Message::with_value("resize", json!({"width": "wide"}));
        match dispatch(&registry, &msg, &log()) {
            Err(e @ DispatchError::BadArguments { .. }) => {
                assert_eq!(e.method(), "resize");
                assert_eq!(Failure::from(&e).fail, "exception");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let err = dispatch(&registry, &Message::new("resize", None), &log())
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadArguments { .. }));
    }

    #[test]
    fn handler_error_and_panic_are_contained() {
        let calls = Rc::new(Cell::new(0));
        let mut registry = MethodRegistry::new();
        registry.register("fails", |_| {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire").into())
        });
        registry.register("panics", |_| panic!("handler bug"));
        let counter = Rc::clone(&calls);
        registry.register("works", move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        });

        let err = dispatch(&registry, &Message::new("fails", None), &log())
            .unwrap_err();
        let failure = Failure::from(&err);
        assert_eq!(failure.fail, "exception");
        assert_eq!(failure.kind, "handler-error");
        assert_eq!(failure.value, "disk on fire");

        let err = dispatch(&registry, &Message::new("panics", None), &log())
            .unwrap_err();
        let failure = Failure::from(&err);
        match err {
            DispatchError::Panicked { message, .. } => {
                assert_eq!(message, "handler bug")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(failure.kind, "panic");
        assert!(failure.trace.starts_with("panicked at "));
        assert!(failure.trace.contains("dispatch.rs:"));
        assert_ne!(failure.trace, "no trace captured");

        dispatch(&registry, &Message::new("works", None), &log()).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn registry_lists_names() {
        let mut registry = MethodRegistry::new();
        registry
            .register("b", |_| Ok(()))
            .register("a", |_| Ok(()));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
    }
}
