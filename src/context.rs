//! Tracing context and the per-event handler registry.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::error::{CallbackError, Error, Result};
use crate::event::{Classifier, Event};
use crate::trace::{self, Restart, TraceOptions};
use crate::tracee::Pid;

/// Tag of each [`Event`] variant, plus `Error` for handler failures.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    Exited,
    Terminated,
    SyscallStop,
    Forked,
    VForked,
    Cloned,
    Execd,
    VForkDone,
    ExitIntent,
    GroupStop,
    GenuineSignal,
    GenuineTrap,
    Unknown,
    Error,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        use EventKind::*;

        match self {
            Exited => "exit",
            Terminated => "terminate",
            SyscallStop => "syscall",
            Forked => "fork",
            VForked => "vfork",
            Cloned => "clone",
            Execd => "exec",
            VForkDone => "vfork-done",
            ExitIntent => "exit-intent",
            GroupStop => "group-stop",
            GenuineSignal => "signal",
            GenuineTrap => "trap",
            Unknown => "unknown",
            Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the driving loop should do after an event was handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Keep tracing the tracee.
    Continue,

    /// Stop tracing this tracee, e.g. by detaching from it.
    Detach,

    /// Stop tracing altogether.
    Abort,
}

impl Default for Flow {
    fn default() -> Self {
        Flow::Continue
    }
}

pub type CallbackResult = std::result::Result<Flow, CallbackError>;

type EventHandler = Box<dyn FnMut(Pid, &Event) -> CallbackResult>;
type ErrorHandler = Box<dyn FnMut(Pid, &Error) -> Flow>;

/// Mapping from event kind to callback. Each callback owns its own captured state.
#[derive(Default)]
pub struct Handlers {
    events: HashMap<EventKind, EventHandler>,
    error: Option<ErrorHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`, replacing any previous one.
    ///
    /// Fails with [`Error::ErrorKindHandler`] for [`EventKind::Error`], whose handler
    /// is registered with [`Handlers::on_error()`].
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> Result<&mut Self>
    where
        F: FnMut(Pid, &Event) -> CallbackResult + 'static,
    {
        if kind == EventKind::Error {
            return Err(Error::ErrorKindHandler);
        }

        self.events.insert(kind, Box::new(handler));

        Ok(self)
    }

    /// Register `handler` to run when an event handler fails.
    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(Pid, &Error) -> Flow + 'static,
    {
        self.error = Some(Box::new(handler));
        self
    }

    /// Unregister the handler for `kind`. Returns `true` if there was one.
    pub fn remove(&mut self, kind: EventKind) -> bool {
        if kind == EventKind::Error {
            self.error.take().is_some()
        } else {
            self.events.remove(&kind).is_some()
        }
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        if kind == EventKind::Error {
            self.error.is_some()
        } else {
            self.events.contains_key(&kind)
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.events.keys().map(EventKind::name).collect();
        kinds.sort_unstable();

        f.debug_struct("Handlers")
            .field("events", &kinds)
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Trace configuration and event dispatch for one tracer thread.
///
/// A context never resumes a tracee. Its [`Flow`] results tell the driving loop what to
/// do next, and the loop restarts tracees in the context's [`Restart`] mode.
#[derive(Debug)]
pub struct Context {
    options: TraceOptions,
    step: Restart,
    detect_group_stop: bool,
    eldest: Option<Pid>,
    attach: bool,
    error: Option<Error>,
    handlers: Handlers,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            options: trace::supported_options(),
            step: Restart::default(),
            detect_group_stop: false,
            eldest: None,
            attach: false,
            error: None,
            handlers: Handlers::new(),
        }
    }

    /// Options to request for new tracees.
    pub fn options(&self) -> TraceOptions {
        self.options
    }

    pub fn set_options(&mut self, options: TraceOptions) {
        self.options = options & trace::supported_options();
    }

    /// Restart mode the driving loop should use.
    pub fn step(&self) -> Restart {
        self.step
    }

    pub fn set_step(&mut self, step: Restart) {
        self.step = step;
    }

    pub fn detect_group_stop(&self) -> bool {
        self.detect_group_stop
    }

    pub fn set_detect_group_stop(&mut self, detect: bool) {
        self.detect_group_stop = detect;
    }

    /// First tracee, spawned or attached.
    pub fn eldest(&self) -> Option<Pid> {
        self.eldest
    }

    /// True if tracing of the eldest tracee began with an attach.
    pub fn attached(&self) -> bool {
        self.attach
    }

    /// Record the first tracee, and whether it was attached to rather than spawned.
    pub fn set_eldest(&mut self, pid: Pid, attach: bool) {
        self.eldest = Some(pid);
        self.attach = attach;
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut Handlers {
        &mut self.handlers
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new().detect_group_stop(self.detect_group_stop)
    }

    /// Last recorded handler failure, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Take the last recorded handler failure, clearing it.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Run the handler registered for `event`, if any.
    ///
    /// Without a handler, the event is ignored and the result is [`Flow::Continue`]. If
    /// the handler fails, its error is recorded and the error handler decides the flow.
    /// Without an error handler, a failure aborts.
    pub fn dispatch(&mut self, pid: Pid, event: &Event) -> Flow {
        let kind = event.kind();

        let handler = match self.handlers.events.get_mut(&kind) {
            Some(handler) => handler,
            None => return Flow::Continue,
        };

        match handler(pid, event) {
            Ok(flow) => {
                debug!(pid = pid.as_raw(), %kind, ?flow, "dispatched event");
                flow
            },
            Err(source) => {
                let err = Error::Callback { kind, source };

                debug!(pid = pid.as_raw(), %kind, %err, "event handler failed");

                let flow = match &mut self.handlers.error {
                    Some(on_error) => on_error(pid, &err),
                    None => Flow::Abort,
                };

                self.error = Some(err);

                flow
            },
        }
    }

    /// Classify the wait `status` of `pid` and dispatch the resulting event.
    pub fn handle(&mut self, pid: Pid, status: i32) -> Result<(Event, Flow)> {
        let event = self.classifier().classify(pid, status)?;
        let flow = self.dispatch(pid, &event);

        Ok((event, flow))
    }
}
