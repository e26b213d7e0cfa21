//! Instance lifecycle
//!
//! The host creates exactly one instance and then streams events at it, one
//! callback at a time. The application registers its handlers later, from
//! its own init path, so anything that arrives first is held back:
//!
//! ```text
//! Uninitialized --DidCreate--> AwaitingHandlers --register--> Active --DidDestroy--> Destroyed
//! ```
//!
//! Events received while awaiting handlers are queued in arrival order. On
//! registration the creation arguments go to `did_create`, then the queue is
//! replayed, all under the state lock, so a freshly delivered event can never
//! overtake a queued one.

use super::error::{SyscallError, SyscallResult};
use super::events::{HostEvent, InputEvent, Resource, View};
use super::websocket::WebSocket;
use crate::lock;
use crate::platform::{Host, LogLevel};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Application callbacks. Every method has a no-op default.
///
/// Handlers run with the dispatcher locked and must not deliver events
/// themselves.
pub trait InstanceHandlers: Send {
    /// Returning false tears the instance down
    fn did_create(&mut self, _args: &HashMap<String, String>) -> bool {
        true
    }

    /// Also called when `did_create` failed
    fn did_destroy(&mut self) {}

    fn did_change_view(&mut self, _view: &View) {}

    fn did_change_focus(&mut self, _has_focus: bool) {}

    fn handle_document_load(&mut self, _loader: Resource) -> bool {
        false
    }

    /// Returns true if the event was consumed
    fn handle_input_event(&mut self, _event: &InputEvent) -> bool {
        false
    }

    fn graphics_3d_context_lost(&mut self) {}

    fn handle_message(&mut self, _message: &serde_json::Value) {}

    fn mouse_lock_lost(&mut self) {}
}

/// Handle given to the application's handler factory
#[derive(Clone)]
pub struct Instance {
    host: Arc<dyn Host>,
}

impl Instance {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }

    /// Write to the host console under the module's own name
    pub fn log(&self, level: LogLevel, message: &str) {
        self.host.log(level, "", message);
    }

    pub fn log_with_source(&self, level: LogLevel, source: &str, message: &str) {
        self.host.log(level, source, message);
    }

    /// `log` taking `format_args!`
    pub fn log_fmt(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        match args.as_str() {
            Some(message) => self.log(level, message),
            None => self.log(level, &args.to_string()),
        }
    }

    pub fn print_fmt(&self, args: fmt::Arguments<'_>) {
        self.log_fmt(LogLevel::Log, args);
    }

    pub fn warn_fmt(&self, args: fmt::Arguments<'_>) {
        self.log_fmt(LogLevel::Warning, args);
    }

    pub fn error_fmt(&self, args: fmt::Arguments<'_>) {
        self.log_fmt(LogLevel::Error, args);
    }

    /// Open a WebSocket through the host
    pub fn dial_websocket(&self, url: &str) -> SyscallResult<WebSocket> {
        WebSocket::connect(&*self.host, url)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    AwaitingHandlers,
    Active,
    Destroyed,
}

struct State {
    phase: Phase,
    /// Creation arguments held until handlers register
    args: Option<HashMap<String, String>>,
    pending: VecDeque<HostEvent>,
    handlers: Option<Box<dyn InstanceHandlers>>,
}

/// Orders host events against handler registration
pub struct InstanceDispatcher {
    state: Mutex<State>,
}

/// Run one event through the handlers, returning the handler's verdict
fn dispatch(handlers: &mut dyn InstanceHandlers, event: &HostEvent) -> bool {
    trace!(event = event.name(), "dispatch");
    match event {
        HostEvent::DidCreate(args) => handlers.did_create(args),
        HostEvent::DidDestroy => {
            handlers.did_destroy();
            true
        }
        HostEvent::DidChangeView(view) => {
            handlers.did_change_view(view);
            true
        }
        HostEvent::DidChangeFocus(focus) => {
            handlers.did_change_focus(*focus);
            true
        }
        HostEvent::HandleDocumentLoad(loader) => handlers.handle_document_load(*loader),
        HostEvent::HandleInputEvent(input) => handlers.handle_input_event(input),
        HostEvent::Graphics3DContextLost => {
            handlers.graphics_3d_context_lost();
            true
        }
        HostEvent::HandleMessage(message) => {
            handlers.handle_message(message);
            true
        }
        HostEvent::MouseLockLost => {
            handlers.mouse_lock_lost();
            true
        }
    }
}

impl State {
    /// Create the instance with registered handlers and drain the queue
    fn activate(&mut self, args: HashMap<String, String>) -> bool {
        let Some(handlers) = self.handlers.as_mut() else {
            return false;
        };

        if !handlers.did_create(&args) {
            warn!("did_create reported failure, destroying instance");
            self.phase = Phase::Destroyed;
            let destroy = self
                .pending
                .drain(..)
                .any(|e| matches!(e, HostEvent::DidDestroy));
            if destroy {
                handlers.did_destroy();
            }
            self.handlers = None;
            return false;
        }

        self.phase = Phase::Active;
        let queued = self.pending.len();
        while let Some(event) = self.pending.pop_front() {
            if self.phase == Phase::Destroyed {
                trace!(event = event.name(), "dropping event after destroy");
                continue;
            }
            self.deliver_live(event);
        }
        if queued > 0 {
            debug!(queued, "replayed deferred events");
        }
        true
    }

    fn deliver_live(&mut self, event: HostEvent) -> bool {
        let Some(handlers) = self.handlers.as_mut() else {
            return false;
        };
        let handled = dispatch(&mut **handlers, &event);
        if matches!(event, HostEvent::DidDestroy) {
            debug!("instance destroyed");
            self.phase = Phase::Destroyed;
            self.handlers = None;
        }
        handled
    }
}

impl InstanceDispatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Uninitialized,
                args: None,
                pending: VecDeque::new(),
                handlers: None,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    /// Events waiting for handler registration
    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Deliver a host event
    ///
    /// Returns the handler's verdict for events that carry one. An event that
    /// had to be queued reports false, except `DidCreate`, which reports
    /// true since its outcome is decided at registration.
    pub fn deliver(&self, event: HostEvent) -> SyscallResult<bool> {
        let mut state = lock(&self.state);

        if let HostEvent::DidCreate(args) = event {
            if state.phase != Phase::Uninitialized {
                return Err(SyscallError::DuplicateInstance);
            }
            if state.handlers.is_some() {
                return Ok(state.activate(args));
            }
            debug!(args = args.len(), "instance created, awaiting handlers");
            state.phase = Phase::AwaitingHandlers;
            state.args = Some(args);
            return Ok(true);
        }

        match state.phase {
            Phase::Active => Ok(state.deliver_live(event)),
            Phase::Uninitialized | Phase::AwaitingHandlers => {
                trace!(event = event.name(), "queueing event");
                state.pending.push_back(event);
                Ok(false)
            }
            Phase::Destroyed => {
                trace!(event = event.name(), "dropping event after destroy");
                Ok(false)
            }
        }
    }

    /// Register the application's handlers, replaying anything queued
    pub fn register(&self, handlers: Box<dyn InstanceHandlers>) -> SyscallResult<()> {
        let mut state = lock(&self.state);
        if state.handlers.is_some() || matches!(state.phase, Phase::Active | Phase::Destroyed) {
            return Err(SyscallError::InvalidState("handlers already registered"));
        }
        state.handlers = Some(handlers);

        if let Some(args) = state.args.take() {
            state.activate(args);
        }
        Ok(())
    }
}

impl Default for InstanceDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
