//! The kernel - descriptors, files, sockets, websockets and the syscall surface
//!
//! `Bridge` owns all of it. The host feeds events in through `deliver`;
//! the application calls `init` once from its own startup path and then
//! issues syscalls through `syscalls()`.

pub mod env;
pub mod error;
pub mod events;
pub mod fd;
pub mod file;
pub mod instance;
pub mod net;
pub mod syscall;
pub mod websocket;

pub use error::{ErrorKind, SyscallError, SyscallResult};
pub use events::{HostEvent, InputEvent, Modifiers, Resource, View};
pub use fd::{Fd, OpenFlags};
pub use file::{File, FileKind, FileStat};
pub use instance::{Instance, InstanceDispatcher, InstanceHandlers, Phase};
pub use net::{SockAddr, SocketState};
pub use syscall::{BridgeSyscalls, Dispatch, Syscalls};
pub use websocket::WebSocket;

use crate::config::BridgeConfig;
use crate::platform::Host;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// The root runtime context
pub struct Bridge {
    host: Arc<dyn Host>,
    config: BridgeConfig,
    dispatch: Dispatch,
    instance: InstanceDispatcher,
    initialized: AtomicBool,
}

impl Bridge {
    pub fn new(host: Arc<dyn Host>, config: BridgeConfig) -> Self {
        Self {
            dispatch: Dispatch::new(config.abort_on_fatal),
            instance: InstanceDispatcher::new(),
            initialized: AtomicBool::new(false),
            host,
            config,
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Application entry point
    ///
    /// Installs the syscall implementation, then builds the handlers and
    /// registers them, which replays any events the host already sent.
    /// Runs once; a second call fails and leaves the live descriptor table
    /// and filesystem untouched.
    pub fn init<F>(&self, factory: F) -> SyscallResult<()>
    where
        F: FnOnce(Instance) -> Box<dyn InstanceHandlers>,
    {
        if self.initialized.swap(true, Ordering::AcqRel) {
            warn!("init called twice");
            return Err(SyscallError::InvalidState("handlers already registered"));
        }
        let syscalls = BridgeSyscalls::new(Arc::clone(&self.host), self.config.clone());
        self.dispatch.install(Arc::new(syscalls));
        debug!("syscalls installed");

        let handlers = factory(Instance::new(Arc::clone(&self.host)));
        self.instance.register(handlers)
    }

    /// Swap in a different syscall implementation
    pub fn install(&self, imp: Arc<dyn Syscalls>) {
        self.dispatch.install(imp);
    }

    pub fn syscalls(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn instance(&self) -> &InstanceDispatcher {
        &self.instance
    }

    /// Feed one host event to the instance
    pub fn deliver(&self, event: HostEvent) -> SyscallResult<bool> {
        let result = self.instance.deliver(event);
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(%err, "fatal host event");
                if self.config.abort_on_fatal {
                    panic!("fatal host event: {}", err);
                }
            }
        }
        result
    }
}
