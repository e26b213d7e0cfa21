//! Browser host
//!
//! Runs the bridge inside a web page:
//! - Console output goes to the developer console at the matching severity
//! - A web page has no raw TCP/UDP and no resolver. The page's WebSocket
//!   API is callback driven, and the blocking receive the kernel relies on
//!   cannot wait on the page's only thread. Every network call therefore
//!   reports `SocketsUnavailable`, which callers can tell apart from an
//!   operation the host merely refuses (`NotSupported`).

use super::{
    AddressHint, Host, HostConnection, HostDatagram, HostError, HostListener, HostResult,
    HostWebSocket, LogLevel, NetAddress, Protocol,
};
use std::sync::Arc;

/// Browser host state
pub struct WebHost;

impl WebHost {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for WebHost {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        let line = if source.is_empty() {
            message.to_string()
        } else {
            format!("{}: {}", source, message)
        };
        let value = wasm_bindgen::JsValue::from(line);
        match level {
            LogLevel::Tip => web_sys::console::info_1(&value),
            LogLevel::Log => web_sys::console::log_1(&value),
            LogLevel::Warning => web_sys::console::warn_1(&value),
            LogLevel::Error => web_sys::console::error_1(&value),
        }
    }

    fn resolve(&self, _name: &str, _port: u16, _hint: AddressHint) -> HostResult<Vec<NetAddress>> {
        Err(HostError::SocketsUnavailable)
    }

    fn listen(&self, _protocol: Protocol, _addr: NetAddress) -> HostResult<Arc<dyn HostListener>> {
        Err(HostError::SocketsUnavailable)
    }

    fn dial(
        &self,
        _protocol: Protocol,
        _local: Option<NetAddress>,
        _remote: NetAddress,
    ) -> HostResult<Arc<dyn HostConnection>> {
        Err(HostError::SocketsUnavailable)
    }

    fn bind_datagram(&self, _addr: NetAddress) -> HostResult<Arc<dyn HostDatagram>> {
        Err(HostError::SocketsUnavailable)
    }

    fn dial_websocket(&self, _url: &str) -> HostResult<Arc<dyn HostWebSocket>> {
        Err(HostError::SocketsUnavailable)
    }
}
