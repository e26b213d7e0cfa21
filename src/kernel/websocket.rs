//! WebSocket client
//!
//! Message-oriented rather than a descriptor: each send is one frame and
//! each receive returns one whole message. A peer that closes shows up as
//! end-of-stream on the next receive.

use super::error::{SyscallError, SyscallResult};
use crate::platform::{Host, HostWebSocket, WsMessage};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub struct WebSocket {
    conn: Arc<dyn HostWebSocket>,
    closed: AtomicBool,
}

impl WebSocket {
    /// Open a connection to a `ws://` or `wss://` URL
    pub fn connect(host: &dyn Host, url: &str) -> SyscallResult<Self> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SyscallError::MalformedAddress(url.to_string()));
        }
        let conn = host.dial_websocket(url)?;
        debug!(url, "websocket open");
        Ok(Self {
            conn,
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        self.conn.url()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> SyscallResult<()> {
        if self.is_closed() {
            return Err(SyscallError::InvalidState("websocket is closed"));
        }
        Ok(())
    }

    pub fn send(&self, message: WsMessage) -> SyscallResult<()> {
        self.check_open()?;
        Ok(self.conn.send(message)?)
    }

    pub fn send_text(&self, text: &str) -> SyscallResult<()> {
        self.send(WsMessage::Text(text.to_string()))
    }

    pub fn send_binary(&self, data: &[u8]) -> SyscallResult<()> {
        self.send(WsMessage::Binary(data.to_vec()))
    }

    /// Block for the next message
    pub fn receive(&self) -> SyscallResult<WsMessage> {
        self.check_open()?;
        Ok(self.conn.receive()?)
    }

    /// Next message as raw bytes, whichever kind it was sent as
    pub fn receive_bytes(&self) -> SyscallResult<Vec<u8>> {
        Ok(match self.receive()? {
            WsMessage::Text(text) => text.into_bytes(),
            WsMessage::Binary(data) => data,
        })
    }

    /// Binary messages must hold UTF-8
    pub fn receive_text(&self) -> SyscallResult<String> {
        match self.receive()? {
            WsMessage::Text(text) => Ok(text),
            WsMessage::Binary(data) => String::from_utf8(data)
                .map_err(|_| SyscallError::InvalidArgument("binary message is not UTF-8")),
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(url = self.url(), "websocket close");
        self.conn.close();
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("url", &self.url())
            .field("closed", &self.is_closed())
            .finish()
    }
}
