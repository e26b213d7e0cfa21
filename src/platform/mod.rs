//! Host Runtime Binding
//!
//! The bridge never talks to the sandbox directly. Everything it needs from
//! the host goes through the traits in this module:
//!
//! - `Host`: console logging, name resolution, TCP/UDP listen and dial,
//!   WebSocket dial
//! - `HostListener`: blocking accept on a listening resource
//! - `HostConnection`: blocking read/write on a stream or datagram resource
//! - `HostDatagram`: an unconnected UDP resource with per-packet addressing
//! - `HostWebSocket`: message-oriented send/receive
//!
//! Blocking calls park the calling thread until the host completes the
//! operation. Implementations:
//!
//! - `loopback`: in-process host used natively and by the test suite
//! - `web`: browser host (wasm32 only)

pub mod error;
pub mod loopback;

#[cfg(target_arch = "wasm32")]
pub mod web;

pub use error::{HostError, HostResult};
pub use loopback::{LoopbackHost, WebSocketServer};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// Console severity understood by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Tip,
    Log,
    Warning,
    Error,
}

impl LogLevel {
    /// Numeric level as passed to the host console
    pub fn code(self) -> i32 {
        match self {
            LogLevel::Tip => 0,
            LogLevel::Log => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(LogLevel::Tip),
            1 => Some(LogLevel::Log),
            2 => Some(LogLevel::Warning),
            3 => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Transport protocol of a host socket resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The host's typed network address resource.
///
/// On the wire the host stores a big-endian port followed by the raw
/// address bytes: 6 bytes for IPv4 and 18 bytes for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetAddress {
    V4 { addr: [u8; 4], port: u16 },
    V6 { addr: [u8; 16], port: u16 },
}

impl NetAddress {
    pub const V4_LEN: usize = 6;
    pub const V6_LEN: usize = 18;

    pub fn port(&self) -> u16 {
        match self {
            NetAddress::V4 { port, .. } | NetAddress::V6 { port, .. } => *port,
        }
    }

    /// Same address with a different port
    pub fn with_port(self, port: u16) -> Self {
        match self {
            NetAddress::V4 { addr, .. } => NetAddress::V4 { addr, port },
            NetAddress::V6 { addr, .. } => NetAddress::V6 { addr, port },
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, NetAddress::V6 { .. })
    }

    /// The wildcard address of the same family and port
    pub fn unspecified(&self) -> Self {
        match self {
            NetAddress::V4 { port, .. } => NetAddress::V4 {
                addr: [0; 4],
                port: *port,
            },
            NetAddress::V6 { port, .. } => NetAddress::V6 {
                addr: [0; 16],
                port: *port,
            },
        }
    }

    /// Encode in the host's binary layout
    pub fn to_host_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::V6_LEN);
        out.extend_from_slice(&self.port().to_be_bytes());
        match self {
            NetAddress::V4 { addr, .. } => out.extend_from_slice(addr),
            NetAddress::V6 { addr, .. } => out.extend_from_slice(addr),
        }
        out
    }

    /// Decode from the host's binary layout
    pub fn from_host_bytes(bytes: &[u8]) -> HostResult<Self> {
        match bytes.len() {
            Self::V4_LEN => {
                let port = u16::from_be_bytes([bytes[0], bytes[1]]);
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&bytes[2..]);
                Ok(NetAddress::V4 { addr, port })
            }
            Self::V6_LEN => {
                let port = u16::from_be_bytes([bytes[0], bytes[1]]);
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&bytes[2..]);
                Ok(NetAddress::V6 { addr, port })
            }
            _ => Err(HostError::AddressInvalid),
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            NetAddress::V4 { addr, .. } => IpAddr::V4(Ipv4Addr::from(*addr)),
            NetAddress::V6 { addr, .. } => IpAddr::V6(Ipv6Addr::from(*addr)),
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port())
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => NetAddress::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => NetAddress::V6 {
                addr: v6.ip().octets(),
                port: v6.port(),
            },
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl std::str::FromStr for NetAddress {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(NetAddress::from)
            .map_err(|_| HostError::AddressInvalid)
    }
}

/// Address family restriction for name resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressHint {
    Any,
    Ipv4,
    Ipv6,
}

impl AddressHint {
    pub fn accepts(self, addr: &NetAddress) -> bool {
        match self {
            AddressHint::Any => true,
            AddressHint::Ipv4 => !addr.is_ipv6(),
            AddressHint::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// One WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// The runtime hosting the bridge
pub trait Host: Send + Sync {
    /// Write a message to the host console
    fn log(&self, level: LogLevel, source: &str, message: &str);

    /// Resolve a host name. Addresses come back in the host's preference
    /// order, all carrying `port`.
    fn resolve(&self, name: &str, port: u16, hint: AddressHint) -> HostResult<Vec<NetAddress>>;

    /// Open a listening resource. A zero port asks the host to pick one.
    fn listen(&self, protocol: Protocol, addr: NetAddress) -> HostResult<Arc<dyn HostListener>>;

    /// Open a connection (TCP) or a connected datagram endpoint (UDP)
    fn dial(
        &self,
        protocol: Protocol,
        local: Option<NetAddress>,
        remote: NetAddress,
    ) -> HostResult<Arc<dyn HostConnection>>;

    /// Open an unconnected UDP resource. A zero port asks the host to pick one.
    fn bind_datagram(&self, addr: NetAddress) -> HostResult<Arc<dyn HostDatagram>>;

    /// Open a WebSocket to a `ws://` or `wss://` URL
    fn dial_websocket(&self, url: &str) -> HostResult<Arc<dyn HostWebSocket>>;
}

/// A host listening resource
pub trait HostListener: Send + Sync {
    /// Block until a peer connects. Closing the listener fails pending
    /// and future accepts with `HostError::Aborted`.
    fn accept(&self) -> HostResult<Arc<dyn HostConnection>>;

    fn local_addr(&self) -> NetAddress;

    fn close(&self);
}

/// A host connection resource
pub trait HostConnection: Send + Sync {
    /// Block until data arrives. A peer shutdown is `ConnectionClosed`;
    /// a local close is `Aborted`.
    fn read(&self, buf: &mut [u8]) -> HostResult<usize>;

    fn write(&self, buf: &[u8]) -> HostResult<usize>;

    fn local_addr(&self) -> NetAddress;

    fn remote_addr(&self) -> NetAddress;

    fn close(&self);
}

/// An unconnected datagram resource
pub trait HostDatagram: Send + Sync {
    /// Send one datagram. Delivery is not confirmed.
    fn send_to(&self, buf: &[u8], to: NetAddress) -> HostResult<usize>;

    /// Block until a datagram arrives. A longer payload is truncated to
    /// `buf`. A local close is `Aborted`.
    fn recv_from(&self, buf: &mut [u8]) -> HostResult<(usize, NetAddress)>;

    fn local_addr(&self) -> NetAddress;

    fn close(&self);
}

/// A WebSocket resource
pub trait HostWebSocket: Send + Sync {
    fn send(&self, message: WsMessage) -> HostResult<()>;

    /// Block until a message arrives. A close from the server is
    /// `ConnectionClosed`; a local close is `Aborted`.
    fn receive(&self) -> HostResult<WsMessage>;

    fn url(&self) -> &str;

    fn close(&self);
}
