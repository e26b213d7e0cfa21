//! Network sockets
//!
//! Emulates BSD sockets on top of the host's TCP/UDP resources. A socket
//! moves through these states:
//!
//! ```text
//! Unbound -> Bound -> Listening        (server)
//! Unbound [-> Bound] -> Connected      (client)
//! Unbound [-> Bound] -> Datagram       (udp sendto/recvfrom)
//! any -> Closed
//! ```
//!
//! Host calls that can block (listen, dial, accept, read, write) run with
//! the socket's state lock released, so `close` and `stop_io` on another
//! thread can always get in and abort them.

use super::error::{SyscallError, SyscallResult};
use crate::lock;
use crate::platform::{
    AddressHint, Host, HostConnection, HostDatagram, HostError, HostListener, NetAddress, Protocol,
};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

pub const AF_INET: i32 = 2;
pub const AF_INET6: i32 = 10;
pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;

/// Generic socket address, as passed to bind/connect and returned by
/// accept/getsockname/getpeername
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockAddr {
    Inet4 { port: u16, addr: [u8; 4] },
    Inet6 { port: u16, addr: [u8; 16] },
}

impl SockAddr {
    pub fn inet4(addr: [u8; 4], port: u16) -> Self {
        SockAddr::Inet4 { port, addr }
    }

    pub fn inet6(addr: [u8; 16], port: u16) -> Self {
        SockAddr::Inet6 { port, addr }
    }

    /// The wildcard address of a family
    pub fn unspecified(family: i32) -> Self {
        if family == AF_INET6 {
            SockAddr::inet6([0; 16], 0)
        } else {
            SockAddr::inet4([0; 4], 0)
        }
    }

    pub fn family(&self) -> i32 {
        match self {
            SockAddr::Inet4 { .. } => AF_INET,
            SockAddr::Inet6 { .. } => AF_INET6,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            SockAddr::Inet4 { port, .. } | SockAddr::Inet6 { port, .. } => *port,
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        match self {
            SockAddr::Inet4 { addr, .. } => SockAddr::Inet4 { port, addr },
            SockAddr::Inet6 { addr, .. } => SockAddr::Inet6 { port, addr },
        }
    }

    pub fn to_net_address(&self) -> NetAddress {
        match *self {
            SockAddr::Inet4 { port, addr } => NetAddress::V4 { addr, port },
            SockAddr::Inet6 { port, addr } => NetAddress::V6 { addr, port },
        }
    }

    pub fn from_net_address(addr: NetAddress) -> Self {
        match addr {
            NetAddress::V4 { addr, port } => SockAddr::Inet4 { port, addr },
            NetAddress::V6 { addr, port } => SockAddr::Inet6 { port, addr },
        }
    }

    /// `ip:port`, or `[ip]:port` for IPv6
    pub fn display_string(&self) -> String {
        let ip = match *self {
            SockAddr::Inet4 { addr, .. } => IpAddr::V4(Ipv4Addr::from(addr)),
            SockAddr::Inet6 { addr, .. } => IpAddr::V6(Ipv6Addr::from(addr)),
        };
        SocketAddr::new(ip, self.port()).to_string()
    }

    /// Numeric addresses only; see `resolve` for host names
    pub fn parse(s: &str) -> SyscallResult<Self> {
        s.parse::<SocketAddr>()
            .map(|sa| Self::from_net_address(NetAddress::from(sa)))
            .map_err(|_| SyscallError::MalformedAddress(s.to_string()))
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_string())
    }
}

/// Split a network name (`tcp`, `udp6`, ...) into protocol and family
pub fn parse_network(network: &str) -> SyscallResult<(Protocol, AddressHint)> {
    let parsed = match network {
        "tcp" => (Protocol::Tcp, AddressHint::Any),
        "tcp4" => (Protocol::Tcp, AddressHint::Ipv4),
        "tcp6" => (Protocol::Tcp, AddressHint::Ipv6),
        "udp" => (Protocol::Udp, AddressHint::Any),
        "udp4" => (Protocol::Udp, AddressHint::Ipv4),
        "udp6" => (Protocol::Udp, AddressHint::Ipv6),
        _ => {
            return Err(SyscallError::MalformedAddress(format!(
                "unknown network {:?}",
                network
            )));
        }
    };
    Ok(parsed)
}

/// Turn `host:port` into a socket address
///
/// Numeric hosts are taken as they are. Names go to the host's resolver
/// and the first answer of the requested family wins. An empty host means
/// the wildcard address.
pub fn resolve(host: &dyn Host, network: &str, address: &str) -> SyscallResult<SockAddr> {
    let (_, hint) = parse_network(network)?;
    let malformed = || SyscallError::MalformedAddress(address.to_string());

    if let Ok(addr) = SockAddr::parse(address) {
        if !hint.accepts(&addr.to_net_address()) {
            return Err(malformed());
        }
        return Ok(addr);
    }

    let (name, port) = address.rsplit_once(':').ok_or_else(malformed)?;
    let port: u16 = port.parse().map_err(|_| malformed())?;
    let name = match name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
        Some(inner) => inner,
        None if name.contains(':') => return Err(malformed()),
        None => name,
    };
    if name.is_empty() {
        let family = if hint == AddressHint::Ipv6 { AF_INET6 } else { AF_INET };
        return Ok(SockAddr::unspecified(family).with_port(port));
    }

    let first = host
        .resolve(name, port, hint)?
        .into_iter()
        .find(|addr| hint.accepts(addr))
        .ok_or(SyscallError::Host(HostError::NameNotResolved))?;
    debug!(name, port, resolved = %first, "resolve");
    Ok(SockAddr::from_net_address(first))
}

/// Observable socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Bound,
    Listening,
    Connected,
    Closed,
}

enum Endpoint {
    Unbound,
    /// Address as given to bind, port zero meaning "any"
    Bound(String),
    Listening(Arc<dyn HostListener>),
    Connected {
        conn: Arc<dyn HostConnection>,
        peer: SockAddr,
    },
    /// Unconnected UDP with a host port, created by the first sendto/recvfrom
    Datagram(Arc<dyn HostDatagram>),
    Closed,
}

impl Endpoint {
    fn state(&self) -> SocketState {
        match self {
            Endpoint::Unbound => SocketState::Unbound,
            Endpoint::Bound(_) | Endpoint::Datagram(_) => SocketState::Bound,
            Endpoint::Listening(_) => SocketState::Listening,
            Endpoint::Connected { .. } => SocketState::Connected,
            Endpoint::Closed => SocketState::Closed,
        }
    }
}

/// A socket record
pub struct NetSocket {
    host: Arc<dyn Host>,
    protocol: Protocol,
    family: i32,
    endpoint: Mutex<Endpoint>,
}

impl NetSocket {
    /// socket(2): validate domain, type and protocol
    pub fn new(host: Arc<dyn Host>, domain: i32, ty: i32, proto: i32) -> SyscallResult<Self> {
        if domain != AF_INET && domain != AF_INET6 {
            return Err(SyscallError::ProtocolNotSupported);
        }
        let protocol = match ty {
            SOCK_STREAM => Protocol::Tcp,
            SOCK_DGRAM => Protocol::Udp,
            _ => return Err(SyscallError::SocketTypeNotSupported),
        };
        if proto != 0 {
            return Err(SyscallError::ProtocolNotSupported);
        }
        Ok(Self {
            host,
            protocol,
            family: domain,
            endpoint: Mutex::new(Endpoint::Unbound),
        })
    }

    fn connected(
        host: Arc<dyn Host>,
        protocol: Protocol,
        conn: Arc<dyn HostConnection>,
        peer: SockAddr,
    ) -> Self {
        Self {
            host,
            protocol,
            family: peer.family(),
            endpoint: Mutex::new(Endpoint::Connected { conn, peer }),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn family(&self) -> i32 {
        self.family
    }

    pub fn state(&self) -> SocketState {
        lock(&self.endpoint).state()
    }

    fn check_family(&self, addr: &SockAddr) -> SyscallResult<()> {
        if addr.family() != self.family {
            return Err(SyscallError::MalformedAddress(format!(
                "{}: wrong address family for socket",
                addr
            )));
        }
        Ok(())
    }

    pub fn bind(&self, addr: &SockAddr) -> SyscallResult<()> {
        self.check_family(addr)?;
        let mut endpoint = lock(&self.endpoint);
        match *endpoint {
            Endpoint::Unbound => {
                let bound = addr.display_string();
                debug!(protocol = %self.protocol, addr = %bound, "bind");
                *endpoint = Endpoint::Bound(bound);
                Ok(())
            }
            Endpoint::Closed => Err(SyscallError::InvalidState("socket is closed")),
            _ => Err(SyscallError::InvalidState("socket is already bound")),
        }
    }

    /// The backlog is only a hint; the host queues as many peers as arrive
    pub fn listen(&self, backlog: i32) -> SyscallResult<()> {
        if self.protocol == Protocol::Udp {
            return Err(SyscallError::Unsupported { op: "listen" });
        }
        let addr = match &*lock(&self.endpoint) {
            Endpoint::Bound(addr) => addr.clone(),
            Endpoint::Unbound => {
                return Err(SyscallError::InvalidState("listen requires a prior bind"));
            }
            Endpoint::Listening(_) => {
                return Err(SyscallError::InvalidState("socket is already listening"));
            }
            Endpoint::Connected { .. } | Endpoint::Datagram(_) => {
                return Err(SyscallError::InvalidState("socket is connected"));
            }
            Endpoint::Closed => return Err(SyscallError::InvalidState("socket is closed")),
        };
        let net_addr = SockAddr::parse(&addr)?.to_net_address();

        let listener = self.host.listen(self.protocol, net_addr)?;
        debug!(addr = %listener.local_addr(), backlog, "listen");

        let mut endpoint = lock(&self.endpoint);
        match *endpoint {
            Endpoint::Bound(_) => {
                *endpoint = Endpoint::Listening(listener);
                Ok(())
            }
            _ => {
                // Closed or reconfigured while the host was busy
                drop(endpoint);
                listener.close();
                Err(SyscallError::InvalidState("socket changed during listen"))
            }
        }
    }

    /// Block until a peer connects. A closed listener is end-of-stream.
    pub fn accept(&self) -> SyscallResult<(NetSocket, SockAddr)> {
        let listener = match &*lock(&self.endpoint) {
            Endpoint::Listening(listener) => Arc::clone(listener),
            Endpoint::Closed => return Err(SyscallError::EndOfStream),
            _ => return Err(SyscallError::InvalidState("accept requires a listening socket")),
        };

        let conn = listener.accept()?;
        let peer = SockAddr::from_net_address(conn.remote_addr());
        debug!(%peer, "accept");
        Ok((
            NetSocket::connected(Arc::clone(&self.host), self.protocol, conn, peer),
            peer,
        ))
    }

    /// A UDP socket that already sent or received keeps its port
    pub fn connect(&self, addr: &SockAddr) -> SyscallResult<()> {
        self.check_family(addr)?;
        if addr.port() == 0 {
            return Err(SyscallError::MalformedAddress(format!(
                "{}: port must be nonzero",
                addr
            )));
        }
        let (local, released) = {
            let mut endpoint = lock(&self.endpoint);
            let released = match &*endpoint {
                Endpoint::Datagram(sock) => Some(Arc::clone(sock)),
                _ => None,
            };
            if let Some(sock) = &released {
                *endpoint = Endpoint::Bound(sock.local_addr().to_string());
            }
            let local = match &*endpoint {
                Endpoint::Unbound => None,
                Endpoint::Bound(bound) => Some(SockAddr::parse(bound)?.to_net_address()),
                Endpoint::Listening(_) => {
                    return Err(SyscallError::InvalidState("connect on a listening socket"));
                }
                Endpoint::Connected { .. } | Endpoint::Datagram(_) => {
                    return Err(SyscallError::InvalidState("socket is already connected"));
                }
                Endpoint::Closed => return Err(SyscallError::InvalidState("socket is closed")),
            };
            (local, released)
        };
        if let Some(sock) = released {
            sock.close();
        }

        let conn = self.host.dial(self.protocol, local, addr.to_net_address())?;
        debug!(
            protocol = %self.protocol,
            local = %conn.local_addr(),
            remote = %addr,
            "connect"
        );

        let mut endpoint = lock(&self.endpoint);
        match *endpoint {
            Endpoint::Unbound | Endpoint::Bound(_) => {
                *endpoint = Endpoint::Connected { conn, peer: *addr };
                Ok(())
            }
            _ => {
                drop(endpoint);
                conn.close();
                Err(SyscallError::InvalidState("socket changed during connect"))
            }
        }
    }

    pub fn getsockname(&self) -> SyscallResult<SockAddr> {
        match &*lock(&self.endpoint) {
            Endpoint::Unbound => Ok(SockAddr::unspecified(self.family)),
            Endpoint::Bound(addr) => SockAddr::parse(addr),
            Endpoint::Listening(listener) => {
                Ok(SockAddr::from_net_address(listener.local_addr()))
            }
            Endpoint::Connected { conn, .. } => Ok(SockAddr::from_net_address(conn.local_addr())),
            Endpoint::Datagram(sock) => Ok(SockAddr::from_net_address(sock.local_addr())),
            Endpoint::Closed => Err(SyscallError::InvalidState("socket is closed")),
        }
    }

    pub fn getpeername(&self) -> SyscallResult<SockAddr> {
        match &*lock(&self.endpoint) {
            Endpoint::Connected { peer, .. } => Ok(*peer),
            _ => Err(SyscallError::InvalidState("socket is not connected")),
        }
    }

    fn connection(&self) -> SyscallResult<Arc<dyn HostConnection>> {
        match &*lock(&self.endpoint) {
            Endpoint::Connected { conn, .. } => Ok(Arc::clone(conn)),
            Endpoint::Closed => Err(SyscallError::EndOfStream),
            _ => Err(SyscallError::InvalidState("socket is not connected")),
        }
    }

    fn connected_peer(&self) -> Option<(Arc<dyn HostConnection>, SockAddr)> {
        match &*lock(&self.endpoint) {
            Endpoint::Connected { conn, peer } => Some((Arc::clone(conn), *peer)),
            _ => None,
        }
    }

    /// The host port behind an unconnected UDP socket, bound on first use
    /// to the bind address or the family's wildcard
    fn datagram(&self) -> SyscallResult<Arc<dyn HostDatagram>> {
        let bind_to = match &*lock(&self.endpoint) {
            Endpoint::Datagram(sock) => return Ok(Arc::clone(sock)),
            Endpoint::Unbound => SockAddr::unspecified(self.family).to_net_address(),
            Endpoint::Bound(addr) => SockAddr::parse(addr)?.to_net_address(),
            Endpoint::Closed => return Err(SyscallError::InvalidState("socket is closed")),
            _ => return Err(SyscallError::InvalidState("socket is not a datagram endpoint")),
        };

        let sock = self.host.bind_datagram(bind_to)?;
        debug!(local = %sock.local_addr(), "udp bind");

        let mut endpoint = lock(&self.endpoint);
        match *endpoint {
            Endpoint::Unbound | Endpoint::Bound(_) => {
                *endpoint = Endpoint::Datagram(Arc::clone(&sock));
                Ok(sock)
            }
            Endpoint::Datagram(ref existing) => {
                let existing = Arc::clone(existing);
                drop(endpoint);
                sock.close();
                Ok(existing)
            }
            _ => {
                drop(endpoint);
                sock.close();
                Err(SyscallError::InvalidState("socket changed during bind"))
            }
        }
    }

    /// Returns 0 at end of stream
    pub fn read(&self, buf: &mut [u8]) -> SyscallResult<usize> {
        let conn = match self.connection() {
            Ok(conn) => conn,
            Err(SyscallError::EndOfStream) => return Ok(0),
            Err(e) => return Err(e),
        };
        match conn.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.is_end_of_stream() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, buf: &[u8]) -> SyscallResult<usize> {
        let conn = self.connection()?;
        Ok(conn.write(buf)?)
    }

    /// sendto(2)
    ///
    /// On a connected socket the data goes to the peer; UDP then insists
    /// the address names that peer. Otherwise UDP sends one datagram.
    pub fn sendto(&self, buf: &[u8], addr: &SockAddr) -> SyscallResult<usize> {
        self.check_family(addr)?;
        if let Some((conn, peer)) = self.connected_peer() {
            if self.protocol == Protocol::Udp && peer != *addr {
                return Err(SyscallError::InvalidState("socket is connected elsewhere"));
            }
            return Ok(conn.write(buf)?);
        }
        if self.protocol == Protocol::Tcp {
            return Err(SyscallError::InvalidState("socket is not connected"));
        }
        if addr.port() == 0 {
            return Err(SyscallError::MalformedAddress(format!(
                "{}: port must be nonzero",
                addr
            )));
        }
        Ok(self.datagram()?.send_to(buf, addr.to_net_address())?)
    }

    /// recvfrom(2): the data and who sent it
    ///
    /// A closed connected socket reads 0 bytes from its peer; a closed
    /// unconnected one is end-of-stream.
    pub fn recvfrom(&self, buf: &mut [u8]) -> SyscallResult<(usize, SockAddr)> {
        if let Some((_, peer)) = self.connected_peer() {
            return Ok((self.read(buf)?, peer));
        }
        if self.protocol == Protocol::Tcp {
            return Err(SyscallError::InvalidState("socket is not connected"));
        }
        let (n, from) = self.datagram()?.recv_from(buf)?;
        Ok((n, SockAddr::from_net_address(from)))
    }

    pub fn set_deadline(&self, _deadline: Option<Instant>) -> SyscallResult<()> {
        Err(SyscallError::DeadlineUnsupported)
    }

    pub fn set_read_deadline(&self, _deadline: Option<Instant>) -> SyscallResult<()> {
        Err(SyscallError::DeadlineUnsupported)
    }

    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> SyscallResult<()> {
        Err(SyscallError::DeadlineUnsupported)
    }

    /// Close the host resource but keep the descriptor. Blocked and later
    /// accepts and reads see end-of-stream.
    pub fn stop_io(&self) {
        let (listener, conn, sock) = match &*lock(&self.endpoint) {
            Endpoint::Listening(listener) => (Some(Arc::clone(listener)), None, None),
            Endpoint::Connected { conn, .. } => (None, Some(Arc::clone(conn)), None),
            Endpoint::Datagram(sock) => (None, None, Some(Arc::clone(sock))),
            _ => (None, None, None),
        };
        if let Some(listener) = listener {
            listener.close();
        }
        if let Some(conn) = conn {
            conn.close();
        }
        if let Some(sock) = sock {
            sock.close();
        }
    }

    /// Release the host resource
    pub fn close(&self) -> SyscallResult<()> {
        let previous = std::mem::replace(&mut *lock(&self.endpoint), Endpoint::Closed);
        match previous {
            Endpoint::Listening(listener) => listener.close(),
            Endpoint::Connected { conn, .. } => conn.close(),
            Endpoint::Datagram(sock) => sock.close(),
            _ => {}
        }
        Ok(())
    }
}
