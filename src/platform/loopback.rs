//! In-process host
//!
//! Implements the host binding without a browser:
//! - TCP connections are pairs of in-memory channels
//! - UDP endpoints exchange whole datagrams through a shared registry
//! - Host names resolve through a small table seeded with `localhost`
//! - WebSocket URLs are served by `WebSocketServer`s registered by the test
//! - Console output is captured for inspection
//!
//! Every live listener, connection and endpoint holds a slot in a resource
//! registry, the same way the real host hands out resource ids. Closing a
//! resource frees its slot.

use super::{
    AddressHint, Host, HostConnection, HostDatagram, HostError, HostListener, HostResult,
    HostWebSocket, LogLevel, NetAddress, Protocol, WsMessage,
};
use crate::lock;
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::executor::block_on;
use slab::Slab;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// First port handed out when a caller asks for port zero
const EPHEMERAL_START: u16 = 49152;

/// One message written to the captured console
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

enum Segment {
    Data(Vec<u8>),
    /// Peer shut down its side
    Fin,
    /// Local close; wakes a blocked reader
    Abort,
}

enum Incoming {
    Conn(Arc<StreamConn>),
    Abort,
}

enum Packet {
    Datagram { from: NetAddress, payload: Vec<u8> },
    Abort,
}

enum Frame {
    Message(WsMessage),
    Close,
    Abort,
}

struct State {
    listeners: HashMap<NetAddress, UnboundedSender<Incoming>>,
    endpoints: HashMap<NetAddress, UnboundedSender<Packet>>,
    websockets: HashMap<String, UnboundedSender<Arc<WsPeer>>>,
    names: HashMap<String, Vec<IpAddr>>,
    next_port: u16,
    resources: Slab<&'static str>,
    logs: Vec<LogRecord>,
}

impl State {
    fn new() -> Self {
        let mut names = HashMap::new();
        names.insert(
            "localhost".to_string(),
            vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        );
        Self {
            listeners: HashMap::new(),
            endpoints: HashMap::new(),
            websockets: HashMap::new(),
            names,
            next_port: EPHEMERAL_START,
            resources: Slab::new(),
            logs: Vec::new(),
        }
    }

    /// Pick an unused port on the address family/ip of `like`
    fn ephemeral(&mut self, like: NetAddress) -> NetAddress {
        loop {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_START
            } else {
                port + 1
            };
            let candidate = like.with_port(port);
            if !self.listeners.contains_key(&candidate)
                && !self.endpoints.contains_key(&candidate)
            {
                return candidate;
            }
        }
    }

    /// Resolve the local side of a dial
    fn local_for(&mut self, local: Option<NetAddress>, remote: NetAddress) -> NetAddress {
        match local {
            Some(addr) if addr.port() != 0 => addr,
            Some(addr) => self.ephemeral(addr),
            None => self.ephemeral(loopback_like(remote)),
        }
    }

    /// Register a datagram endpoint at `local`
    fn open_datagram(
        &mut self,
        shared: &Arc<Mutex<State>>,
        local: NetAddress,
    ) -> HostResult<DatagramCore> {
        if self.endpoints.contains_key(&local) {
            return Err(HostError::AddressInUse);
        }
        let (tx, rx) = mpsc::unbounded();
        self.endpoints.insert(local, tx.clone());
        let key = self.resources.insert("udp endpoint");
        Ok(DatagramCore {
            state: Arc::clone(shared),
            key,
            local,
            rx: Mutex::new(rx),
            self_tx: tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Endpoint bound to `to`, or to the wildcard address on its port
    fn endpoint_for(&self, to: NetAddress) -> Option<UnboundedSender<Packet>> {
        self.endpoints
            .get(&to)
            .or_else(|| self.endpoints.get(&to.unspecified()))
            .cloned()
    }

    fn release(&mut self, key: usize) {
        if self.resources.contains(key) {
            self.resources.remove(key);
        }
    }
}

fn loopback_like(addr: NetAddress) -> NetAddress {
    match addr {
        NetAddress::V4 { .. } => NetAddress::V4 {
            addr: [127, 0, 0, 1],
            port: 0,
        },
        NetAddress::V6 { .. } => {
            let mut v6 = [0u8; 16];
            v6[15] = 1;
            NetAddress::V6 { addr: v6, port: 0 }
        }
    }
}

/// The address a peer sees packets coming from
fn routable(addr: NetAddress) -> NetAddress {
    if addr.ip().is_unspecified() {
        loopback_like(addr).with_port(addr.port())
    } else {
        addr
    }
}

/// In-process host
#[derive(Clone)]
pub struct LoopbackHost {
    state: Arc<Mutex<State>>,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Drain everything logged so far
    pub fn take_logs(&self) -> Vec<LogRecord> {
        std::mem::take(&mut lock(&self.state).logs)
    }

    /// Number of listeners, connections and endpoints not yet closed
    pub fn live_resources(&self) -> usize {
        lock(&self.state).resources.len()
    }

    /// Add an address for `name`. Names are case-insensitive.
    pub fn add_host(&self, name: &str, ip: IpAddr) {
        lock(&self.state)
            .names
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(ip);
    }

    /// Accept WebSocket connections to `url`
    pub fn serve_websocket(&self, url: &str) -> HostResult<WebSocketServer> {
        let mut state = lock(&self.state);
        if state.websockets.contains_key(url) {
            return Err(HostError::AddressInUse);
        }
        let (tx, rx) = mpsc::unbounded();
        state.websockets.insert(url.to_string(), tx);
        trace!(url, "loopback websocket server");
        Ok(WebSocketServer {
            state: Arc::clone(&self.state),
            url: url.to_string(),
            rx: Mutex::new(rx),
        })
    }
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for LoopbackHost {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        trace!(?level, source, message, "host console");
        lock(&self.state).logs.push(LogRecord {
            level,
            source: source.to_string(),
            message: message.to_string(),
        });
    }

    fn resolve(&self, name: &str, port: u16, hint: AddressHint) -> HostResult<Vec<NetAddress>> {
        let ips = match name.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => lock(&self.state)
                .names
                .get(&name.to_ascii_lowercase())
                .cloned()
                .ok_or(HostError::NameNotResolved)?,
        };
        let addrs: Vec<NetAddress> = ips
            .into_iter()
            .map(|ip| NetAddress::from(SocketAddr::new(ip, port)))
            .filter(|addr| hint.accepts(addr))
            .collect();
        trace!(name, ?hint, found = addrs.len(), "loopback resolve");
        if addrs.is_empty() {
            return Err(HostError::NameNotResolved);
        }
        Ok(addrs)
    }

    fn listen(&self, protocol: Protocol, addr: NetAddress) -> HostResult<Arc<dyn HostListener>> {
        if protocol == Protocol::Udp {
            return Err(HostError::NotSupported);
        }
        let mut state = lock(&self.state);
        let addr = if addr.port() == 0 {
            state.ephemeral(addr)
        } else {
            addr
        };
        if state.listeners.contains_key(&addr) {
            return Err(HostError::AddressInUse);
        }
        let (tx, rx) = mpsc::unbounded();
        state.listeners.insert(addr, tx.clone());
        let key = state.resources.insert("tcp listener");
        trace!(%addr, key, "loopback listen");

        Ok(Arc::new(StreamListener {
            state: Arc::clone(&self.state),
            key,
            addr,
            rx: Mutex::new(rx),
            self_tx: tx,
            closed: AtomicBool::new(false),
        }))
    }

    fn dial(
        &self,
        protocol: Protocol,
        local: Option<NetAddress>,
        remote: NetAddress,
    ) -> HostResult<Arc<dyn HostConnection>> {
        match protocol {
            Protocol::Tcp => self.dial_stream(local, remote),
            Protocol::Udp => self.dial_datagram(local, remote),
        }
    }

    fn bind_datagram(&self, addr: NetAddress) -> HostResult<Arc<dyn HostDatagram>> {
        let mut state = lock(&self.state);
        let local = if addr.port() == 0 {
            state.ephemeral(addr)
        } else {
            addr
        };
        let core = state.open_datagram(&self.state, local)?;
        trace!(%local, "loopback udp bind");
        Ok(Arc::new(DatagramSocket(core)))
    }

    fn dial_websocket(&self, url: &str) -> HostResult<Arc<dyn HostWebSocket>> {
        let (client, server, accept_tx) = {
            let mut state = lock(&self.state);
            let accept_tx = state
                .websockets
                .get(url)
                .cloned()
                .ok_or(HostError::ConnectionRefused)?;

            let (client_tx, client_rx) = mpsc::unbounded();
            let (server_tx, server_rx) = mpsc::unbounded();
            let client_key = state.resources.insert("websocket");
            let server_key = state.resources.insert("websocket");

            let client = Arc::new(WsPeer {
                state: Arc::clone(&self.state),
                key: client_key,
                url: url.to_string(),
                rx: Mutex::new(client_rx),
                self_tx: client_tx.clone(),
                peer_tx: server_tx.clone(),
                closed: AtomicBool::new(false),
            });
            let server = Arc::new(WsPeer {
                state: Arc::clone(&self.state),
                key: server_key,
                url: url.to_string(),
                rx: Mutex::new(server_rx),
                self_tx: server_tx,
                peer_tx: client_tx,
                closed: AtomicBool::new(false),
            });
            (client, server, accept_tx)
        };

        accept_tx
            .unbounded_send(server)
            .map_err(|_| HostError::ConnectionRefused)?;
        trace!(url, "loopback websocket connect");
        Ok(client)
    }
}

impl LoopbackHost {
    fn dial_stream(
        &self,
        local: Option<NetAddress>,
        remote: NetAddress,
    ) -> HostResult<Arc<dyn HostConnection>> {
        let (client, server, listener) = {
            let mut state = lock(&self.state);
            let listener = state
                .listeners
                .get(&remote)
                .or_else(|| state.listeners.get(&remote.unspecified()))
                .cloned()
                .ok_or(HostError::ConnectionRefused)?;
            let local = state.local_for(local, remote);

            let (client_tx, client_rx) = mpsc::unbounded();
            let (server_tx, server_rx) = mpsc::unbounded();
            let client_key = state.resources.insert("tcp connection");
            let server_key = state.resources.insert("tcp connection");

            let client = Arc::new(StreamConn {
                state: Arc::clone(&self.state),
                key: client_key,
                local,
                remote,
                inbound: Mutex::new(Inbound::new(client_rx)),
                self_tx: client_tx.clone(),
                peer_tx: server_tx.clone(),
                closed: AtomicBool::new(false),
            });
            let server = Arc::new(StreamConn {
                state: Arc::clone(&self.state),
                key: server_key,
                local: remote,
                remote: local,
                inbound: Mutex::new(Inbound::new(server_rx)),
                self_tx: server_tx,
                peer_tx: client_tx,
                closed: AtomicBool::new(false),
            });
            (client, server, listener)
        };

        // Connections release their registry slot on drop, so the state
        // lock must not be held if delivery fails.
        listener
            .unbounded_send(Incoming::Conn(server))
            .map_err(|_| HostError::ConnectionRefused)?;
        trace!(local = %client.local, %remote, "loopback connect");
        Ok(client)
    }

    fn dial_datagram(
        &self,
        local: Option<NetAddress>,
        remote: NetAddress,
    ) -> HostResult<Arc<dyn HostConnection>> {
        let mut state = lock(&self.state);
        let local = state.local_for(local, remote);
        let core = state.open_datagram(&self.state, local)?;
        Ok(Arc::new(DatagramEndpoint { core, remote }))
    }
}

struct StreamListener {
    state: Arc<Mutex<State>>,
    key: usize,
    addr: NetAddress,
    rx: Mutex<UnboundedReceiver<Incoming>>,
    self_tx: UnboundedSender<Incoming>,
    closed: AtomicBool,
}

impl HostListener for StreamListener {
    fn accept(&self) -> HostResult<Arc<dyn HostConnection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Aborted);
        }
        let mut rx = lock(&self.rx);
        match block_on(rx.next()) {
            Some(Incoming::Conn(conn)) => Ok(conn),
            Some(Incoming::Abort) | None => Err(HostError::Aborted),
        }
    }

    fn local_addr(&self) -> NetAddress {
        self.addr
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = lock(&self.state);
            state.listeners.remove(&self.addr);
            state.release(self.key);
        }
        let _ = self.self_tx.unbounded_send(Incoming::Abort);
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.close();
    }
}

struct Inbound {
    rx: UnboundedReceiver<Segment>,
    /// Tail of a segment larger than the last read buffer
    pending: Vec<u8>,
    eof: bool,
}

impl Inbound {
    fn new(rx: UnboundedReceiver<Segment>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            eof: false,
        }
    }
}

struct StreamConn {
    state: Arc<Mutex<State>>,
    key: usize,
    local: NetAddress,
    remote: NetAddress,
    inbound: Mutex<Inbound>,
    self_tx: UnboundedSender<Segment>,
    peer_tx: UnboundedSender<Segment>,
    closed: AtomicBool,
}

impl HostConnection for StreamConn {
    fn read(&self, buf: &mut [u8]) -> HostResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Aborted);
        }
        let mut inbound = lock(&self.inbound);
        if !inbound.pending.is_empty() {
            let n = buf.len().min(inbound.pending.len());
            buf[..n].copy_from_slice(&inbound.pending[..n]);
            inbound.pending.drain(..n);
            return Ok(n);
        }
        if inbound.eof {
            return Err(HostError::ConnectionClosed);
        }

        loop {
            match block_on(inbound.rx.next()) {
                Some(Segment::Data(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let n = buf.len().min(bytes.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    inbound.pending.extend_from_slice(&bytes[n..]);
                    return Ok(n);
                }
                Some(Segment::Fin) | None => {
                    inbound.eof = true;
                    return Err(HostError::ConnectionClosed);
                }
                Some(Segment::Abort) => return Err(HostError::Aborted),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> HostResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Aborted);
        }
        self.peer_tx
            .unbounded_send(Segment::Data(buf.to_vec()))
            .map_err(|_| HostError::ConnectionReset)?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> NetAddress {
        self.local
    }

    fn remote_addr(&self) -> NetAddress {
        self.remote
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.peer_tx.unbounded_send(Segment::Fin);
        let _ = self.self_tx.unbounded_send(Segment::Abort);
        lock(&self.state).release(self.key);
    }
}

impl Drop for StreamConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// A registered UDP port, shared by the connected and unconnected forms
struct DatagramCore {
    state: Arc<Mutex<State>>,
    key: usize,
    local: NetAddress,
    rx: Mutex<UnboundedReceiver<Packet>>,
    self_tx: UnboundedSender<Packet>,
    closed: AtomicBool,
}

impl DatagramCore {
    /// Receive the next datagram, skipping any not sent by `only_from`
    fn recv(
        &self,
        buf: &mut [u8],
        only_from: Option<NetAddress>,
    ) -> HostResult<(usize, NetAddress)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Aborted);
        }
        let mut rx = lock(&self.rx);
        loop {
            match block_on(rx.next()) {
                Some(Packet::Datagram { from, payload }) => {
                    if only_from.is_some_and(|peer| peer != from) {
                        continue;
                    }
                    let n = buf.len().min(payload.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    return Ok((n, from));
                }
                Some(Packet::Abort) | None => return Err(HostError::Aborted),
            }
        }
    }

    /// Datagrams to an address nobody is bound to are dropped
    fn send(&self, buf: &[u8], to: NetAddress) -> HostResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Aborted);
        }
        let target = lock(&self.state).endpoint_for(to);
        if let Some(tx) = target {
            let _ = tx.unbounded_send(Packet::Datagram {
                from: routable(self.local),
                payload: buf.to_vec(),
            });
        }
        Ok(buf.len())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = lock(&self.state);
            state.endpoints.remove(&self.local);
            state.release(self.key);
        }
        let _ = self.self_tx.unbounded_send(Packet::Abort);
    }
}

impl Drop for DatagramCore {
    fn drop(&mut self) {
        self.close();
    }
}

/// UDP endpoint connected to one peer
struct DatagramEndpoint {
    core: DatagramCore,
    remote: NetAddress,
}

impl HostConnection for DatagramEndpoint {
    fn read(&self, buf: &mut [u8]) -> HostResult<usize> {
        self.core.recv(buf, Some(self.remote)).map(|(n, _)| n)
    }

    fn write(&self, buf: &[u8]) -> HostResult<usize> {
        self.core.send(buf, self.remote)
    }

    fn local_addr(&self) -> NetAddress {
        self.core.local
    }

    fn remote_addr(&self) -> NetAddress {
        self.remote
    }

    fn close(&self) {
        self.core.close();
    }
}

/// Unconnected UDP endpoint
struct DatagramSocket(DatagramCore);

impl HostDatagram for DatagramSocket {
    fn send_to(&self, buf: &[u8], to: NetAddress) -> HostResult<usize> {
        self.0.send(buf, to)
    }

    fn recv_from(&self, buf: &mut [u8]) -> HostResult<(usize, NetAddress)> {
        self.0.recv(buf, None)
    }

    fn local_addr(&self) -> NetAddress {
        self.0.local
    }

    fn close(&self) {
        self.0.close();
    }
}

/// Accepts WebSocket connections for one URL
pub struct WebSocketServer {
    state: Arc<Mutex<State>>,
    url: String,
    rx: Mutex<UnboundedReceiver<Arc<WsPeer>>>,
}

impl WebSocketServer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Block until a client dials this URL
    pub fn accept(&self) -> HostResult<Arc<dyn HostWebSocket>> {
        let mut rx = lock(&self.rx);
        match block_on(rx.next()) {
            Some(peer) => Ok(peer),
            None => Err(HostError::Aborted),
        }
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        lock(&self.state).websockets.remove(&self.url);
    }
}

struct WsPeer {
    state: Arc<Mutex<State>>,
    key: usize,
    url: String,
    rx: Mutex<UnboundedReceiver<Frame>>,
    self_tx: UnboundedSender<Frame>,
    peer_tx: UnboundedSender<Frame>,
    closed: AtomicBool,
}

impl HostWebSocket for WsPeer {
    fn send(&self, message: WsMessage) -> HostResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Aborted);
        }
        self.peer_tx
            .unbounded_send(Frame::Message(message))
            .map_err(|_| HostError::ConnectionClosed)
    }

    fn receive(&self) -> HostResult<WsMessage> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Aborted);
        }
        let mut rx = lock(&self.rx);
        match block_on(rx.next()) {
            Some(Frame::Message(message)) => Ok(message),
            Some(Frame::Close) | None => Err(HostError::ConnectionClosed),
            Some(Frame::Abort) => Err(HostError::Aborted),
        }
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.peer_tx.unbounded_send(Frame::Close);
        let _ = self.self_tx.unbounded_send(Frame::Abort);
        lock(&self.state).release(self.key);
    }
}

impl Drop for WsPeer {
    fn drop(&mut self) {
        self.close();
    }
}
