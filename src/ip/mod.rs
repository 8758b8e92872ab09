//! IP transport: one TCP connection per target address, a UDP listener on the protocol port and one
//! UDP client socket per local interface for broadcasts.
//!
//! All sockets are non-blocking. Reads return `Ok(None)` while the requested amount of data is not
//! buffered yet; a read never returns a partial message. Several diagnostic sessions may share one
//! TCP connection (one gateway address, several ECUs behind it). Messages that belong to another
//! session are parked in the [`RoutingBuffer`] under that session's key.
pub mod buffer;
pub mod doip;
pub mod error;
pub mod header;

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

pub use buffer::{BufferIdentifier, RoutingBuffer};
pub use error::Error;
pub use header::AddressHeader;

/// Port used for TCP diagnostics and UDP discovery.
pub const DEFAULT_PORT: u16 = 13400;
const MAX_DATAGRAM: usize = 1500;

pub type SharedIpDispatcher = Arc<Mutex<IpDispatcher>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Addresses of the local interfaces to broadcast from. Empty means one socket on `0.0.0.0`.
    pub local_interfaces: Vec<Ipv4Addr>,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout_ms: 1000,
            local_interfaces: vec![],
        }
    }
}

impl IpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Stable index of a TCP connection. Handles are never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TcpHandle(pub usize);

enum TcpSlot {
    Disconnected { ip: Ipv4Addr },
    Connected { ip: Ipv4Addr, stream: TcpStream },
    Closed,
}

/// Outcome of a read on a shared connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedRead {
    NotEnoughData,
    Data(Vec<u8>),
    /// A complete message was read but belongs to another session. It was parked in the buffer.
    WrongRecipient,
}

/// Whether a failed connect only means the peer is not there yet.
pub fn is_connect_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

pub struct IpDispatcher {
    config: IpConfig,
    buffer: RoutingBuffer,
    tcp: Vec<TcpSlot>,
    udp_server: Option<UdpSocket>,
    udp_clients: Vec<UdpSocket>,
}

impl IpDispatcher {
    pub fn new(config: IpConfig, buffer: RoutingBuffer) -> Self {
        Self {
            config,
            buffer,
            tcp: vec![],
            udp_server: None,
            udp_clients: vec![],
        }
    }

    pub fn new_shared(config: IpConfig, buffer: RoutingBuffer) -> SharedIpDispatcher {
        Arc::new(Mutex::new(Self::new(config, buffer)))
    }

    pub fn config(&self) -> &IpConfig {
        &self.config
    }

    pub fn buffer(&self) -> &RoutingBuffer {
        &self.buffer
    }

    fn udp_socket(bind: Ipv4Addr, port: u16, reuse: bool) -> Result<UdpSocket, Error> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Socket)?;
        if reuse {
            socket.set_reuse_address(true).map_err(Error::Socket)?;
        }
        socket.set_broadcast(true).map_err(Error::Socket)?;
        socket.set_nonblocking(true).map_err(Error::Socket)?;
        let addr = SocketAddrV4::new(bind, port);
        socket.bind(&SockAddr::from(addr)).map_err(Error::Socket)?;
        Ok(socket.into())
    }

    /// Bind the listener on the protocol port and one client socket per local interface.
    pub fn init_udp(&mut self) -> Result<(), Error> {
        self.udp_server = Some(Self::udp_socket(Ipv4Addr::UNSPECIFIED, self.config.port, true)?);

        let interfaces = if self.config.local_interfaces.is_empty() {
            vec![Ipv4Addr::UNSPECIFIED]
        } else {
            self.config.local_interfaces.clone()
        };
        self.udp_clients = interfaces
            .into_iter()
            .map(|ip| Self::udp_socket(ip, 0, false))
            .collect::<Result<_, _>>()?;
        info!("UDP initialized on port {} with {} client socket(s)", self.config.port, self.udp_clients.len());
        Ok(())
    }

    /// Local addresses of the client sockets.
    pub fn udp_local_addrs(&self) -> Vec<SocketAddr> {
        self.udp_clients.iter().filter_map(|s| s.local_addr().ok()).collect()
    }

    pub fn send_udp_broadcast(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.udp_clients.is_empty() {
            return Err(Error::NotInitialized);
        }
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.config.port);
        for socket in &self.udp_clients {
            debug!("UDP TX broadcast {}", hex::encode(data));
            socket.send_to(data, target).map_err(Error::Socket)?;
        }
        Ok(())
    }

    pub fn send_udp_unicast(&mut self, ip: Ipv4Addr, data: &[u8]) -> Result<(), Error> {
        let socket = self.udp_clients.first().ok_or(Error::NotInitialized)?;
        debug!("UDP TX {} {}", ip, hex::encode(data));
        socket
            .send_to(data, SocketAddrV4::new(ip, self.config.port))
            .map_err(Error::Socket)?;
        Ok(())
    }

    /// Accept a datagram only if it was sent from the protocol port. The tool's own broadcasts
    /// come back from an ephemeral port and are dropped here.
    fn accept_datagram(&self, source: SocketAddr) -> Option<Ipv4Addr> {
        match source {
            SocketAddr::V4(addr) if addr.port() == self.config.port => Some(*addr.ip()),
            _ => None,
        }
    }

    /// Next datagram from a peer, with its sender address.
    pub fn read_udp(&mut self) -> Result<Option<(Vec<u8>, Ipv4Addr)>, Error> {
        if self.udp_server.is_none() {
            return Err(Error::NotInitialized);
        }
        let mut buf = [0u8; MAX_DATAGRAM];
        for socket in self.udp_clients.iter().chain(self.udp_server.iter()) {
            loop {
                let (len, source) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(Error::Socket(e)),
                };
                match self.accept_datagram(source) {
                    Some(ip) => {
                        debug!("UDP RX {} {}", ip, hex::encode(&buf[..len]));
                        return Ok(Some((buf[..len].to_vec(), ip)));
                    }
                    None => debug!("Dropping datagram from {}", source),
                }
            }
        }
        Ok(None)
    }

    /// Allocate a handle for `ip`. No connection is attempted until [`IpDispatcher::reconnect_tcp`].
    pub fn init_tcp(&mut self, ip: Ipv4Addr) -> TcpHandle {
        self.tcp.push(TcpSlot::Disconnected { ip });
        TcpHandle(self.tcp.len() - 1)
    }

    fn slot(&mut self, handle: TcpHandle) -> Result<&mut TcpSlot, Error> {
        match self.tcp.get_mut(handle.0) {
            None => Err(Error::InvalidHandle(handle.0)),
            Some(TcpSlot::Closed) => Err(Error::HandleClosed(handle.0)),
            Some(slot) => Ok(slot),
        }
    }

    fn stream(&mut self, handle: TcpHandle) -> Result<Option<&mut TcpStream>, Error> {
        match self.slot(handle)? {
            TcpSlot::Connected { stream, .. } => Ok(Some(stream)),
            _ => Ok(None),
        }
    }

    /// Drop any existing connection of `handle` and connect again, waiting at most the configured
    /// connect timeout. A peer that does not answer in time is not an error; the handle simply
    /// stays disconnected.
    pub fn reconnect_tcp(&mut self, handle: TcpHandle) -> Result<(), Error> {
        let port = self.config.port;
        let timeout = self.config.connect_timeout();
        let slot = self.slot(handle)?;
        let ip = match slot {
            TcpSlot::Disconnected { ip } | TcpSlot::Connected { ip, .. } => *ip,
            TcpSlot::Closed => return Err(Error::HandleClosed(handle.0)),
        };
        *slot = TcpSlot::Disconnected { ip };

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Socket)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
        match socket.connect_timeout(&addr.into(), timeout) {
            Ok(()) => {
                socket.set_nonblocking(true).map_err(Error::Socket)?;
                socket.set_nodelay(true).map_err(Error::Socket)?;
                info!("Connected to {}", addr);
                *slot = TcpSlot::Connected {
                    ip,
                    stream: socket.into(),
                };
                Ok(())
            }
            Err(e) if is_connect_timeout(&e) => {
                debug!("Connect to {} timed out", addr);
                Ok(())
            }
            Err(e) => Err(Error::Connect(e)),
        }
    }

    pub fn close_tcp(&mut self, handle: TcpHandle) -> Result<(), Error> {
        let slot = self.slot(handle)?;
        *slot = TcpSlot::Closed;
        Ok(())
    }

    pub fn is_tcp_connected(&mut self, handle: TcpHandle) -> Result<bool, Error> {
        Ok(self
            .stream(handle)?
            .map_or(false, |stream| stream.peer_addr().is_ok()))
    }

    pub(crate) fn disconnect(&mut self, handle: TcpHandle) {
        if let Some(slot) = self.tcp.get_mut(handle.0) {
            if let TcpSlot::Connected { ip, .. } = slot {
                let ip = *ip;
                warn!("Connection to {} lost", ip);
                *slot = TcpSlot::Disconnected { ip };
            }
        }
    }

    pub fn send_tcp(&mut self, handle: TcpHandle, data: &[u8]) -> Result<(), Error> {
        let stream = self.stream(handle)?.ok_or(Error::Socket(ErrorKind::NotConnected.into()))?;
        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => return Err(Error::Socket(ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => return Err(Error::Socket(e)),
            }
        }
        debug!("TCP TX {}", hex::encode(data));
        Ok(())
    }

    /// Look at the first `len` buffered bytes without consuming them.
    pub fn peek_tcp(&mut self, handle: TcpHandle, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let Some(stream) = self.stream(handle)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        match stream.peek(&mut buf) {
            Ok(0) if len > 0 => {
                self.disconnect(handle);
                Ok(None)
            }
            Ok(n) if n >= len => Ok(Some(buf)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Socket(e)),
        }
    }

    /// Read exactly `expected` bytes, or nothing if fewer are buffered.
    pub fn read_tcp(&mut self, handle: TcpHandle, expected: usize) -> Result<Option<Vec<u8>>, Error> {
        if self.peek_tcp(handle, expected)?.is_none() {
            return Ok(None);
        }
        let Some(stream) = self.stream(handle)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; expected];
        stream.read_exact(&mut buf).map_err(Error::Socket)?;
        debug!("TCP RX {}", hex::encode(&buf));
        Ok(Some(buf))
    }

    /// Read a complete message of `expected` bytes and check its address header against the
    /// session `id`. Messages for other sessions are parked under their own key.
    pub fn read_tcp_routed(
        &mut self,
        handle: TcpHandle,
        expected: usize,
        id: BufferIdentifier,
    ) -> Result<RoutedRead, Error> {
        let Some(message) = self.read_tcp(handle, expected)? else {
            return Ok(RoutedRead::NotEnoughData);
        };
        let header = AddressHeader::from_bytes(message.get(doip::HEADER_LEN..).unwrap_or_default())?;
        let actual = BufferIdentifier::new(header.target, header.source);
        if actual == id {
            return Ok(RoutedRead::Data(message));
        }

        debug!("Parking message for {:?}", actual);
        self.buffer.push(actual, message);
        Ok(RoutedRead::WrongRecipient)
    }

    /// Oldest message parked for `id`.
    pub fn drain_buffer(&self, id: &BufferIdentifier) -> Option<Vec<u8>> {
        self.buffer.pop(id)
    }
}
