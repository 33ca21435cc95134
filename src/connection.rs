//! Stream-like connections to the target, either forged over a raw socket or dialed normally.

use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use std::io::{self, Write};
use std::net::{
    IpAddr, Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, UdpSocket,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{ConfigError, SendError};
use crate::handshake::{HandshakeState, PnetRawSocket, RawSocket, TcpSession};
use crate::packet;
use crate::structs::{L4Proto, Target};
use crate::utils;

/// Deadline of the liveness probe of dialed TCP connections
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1);
/// Lowest ephemeral port
pub const EPHEMERAL_PORT_MIN: u16 = 32768;

pub trait Connection: Send {
    /// Unique in a run, assigned by the connector
    fn id(&self) -> u64;

    fn protocol(&self) -> L4Proto;

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SendError>;

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SendError>;

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SendError>;

    /// Whether the connection can still be used. May perform a short blocking probe.
    fn is_alive(&mut self) -> bool;

    /// Release the underlying socket. Calling it again has no effect.
    fn close(&mut self);

    fn is_spoofed(&self) -> bool {
        false
    }
}

/// Creates the connections of a pool
pub trait Connector: Send + Sync {
    type Conn: Connection;

    fn connect(&self) -> Result<Self::Conn, SendError>;

    fn protocol(&self) -> L4Proto;
}

/// A send-only connection whose packets carry a forged source address.
///
/// For TCP the handshake runs on the first write. For UDP each write is one datagram.
pub struct SpoofedConnection<S: RawSocket> {
    id: u64,
    protocol: L4Proto,
    socket: Option<S>,
    source: SocketAddrV4,
    destination: SocketAddrV4,
    session: Option<TcpSession>,
    rng: Pcg32,
}

impl<S: RawSocket> SpoofedConnection<S> {
    /// Take ownership of `socket` and pick a random ephemeral source port.
    pub fn new(
        id: u64,
        protocol: L4Proto,
        socket: S,
        source_ip: Ipv4Addr,
        destination: SocketAddrV4,
        mut rng: Pcg32,
    ) -> Self {
        let port = EPHEMERAL_PORT_MIN + (rng.next_u32() % 32768) as u16;
        let source = SocketAddrV4::new(source_ip, port);
        let session = match protocol {
            L4Proto::TCP => Some(TcpSession::new(source, destination)),
            L4Proto::UDP => None,
        };
        SpoofedConnection {
            id,
            protocol,
            socket: Some(socket),
            source,
            destination,
            session,
            rng,
        }
    }

    /// Bound of each SYN+ACK read of the handshake
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.session = self
            .session
            .map(|s| s.with_attempt_timeout(timeout));
        self
    }

    pub fn source(&self) -> SocketAddrV4 {
        self.source
    }

    pub fn session(&self) -> Option<&TcpSession> {
        self.session.as_ref()
    }
}

impl<S: RawSocket> Connection for SpoofedConnection<S> {
    fn id(&self) -> u64 {
        self.id
    }

    fn protocol(&self) -> L4Proto {
        self.protocol
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        let socket = self.socket.as_mut().ok_or(SendError::Closed)?;
        match self.session.as_mut() {
            Some(session) => {
                session.connect(socket, self.rng.next_u32())?;
                session.send_data(socket, data)
            }
            None => {
                let datagram = packet::build_udp_packet(
                    *self.source.ip(),
                    *self.destination.ip(),
                    self.rng.next_u32() as u16,
                    self.source.port(),
                    self.destination.port(),
                    data,
                )?;
                socket.send_to(&datagram, *self.destination.ip())?;
                log::trace!(
                    "Sent {} bytes from {} to {}",
                    data.len(),
                    self.source,
                    self.destination
                );
                Ok(data.len())
            }
        }
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, SendError> {
        Err(SendError::ReadUnsupported)
    }

    // raw delivery ignores socket timeouts
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<(), SendError> {
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Option<Duration>) -> Result<(), SendError> {
        Ok(())
    }

    /// A raw socket cannot be probed: the connection is alive until closed or its handshake failed.
    fn is_alive(&mut self) -> bool {
        self.socket.is_some()
            && self
                .session
                .as_ref()
                .map_or(true, |s| s.state() != HandshakeState::Failed)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::trace!("Closed forged connection {} from {}", self.id, self.source);
        }
    }

    fn is_spoofed(&self) -> bool {
        true
    }
}

enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// A connection through the regular socket API, from the default local address
pub struct DialedConnection {
    id: u64,
    protocol: L4Proto,
    socket: Option<Socket>,
    read_timeout: Option<Duration>,
}

impl DialedConnection {
    pub fn connect(
        id: u64,
        protocol: L4Proto,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, SendError> {
        let socket = match protocol {
            L4Proto::TCP => {
                let stream = TcpStream::connect_timeout(&target, timeout)?;
                stream.set_write_timeout(Some(timeout))?;
                stream.set_nodelay(true)?;
                Socket::Tcp(stream)
            }
            L4Proto::UDP => {
                let local: SocketAddr = match target {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(target)?;
                Socket::Udp(socket)
            }
        };
        log::debug!("Connection {id} to {target} ({protocol}) opened");
        Ok(DialedConnection {
            id,
            protocol,
            socket: Some(socket),
            read_timeout: None,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.socket.as_ref()? {
            Socket::Tcp(s) => s.local_addr().ok(),
            Socket::Udp(s) => s.local_addr().ok(),
        }
    }
}

impl Connection for DialedConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn protocol(&self) -> L4Proto {
        self.protocol
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        match self.socket.as_mut().ok_or(SendError::Closed)? {
            Socket::Tcp(s) => {
                s.write_all(data)?;
                Ok(data.len())
            }
            Socket::Udp(s) => Ok(s.send(data)?),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SendError> {
        match self.socket.as_mut().ok_or(SendError::Closed)? {
            Socket::Tcp(s) => Ok(io::Read::read(s, buf)?),
            Socket::Udp(s) => Ok(s.recv(buf)?),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SendError> {
        match self.socket.as_ref().ok_or(SendError::Closed)? {
            Socket::Tcp(s) => s.set_read_timeout(timeout)?,
            Socket::Udp(s) => s.set_read_timeout(timeout)?,
        }
        self.read_timeout = timeout;
        Ok(())
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SendError> {
        match self.socket.as_ref().ok_or(SendError::Closed)? {
            Socket::Tcp(s) => s.set_write_timeout(timeout)?,
            Socket::Udp(s) => s.set_write_timeout(timeout)?,
        }
        Ok(())
    }

    /// TCP: a read bounded by `PROBE_TIMEOUT`. A timeout means idle but alive, EOF or an error
    /// means dead. Pending data from the peer does not make it dead. UDP is always alive.
    fn is_alive(&mut self) -> bool {
        let stream = match self.socket.as_ref() {
            None => return false,
            Some(Socket::Udp(_)) => return true,
            Some(Socket::Tcp(s)) => s,
        };
        if stream.set_read_timeout(Some(PROBE_TIMEOUT)).is_err() {
            return false;
        }
        let alive = match stream.peek(&mut [0u8; 1]) {
            Ok(n) => n > 0,
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        };
        alive && stream.set_read_timeout(self.read_timeout).is_ok()
    }

    fn close(&mut self) {
        if let Some(Socket::Tcp(s)) = self.socket.take() {
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}

/// Either kind of connection, as produced by `ConnectionFactory`
pub enum AnyConnection {
    Spoofed(SpoofedConnection<PnetRawSocket>),
    Dialed(DialedConnection),
}

macro_rules! delegate {
    ($self:ident, $c:ident => $e:expr) => {
        match $self {
            AnyConnection::Spoofed($c) => $e,
            AnyConnection::Dialed($c) => $e,
        }
    };
}

impl Connection for AnyConnection {
    fn id(&self) -> u64 {
        delegate!(self, c => c.id())
    }

    fn protocol(&self) -> L4Proto {
        delegate!(self, c => c.protocol())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        delegate!(self, c => c.write(data))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SendError> {
        delegate!(self, c => c.read(buf))
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SendError> {
        delegate!(self, c => c.set_read_timeout(timeout))
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SendError> {
        delegate!(self, c => c.set_write_timeout(timeout))
    }

    fn is_alive(&mut self) -> bool {
        delegate!(self, c => c.is_alive())
    }

    fn close(&mut self) {
        delegate!(self, c => c.close())
    }

    fn is_spoofed(&self) -> bool {
        delegate!(self, c => c.is_spoofed())
    }
}

/// Opens the raw socket of a forged connection
pub type RawSocketOpener = fn(L4Proto) -> Result<PnetRawSocket, SendError>;

/// Opens forged connections when the source address is foreign to this host, and regular
/// connections otherwise or when raw sockets are not available.
pub struct ConnectionFactory {
    target: Target,
    protocol: L4Proto,
    source_ip: Option<Ipv4Addr>,
    timeout: Duration,
    local_addrs: Vec<Ipv4Addr>,
    raw_disabled: AtomicBool,
    open_raw: RawSocketOpener,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(
        target: Target,
        protocol: L4Proto,
        source_ip: Option<IpAddr>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Self::with_local_addrs(
            target,
            protocol,
            source_ip,
            timeout,
            utils::local_ipv4_addresses(),
        )
    }

    /// Same as `new` with an explicit list of local addresses
    pub fn with_local_addrs(
        target: Target,
        protocol: L4Proto,
        source_ip: Option<IpAddr>,
        timeout: Duration,
        local_addrs: Vec<Ipv4Addr>,
    ) -> Result<Self, ConfigError> {
        let source_ip = match source_ip {
            None => None,
            Some(IpAddr::V4(ip)) => Some(ip),
            Some(ip @ IpAddr::V6(_)) => return Err(ConfigError::InvalidSourceIp(ip.to_string())),
        };
        let factory = ConnectionFactory {
            target,
            protocol,
            source_ip,
            timeout,
            local_addrs,
            raw_disabled: AtomicBool::new(false),
            open_raw: PnetRawSocket::open,
            next_id: AtomicU64::new(0),
        };
        if factory.spoofed_source().is_some() && factory.target.ipv4().is_none() {
            return Err(ConfigError::InvalidAddress(format!(
                "{} (forged packets need an IPv4 target)",
                factory.target.spec
            )));
        }
        Ok(factory)
    }

    /// Replace the raw socket creation, `PnetRawSocket::open` by default
    pub fn with_raw_opener(mut self, open_raw: RawSocketOpener) -> Self {
        self.open_raw = open_raw;
        self
    }

    /// Whether a privilege failure turned forging off for the rest of the run
    pub fn raw_disabled(&self) -> bool {
        self.raw_disabled.load(Ordering::Relaxed)
    }

    /// The source address to forge, if any: set, and not bound to a local interface
    pub fn spoofed_source(&self) -> Option<Ipv4Addr> {
        self.source_ip.filter(|ip| {
            !ip.is_unspecified() && !ip.is_loopback() && !self.local_addrs.contains(ip)
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn open_spoofed(&self, source_ip: Ipv4Addr, id: u64) -> Option<AnyConnection> {
        if self.raw_disabled.load(Ordering::Relaxed) {
            return None;
        }
        let destination = SocketAddrV4::new(self.target.ipv4()?, self.target.port());
        match (self.open_raw)(self.protocol) {
            Ok(socket) => {
                log::debug!("Connection {id}: forging {source_ip} towards {destination}");
                Some(AnyConnection::Spoofed(SpoofedConnection::new(
                    id,
                    self.protocol,
                    socket,
                    source_ip,
                    destination,
                    Pcg32::from_entropy(),
                )))
            }
            Err(e @ SendError::Privilege(_)) => {
                if !self.raw_disabled.swap(true, Ordering::Relaxed) {
                    log::warn!("{e}. Falling back to regular sockets.");
                }
                None
            }
            Err(e) => {
                log::warn!("Cannot open a raw socket ({e}). Falling back to a regular socket.");
                None
            }
        }
    }
}

impl Connector for ConnectionFactory {
    type Conn = AnyConnection;

    fn connect(&self) -> Result<AnyConnection, SendError> {
        let id = self.next_id();
        if let Some(conn) = self
            .spoofed_source()
            .and_then(|source_ip| self.open_spoofed(source_ip, id))
        {
            return Ok(conn);
        }
        Ok(AnyConnection::Dialed(DialedConnection::connect(
            id,
            self.protocol,
            self.target.addr,
            self.timeout,
        )?))
    }

    fn protocol(&self) -> L4Proto {
        self.protocol
    }
}
