//! Minimal TCP three-way handshake over a raw socket, needed to talk TCP from a forged address.
//!
//! There is no retransmission, no flow control and no teardown: once established, data segments
//! are sent one-shot and the local sequence number is advanced by the payload length.

use pnet::transport::{
    ipv4_packet_iter, transport_channel, TransportChannelType, TransportReceiver, TransportSender,
};
use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::Packet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::num::Wrapping;
use std::time::{Duration, Instant};

use crate::error::SendError;
use crate::packet::{self, TcpHeader, ACK, DEFAULT_WINDOW, PSH_ACK, SYN, SYN_ACK};
use crate::structs::L4Proto;

/// Number of bounded reads waiting for the SYN+ACK
pub const HANDSHAKE_ATTEMPTS: usize = 5;
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Send and receive whole IPv4 datagrams, header included.
pub trait RawSocket: Send {
    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize>;

    /// Wait for the next datagram. `Ok(None)` when the timeout elapses first.
    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// A layer 3 raw socket for one transport protocol. The kernel does not build the IP header.
pub struct PnetRawSocket {
    tx: TransportSender,
    rx: TransportReceiver,
}

impl PnetRawSocket {
    /// Requires root or CAP_NET_RAW. A denial is reported as `SendError::Privilege`.
    pub fn open(proto: L4Proto) -> Result<Self, SendError> {
        let channel_type =
            TransportChannelType::Layer3(IpNextHeaderProtocol::new(proto.get_protocol_number()));
        let (tx, rx) =
            transport_channel(4096, channel_type).map_err(SendError::from_socket_creation)?;
        Ok(PnetRawSocket { tx, rx })
    }
}

impl RawSocket for PnetRawSocket {
    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
        let ipv4_packet = Ipv4Packet::new(packet)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "truncated IPv4 packet"))?;
        self.tx.send_to(ipv4_packet, IpAddr::V4(destination))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut rx_iter = ipv4_packet_iter(&mut self.rx);
        match rx_iter.next_with_timeout(timeout) {
            Ok(received) => Ok(received.map(|(p, _)| p.packet().to_vec())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Closed,
    SynSent,
    Established,
    Failed,
}

/// The TCP state of one forged connection
#[derive(Debug)]
pub struct TcpSession {
    source: SocketAddrV4,
    destination: SocketAddrV4,
    seq: Wrapping<u32>,
    ack: Wrapping<u32>,
    ip_id: Wrapping<u16>,
    state: HandshakeState,
    attempt_timeout: Duration,
}

impl TcpSession {
    /// `source` carries the forged address and the ephemeral port.
    pub fn new(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        TcpSession {
            source,
            destination,
            seq: Wrapping(0),
            ack: Wrapping(0),
            ip_id: Wrapping(0),
            state: HandshakeState::Closed,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }

    /// Bound of each of the SYN+ACK reads
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn sequence(&self) -> u32 {
        self.seq.0
    }

    pub fn acknowledgement(&self) -> u32 {
        self.ack.0
    }

    pub fn source(&self) -> SocketAddrV4 {
        self.source
    }

    /// Run the handshake with the initial sequence number `isn`. Does nothing once established.
    ///
    /// The SYN is sent once, then up to `HANDSHAKE_ATTEMPTS` reads wait for the SYN+ACK, each
    /// bounded by the attempt timeout. Unrelated datagrams are dropped without ending the attempt.
    /// A failed session stays failed.
    pub fn connect(&mut self, socket: &mut impl RawSocket, isn: u32) -> Result<(), SendError> {
        match self.state {
            HandshakeState::Established => return Ok(()),
            HandshakeState::Failed => {
                return Err(SendError::HandshakeTimeout {
                    attempts: HANDSHAKE_ATTEMPTS,
                })
            }
            HandshakeState::Closed | HandshakeState::SynSent => (),
        }

        self.seq = Wrapping(isn);
        self.ack = Wrapping(0);
        self.ip_id = Wrapping(isn as u16);
        if let Err(e) = self.send_segment(socket, SYN, &[]) {
            self.state = HandshakeState::Failed;
            return Err(e.into());
        }
        self.state = HandshakeState::SynSent;
        log::debug!(
            "SYN sent {} -> {} (isn {isn})",
            self.source,
            self.destination
        );

        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            match self.wait_syn_ack(socket) {
                Ok(Some(reply)) => {
                    self.ack = Wrapping(reply.sequence) + Wrapping(1);
                    self.seq = Wrapping(reply.acknowledgement);
                    if let Err(e) = self.send_segment(socket, ACK, &[]) {
                        self.state = HandshakeState::Failed;
                        return Err(e.into());
                    }
                    self.state = HandshakeState::Established;
                    log::debug!(
                        "Handshake with {} established on attempt {attempt}",
                        self.destination
                    );
                    return Ok(());
                }
                Ok(None) => log::debug!(
                    "No SYN+ACK from {} (attempt {attempt}/{HANDSHAKE_ATTEMPTS})",
                    self.destination
                ),
                Err(e) => {
                    self.state = HandshakeState::Failed;
                    return Err(e.into());
                }
            }
        }
        self.state = HandshakeState::Failed;
        Err(SendError::HandshakeTimeout {
            attempts: HANDSHAKE_ATTEMPTS,
        })
    }

    /// One attempt: read until a matching SYN+ACK arrives or the deadline passes.
    fn wait_syn_ack(&self, socket: &mut impl RawSocket) -> io::Result<Option<TcpHeader>> {
        let deadline = Instant::now() + self.attempt_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match socket.recv_timeout(remaining)? {
                None => return Ok(None),
                Some(datagram) => match self.syn_ack_reply(&datagram) {
                    Some(reply) => return Ok(Some(reply)),
                    None => log::trace!("Discarded {} unrelated bytes", datagram.len()),
                },
            }
        }
    }

    /// The TCP header of `datagram` if it answers our SYN
    pub fn syn_ack_reply(&self, datagram: &[u8]) -> Option<TcpHeader> {
        let (ip, tcp) = packet::parse_tcp_datagram(datagram)?;
        (ip.destination == *self.source.ip()
            && tcp.source_port == self.destination.port()
            && tcp.destination_port == self.source.port()
            && tcp.flags == SYN_ACK)
            .then_some(tcp)
    }

    /// Send one PSH+ACK segment carrying `payload`.
    pub fn send_data(
        &mut self,
        socket: &mut impl RawSocket,
        payload: &[u8],
    ) -> Result<usize, SendError> {
        if self.state != HandshakeState::Established {
            return Err(SendError::Closed);
        }
        self.send_segment(socket, PSH_ACK, payload)?;
        self.seq += Wrapping(payload.len() as u32);
        log::trace!(
            "Sent {} bytes to {}, next seq {}",
            payload.len(),
            self.destination,
            self.seq
        );
        Ok(payload.len())
    }

    fn send_segment(
        &mut self,
        socket: &mut impl RawSocket,
        flags: u8,
        payload: &[u8],
    ) -> io::Result<usize> {
        let header = TcpHeader::new(
            self.source.port(),
            self.destination.port(),
            self.seq.0,
            self.ack.0,
            flags,
            DEFAULT_WINDOW,
        );
        let datagram = packet::build_tcp_packet(
            *self.source.ip(),
            *self.destination.ip(),
            self.ip_id.0,
            &header,
            payload,
        )?;
        self.ip_id += Wrapping(1);
        socket.send_to(&datagram, *self.destination.ip())
    }
}
