//! Hand-built IPv4, TCP and UDP headers and their Internet checksums (RFC 1071).
//!
//! Headers are fixed-layout value types: `to_bytes` serializes them in network byte order and
//! `parse` reads them back. IPv4 options and TCP options are never emitted.

use pnet_packet::tcp::TcpFlags;
use std::io;
use std::net::Ipv4Addr;

use crate::structs::L4Proto;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const PSEUDO_HEADER_LEN: usize = 12;
pub const DEFAULT_TTL: u8 = 64;
pub const DEFAULT_WINDOW: u16 = 65535;
/// Don't Fragment, no offset
pub const FLAG_DONT_FRAGMENT: u16 = 0x4000;

pub const SYN: u8 = TcpFlags::SYN;
pub const ACK: u8 = TcpFlags::ACK;
pub const SYN_ACK: u8 = TcpFlags::SYN | TcpFlags::ACK;
pub const PSH_ACK: u8 = TcpFlags::PSH | TcpFlags::ACK;

/// Field offsets inside an IPv4 header
mod ip_off {
    pub const VERSION_IHL: usize = 0;
    pub const TOS: usize = 1;
    pub const TOTAL_LENGTH: usize = 2;
    pub const IDENTIFICATION: usize = 4;
    pub const FLAGS_FRAGMENT: usize = 6;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: usize = 10;
    pub const SOURCE: usize = 12;
    pub const DESTINATION: usize = 16;
}

/// Field offsets inside a TCP header
mod tcp_off {
    pub const SOURCE_PORT: usize = 0;
    pub const DESTINATION_PORT: usize = 2;
    pub const SEQUENCE: usize = 4;
    pub const ACKNOWLEDGEMENT: usize = 8;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: usize = 14;
    pub const CHECKSUM: usize = 16;
    pub const URGENT: usize = 18;
}

/// Field offsets inside a UDP header
mod udp_off {
    pub const SOURCE_PORT: usize = 0;
    pub const DESTINATION_PORT: usize = 2;
    pub const LENGTH: usize = 4;
    pub const CHECKSUM: usize = 6;
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn get_ipv4(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    )
}

/// Running one's complement sum. Bytes may be fed in several slices: an odd trailing byte is
/// kept until the next slice so that the words stay aligned.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternetChecksum {
    sum: u64,
    pending: Option<u8>,
}

impl InternetChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut bytes: &[u8]) -> &mut Self {
        if let Some(high) = self.pending.take() {
            match bytes.split_first() {
                Some((low, rest)) => {
                    self.sum += u64::from(u16::from_be_bytes([high, *low]));
                    bytes = rest;
                }
                None => {
                    self.pending = Some(high);
                    return self;
                }
            }
        }
        let mut words = bytes.chunks_exact(2);
        for w in &mut words {
            self.sum += u64::from(u16::from_be_bytes([w[0], w[1]]));
        }
        if let [last] = words.remainder() {
            self.pending = Some(*last);
        }
        self
    }

    /// Pad the odd byte with a zero low byte, fold the carries and complement.
    pub fn finish(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(high) = self.pending {
            sum += u64::from(high) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// RFC 1071 checksum of a byte sequence
pub fn checksum(bytes: &[u8]) -> u16 {
    InternetChecksum::new().add(bytes).finish()
}

/// The 12 bytes prepended to a TCP or UDP segment for its checksum. Never transmitted.
pub fn pseudo_header(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    segment_len: u16,
) -> [u8; PSEUDO_HEADER_LEN] {
    let mut buf = [0u8; PSEUDO_HEADER_LEN];
    buf[0..4].copy_from_slice(&source.octets());
    buf[4..8].copy_from_slice(&destination.octets());
    buf[9] = protocol;
    put_u16(&mut buf, 10, segment_len);
    buf
}

/// Checksum of a transport header and its payload. The checksum field of `header` must be zero.
pub fn transport_checksum(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: L4Proto,
    header: &[u8],
    payload: &[u8],
) -> u16 {
    let len = (header.len() + payload.len()) as u16;
    InternetChecksum::new()
        .add(&pseudo_header(
            source,
            destination,
            protocol.get_protocol_number(),
            len,
        ))
        .add(header)
        .add(payload)
        .finish()
}

pub fn tcp_checksum(source: Ipv4Addr, destination: Ipv4Addr, header: &[u8], payload: &[u8]) -> u16 {
    transport_checksum(source, destination, L4Proto::TCP, header, payload)
}

/// A computed UDP checksum of zero is transmitted as 0xFFFF, zero meaning "no checksum".
pub fn udp_checksum(source: Ipv4Addr, destination: Ipv4Addr, header: &[u8], payload: &[u8]) -> u16 {
    non_zero(transport_checksum(
        source,
        destination,
        L4Proto::UDP,
        header,
        payload,
    ))
}

fn non_zero(checksum: u16) -> u16 {
    if checksum == 0 {
        0xFFFF
    } else {
        checksum
    }
}

/// A 20-byte IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// in 32-bit words; always 5 when serialized
    pub header_length: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    pub fn new(protocol: L4Proto, source: Ipv4Addr, destination: Ipv4Addr, payload_len: u16) -> Self {
        Ipv4Header {
            header_length: 5,
            tos: 0,
            total_length: IPV4_HEADER_LEN as u16 + payload_len,
            identification: 0,
            flags_fragment: FLAG_DONT_FRAGMENT,
            ttl: DEFAULT_TTL,
            protocol: protocol.get_protocol_number(),
            checksum: 0,
            source,
            destination,
        }
    }

    /// Serialize with the header checksum computed over the other fields.
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut buf = [0u8; IPV4_HEADER_LEN];
        buf[ip_off::VERSION_IHL] = 0x45;
        buf[ip_off::TOS] = self.tos;
        put_u16(&mut buf, ip_off::TOTAL_LENGTH, self.total_length);
        put_u16(&mut buf, ip_off::IDENTIFICATION, self.identification);
        put_u16(&mut buf, ip_off::FLAGS_FRAGMENT, self.flags_fragment);
        buf[ip_off::TTL] = self.ttl;
        buf[ip_off::PROTOCOL] = self.protocol;
        buf[ip_off::SOURCE..ip_off::SOURCE + 4].copy_from_slice(&self.source.octets());
        buf[ip_off::DESTINATION..ip_off::DESTINATION + 4]
            .copy_from_slice(&self.destination.octets());
        let sum = checksum(&buf);
        put_u16(&mut buf, ip_off::CHECKSUM, sum);
        buf
    }

    /// Read an IPv4 header. Returns None for other IP versions or truncated data.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < IPV4_HEADER_LEN || buf[ip_off::VERSION_IHL] >> 4 != 4 {
            return None;
        }
        let header_length = buf[ip_off::VERSION_IHL] & 0x0F;
        if header_length < 5 || buf.len() < header_length as usize * 4 {
            return None;
        }
        Some(Ipv4Header {
            header_length,
            tos: buf[ip_off::TOS],
            total_length: get_u16(buf, ip_off::TOTAL_LENGTH),
            identification: get_u16(buf, ip_off::IDENTIFICATION),
            flags_fragment: get_u16(buf, ip_off::FLAGS_FRAGMENT),
            ttl: buf[ip_off::TTL],
            protocol: buf[ip_off::PROTOCOL],
            checksum: get_u16(buf, ip_off::CHECKSUM),
            source: get_ipv4(buf, ip_off::SOURCE),
            destination: get_ipv4(buf, ip_off::DESTINATION),
        })
    }

    /// Offset of the transport header
    pub fn payload_offset(&self) -> usize {
        self.header_length as usize * 4
    }
}

/// A 20-byte TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    /// in 32-bit words
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub fn new(
        source_port: u16,
        destination_port: u16,
        sequence: u32,
        acknowledgement: u32,
        flags: u8,
        window: u16,
    ) -> Self {
        TcpHeader {
            source_port,
            destination_port,
            sequence,
            acknowledgement,
            data_offset: 5,
            flags,
            window,
            checksum: 0,
            urgent: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut buf = [0u8; TCP_HEADER_LEN];
        put_u16(&mut buf, tcp_off::SOURCE_PORT, self.source_port);
        put_u16(&mut buf, tcp_off::DESTINATION_PORT, self.destination_port);
        put_u32(&mut buf, tcp_off::SEQUENCE, self.sequence);
        put_u32(&mut buf, tcp_off::ACKNOWLEDGEMENT, self.acknowledgement);
        buf[tcp_off::DATA_OFFSET] = 5 << 4;
        buf[tcp_off::FLAGS] = self.flags;
        put_u16(&mut buf, tcp_off::WINDOW, self.window);
        put_u16(&mut buf, tcp_off::CHECKSUM, self.checksum);
        put_u16(&mut buf, tcp_off::URGENT, self.urgent);
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < TCP_HEADER_LEN {
            return None;
        }
        Some(TcpHeader {
            source_port: get_u16(buf, tcp_off::SOURCE_PORT),
            destination_port: get_u16(buf, tcp_off::DESTINATION_PORT),
            sequence: get_u32(buf, tcp_off::SEQUENCE),
            acknowledgement: get_u32(buf, tcp_off::ACKNOWLEDGEMENT),
            data_offset: buf[tcp_off::DATA_OFFSET] >> 4,
            flags: buf[tcp_off::FLAGS],
            window: get_u16(buf, tcp_off::WINDOW),
            checksum: get_u16(buf, tcp_off::CHECKSUM),
            urgent: get_u16(buf, tcp_off::URGENT),
        })
    }
}

/// An 8-byte UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    /// header and payload
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut buf = [0u8; UDP_HEADER_LEN];
        put_u16(&mut buf, udp_off::SOURCE_PORT, self.source_port);
        put_u16(&mut buf, udp_off::DESTINATION_PORT, self.destination_port);
        put_u16(&mut buf, udp_off::LENGTH, self.length);
        put_u16(&mut buf, udp_off::CHECKSUM, self.checksum);
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDP_HEADER_LEN {
            return None;
        }
        Some(UdpHeader {
            source_port: get_u16(buf, udp_off::SOURCE_PORT),
            destination_port: get_u16(buf, udp_off::DESTINATION_PORT),
            length: get_u16(buf, udp_off::LENGTH),
            checksum: get_u16(buf, udp_off::CHECKSUM),
        })
    }
}

pub fn build_ip_header(
    protocol: L4Proto,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    payload_len: u16,
) -> [u8; IPV4_HEADER_LEN] {
    Ipv4Header::new(protocol, source, destination, payload_len).to_bytes()
}

/// TCP header with a zero checksum
pub fn build_tcp_header(
    source_port: u16,
    destination_port: u16,
    sequence: u32,
    acknowledgement: u32,
    flags: u8,
    window: u16,
) -> [u8; TCP_HEADER_LEN] {
    TcpHeader::new(
        source_port,
        destination_port,
        sequence,
        acknowledgement,
        flags,
        window,
    )
    .to_bytes()
}

/// UDP header with a zero checksum. `length` covers the header and the payload.
pub fn build_udp_header(source_port: u16, destination_port: u16, length: u16) -> [u8; UDP_HEADER_LEN] {
    UdpHeader {
        source_port,
        destination_port,
        length,
        checksum: 0,
    }
    .to_bytes()
}

fn checked_len(header_len: usize, payload: &[u8]) -> io::Result<u16> {
    u16::try_from(IPV4_HEADER_LEN + header_len + payload.len())
        .map(|_| (header_len + payload.len()) as u16)
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes does not fit in an IPv4 packet", payload.len()),
            )
        })
}

/// A complete IPv4 + TCP packet, both checksums filled
pub fn build_tcp_packet(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    identification: u16,
    tcp: &TcpHeader,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let segment_len = checked_len(TCP_HEADER_LEN, payload)?;
    let ip = Ipv4Header {
        identification,
        ..Ipv4Header::new(L4Proto::TCP, source, destination, segment_len)
    };
    let header = TcpHeader { checksum: 0, ..*tcp }.to_bytes();
    let tcp = TcpHeader {
        checksum: tcp_checksum(source, destination, &header, payload),
        ..*tcp
    };

    let mut packet = Vec::with_capacity(IPV4_HEADER_LEN + segment_len as usize);
    packet.extend_from_slice(&ip.to_bytes());
    packet.extend_from_slice(&tcp.to_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// A complete IPv4 + UDP datagram, both checksums filled
pub fn build_udp_packet(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    identification: u16,
    source_port: u16,
    destination_port: u16,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let datagram_len = checked_len(UDP_HEADER_LEN, payload)?;
    let ip = Ipv4Header {
        identification,
        ..Ipv4Header::new(L4Proto::UDP, source, destination, datagram_len)
    };
    let header = build_udp_header(source_port, destination_port, datagram_len);
    let udp = UdpHeader {
        source_port,
        destination_port,
        length: datagram_len,
        checksum: udp_checksum(source, destination, &header, payload),
    };

    let mut packet = Vec::with_capacity(IPV4_HEADER_LEN + datagram_len as usize);
    packet.extend_from_slice(&ip.to_bytes());
    packet.extend_from_slice(&udp.to_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Split a received datagram into its IPv4 and TCP headers. None if it is not IPv4/TCP.
pub fn parse_tcp_datagram(buf: &[u8]) -> Option<(Ipv4Header, TcpHeader)> {
    let ip = Ipv4Header::parse(buf)?;
    if ip.protocol != L4Proto::TCP.get_protocol_number() {
        return None;
    }
    let tcp = TcpHeader::parse(&buf[ip.payload_offset()..])?;
    Some((ip, tcp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use rand_core::{RngCore, SeedableRng};
    use rand_pcg::Pcg32;
    use pnet_packet::ipv4::Ipv4Packet;
    use pnet_packet::tcp::TcpPacket;
    use pnet_packet::udp::UdpPacket;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

    #[test]
    fn golden_tcp_checksum() {
        let header = [0u8; TCP_HEADER_LEN];
        assert_eq!(tcp_checksum(SRC, DST, &header, &[]), 0x7C91);
    }

    #[test]
    fn golden_ip_header() {
        let mut header = hex!("4500 0073 0000 4000 4011 0000 c0a8 0001 c0a8 00c7");
        assert_eq!(checksum(&header), 0xb861);
        header[10..12].copy_from_slice(&0xb861u16.to_be_bytes());
        assert_eq!(checksum(&header), 0);

        let built = build_ip_header(
            L4Proto::UDP,
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(192, 168, 0, 199),
            0x73 - IPV4_HEADER_LEN as u16,
        );
        assert_eq!(built, header);
    }

    #[test]
    fn odd_length_and_streaming() {
        // trailing byte is padded with a zero low byte
        assert_eq!(checksum(&[0x01]), !0x0100);
        let data = hex!("0001 f203 f4f5 f6f7 ab");
        let mut split = InternetChecksum::new();
        split.add(&data[..3]).add(&[]).add(&data[3..4]).add(&data[4..]);
        assert_eq!(split.finish(), checksum(&data));
        assert_eq!(non_zero(0), 0xFFFF);
        assert_eq!(non_zero(0x1234), 0x1234);
    }

    #[test]
    fn checksums_self_verify() {
        let mut rng = Pcg32::seed_from_u64(1071);
        let mut payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"x".to_vec(),
            b"<134>Oct 01 22:14:15 web-01 nginx: odd".to_vec(),
        ];
        for len in (1..=64).chain([255, 511, 1024, 1399]) {
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);
            payloads.push(payload);
        }
        for payload in &payloads {
            let payload = payload.as_slice();
            let packet = build_tcp_packet(
                SRC,
                DST,
                0xbeef,
                &TcpHeader::new(40000, 514, 7, 9, PSH_ACK, DEFAULT_WINDOW),
                payload,
            )
            .unwrap();
            assert_eq!(checksum(&packet[..IPV4_HEADER_LEN]), 0);
            let segment = &packet[IPV4_HEADER_LEN..];
            let verify = InternetChecksum::new()
                .add(&pseudo_header(SRC, DST, 6, segment.len() as u16))
                .add(segment)
                .finish();
            assert_eq!(verify, 0);

            let packet = build_udp_packet(SRC, DST, 1, 40000, 514, payload).unwrap();
            assert_eq!(checksum(&packet[..IPV4_HEADER_LEN]), 0);
            let datagram = &packet[IPV4_HEADER_LEN..];
            let verify = InternetChecksum::new()
                .add(&pseudo_header(SRC, DST, 17, datagram.len() as u16))
                .add(datagram)
                .finish();
            assert_eq!(verify, 0);
        }
    }

    #[test]
    fn agrees_with_pnet() {
        let payload = b"<13>1 2024-01-01T00:00:00.000Z host app - - - hello";
        let header = TcpHeader::new(51000, 601, 0xdeadbeef, 0x01020304, PSH_ACK, 1024);
        let packet = build_tcp_packet(SRC, DST, 42, &header, payload).unwrap();
        let ip = Ipv4Packet::new(&packet).unwrap();
        assert_eq!(ip.get_checksum(), pnet_packet::ipv4::checksum(&ip));
        assert_eq!(ip.get_total_length() as usize, packet.len());
        let tcp = TcpPacket::new(&packet[IPV4_HEADER_LEN..]).unwrap();
        assert_eq!(
            tcp.get_checksum(),
            pnet_packet::tcp::ipv4_checksum(&tcp, &SRC, &DST)
        );
        assert_eq!(tcp.get_flags(), TcpFlags::PSH | TcpFlags::ACK);
        assert_eq!(tcp.get_data_offset(), 5);

        let packet = build_udp_packet(SRC, DST, 43, 51000, 514, payload).unwrap();
        let udp = UdpPacket::new(&packet[IPV4_HEADER_LEN..]).unwrap();
        assert_eq!(udp.get_length() as usize, UDP_HEADER_LEN + payload.len());
        assert_eq!(
            udp.get_checksum(),
            pnet_packet::udp::ipv4_checksum(&udp, &SRC, &DST)
        );
    }

    #[test]
    fn parse_built_packet() {
        let header = TcpHeader::new(40001, 514, 100, 200, SYN_ACK, DEFAULT_WINDOW);
        let packet = build_tcp_packet(DST, SRC, 7, &header, &[]).unwrap();
        let (ip, tcp) = parse_tcp_datagram(&packet).unwrap();
        assert_eq!(ip.source, DST);
        assert_eq!(ip.destination, SRC);
        assert_eq!(ip.ttl, DEFAULT_TTL);
        assert_eq!(ip.flags_fragment, FLAG_DONT_FRAGMENT);
        assert_eq!(tcp.flags, SYN_ACK);
        assert_eq!(tcp.sequence, 100);
        assert_eq!(tcp.acknowledgement, 200);

        let udp = build_udp_packet(SRC, DST, 1, 1, 2, b"x").unwrap();
        assert!(parse_tcp_datagram(&udp).is_none());
        assert!(parse_tcp_datagram(&packet[..30]).is_none());
        let mut v6 = packet.clone();
        v6[0] = 0x65;
        assert!(Ipv4Header::parse(&v6).is_none());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; 65535];
        let err = build_udp_packet(SRC, DST, 0, 1, 2, &payload).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
