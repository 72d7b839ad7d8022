//! IPv4 / TCP / UDP header parsing and packet builders
//!
//! Only the fields the conformance checks read are decoded. The builders
//! produce wire-correct datagrams (checksums included) for injection and for
//! scripted captures.

use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const OFFSET_MASK: u16 = 0x1fff;
const DEFAULT_TTL: u8 = 64;

/// TCP control bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub id: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in bytes
    pub fragment_offset: usize,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse a datagram, returning the header and its payload
    ///
    /// The payload is cut at `total_len`, which drops Ethernet padding.
    pub fn parse(datagram: &[u8]) -> Option<(Ipv4Header, &[u8])> {
        if datagram.len() < IPV4_HEADER_LEN || datagram[0] >> 4 != 4 {
            return None;
        }
        let header_len = usize::from(datagram[0] & 0x0f) * 4;
        let total_len = usize::from(u16::from_be_bytes([datagram[2], datagram[3]]));
        if header_len < IPV4_HEADER_LEN || total_len < header_len || datagram.len() < header_len {
            return None;
        }
        let frag = u16::from_be_bytes([datagram[6], datagram[7]]);

        let header = Ipv4Header {
            header_len,
            total_len,
            id: u16::from_be_bytes([datagram[4], datagram[5]]),
            dont_fragment: frag & FLAG_DONT_FRAGMENT != 0,
            more_fragments: frag & FLAG_MORE_FRAGMENTS != 0,
            fragment_offset: usize::from(frag & OFFSET_MASK) * 8,
            ttl: datagram[8],
            protocol: datagram[9],
            src: Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]),
            dst: Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]),
        };

        let end = total_len.min(datagram.len());
        Some((header, &datagram[header_len..end]))
    }

    /// Whether this datagram is one piece of a larger one
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset > 0
    }

    pub fn payload_len(&self) -> usize {
        self.total_len - self.header_len
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

impl TcpHeader {
    pub fn parse(segment: &[u8]) -> Option<TcpHeader> {
        if segment.len() < TCP_HEADER_LEN {
            return None;
        }
        Some(TcpHeader {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            flags: TcpFlags(segment[13]),
            window: u16::from_be_bytes([segment[14], segment[15]]),
        })
    }
}

/// Source and destination ports of a UDP datagram
pub fn udp_ports(datagram: &[u8]) -> Option<(u16, u16)> {
    if datagram.len() < UDP_HEADER_LEN {
        return None;
    }
    Some((
        u16::from_be_bytes([datagram[0], datagram[1]]),
        u16::from_be_bytes([datagram[2], datagram[3]]),
    ))
}

/// RFC 1071 ones' complement sum
pub fn checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut carry: Option<u8> = None;

    for chunk in chunks {
        for &byte in chunk.iter() {
            match carry.take() {
                Some(high) => sum += u32::from(u16::from_be_bytes([high, byte])),
                None => carry = Some(byte),
            }
        }
    }
    if let Some(high) = carry {
        sum += u32::from(u16::from_be_bytes([high, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    payload_len: usize,
    fragment: u16,
) -> [u8; IPV4_HEADER_LEN] {
    let mut h = [0u8; IPV4_HEADER_LEN];
    let total = (IPV4_HEADER_LEN + payload_len) as u16;
    h[0] = 0x45;
    h[2..4].copy_from_slice(&total.to_be_bytes());
    h[4..6].copy_from_slice(&id.to_be_bytes());
    h[6..8].copy_from_slice(&fragment.to_be_bytes());
    h[8] = DEFAULT_TTL;
    h[9] = protocol;
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    let sum = checksum(&[&h[..]]);
    h[10..12].copy_from_slice(&sum.to_be_bytes());
    h
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> [u8; 12] {
    let mut p = [0u8; 12];
    p[0..4].copy_from_slice(&src.octets());
    p[4..8].copy_from_slice(&dst.octets());
    p[9] = protocol;
    p[10..12].copy_from_slice(&(len as u16).to_be_bytes());
    p
}

/// Parameters of one TCP segment to build
#[derive(Clone, Copy, Debug)]
pub struct SegmentSpec {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub id: u16,
}

/// Build an IPv4 datagram carrying a header-only TCP segment
pub fn build_tcp_segment(spec: &SegmentSpec) -> Vec<u8> {
    let mut tcp = [0u8; TCP_HEADER_LEN];
    tcp[0..2].copy_from_slice(&spec.src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&spec.dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&spec.seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&spec.ack.to_be_bytes());
    tcp[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    tcp[13] = spec.flags.0;
    tcp[14..16].copy_from_slice(&64240u16.to_be_bytes());
    let pseudo = pseudo_header(spec.src, spec.dst, PROTO_TCP, TCP_HEADER_LEN);
    let sum = checksum(&[&pseudo[..], &tcp[..]]);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());

    let mut datagram = ipv4_header(
        spec.src,
        spec.dst,
        PROTO_TCP,
        spec.id,
        TCP_HEADER_LEN,
        FLAG_DONT_FRAGMENT,
    )
    .to_vec();
    datagram.extend_from_slice(&tcp);
    datagram
}

/// Build a UDP datagram payload (header included) of exactly `total_len` bytes
pub fn build_udp_payload(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    total_len: usize,
) -> Vec<u8> {
    let total_len = total_len.max(UDP_HEADER_LEN);
    let mut udp = vec![0u8; total_len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(total_len as u16).to_be_bytes());
    for (i, byte) in udp[UDP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let pseudo = pseudo_header(src, dst, PROTO_UDP, total_len);
    let sum = match checksum(&[&pseudo[..], &udp[..]]) {
        0 => 0xffff,
        s => s,
    };
    udp[6..8].copy_from_slice(&sum.to_be_bytes());
    udp
}

/// Split an IP payload into the datagrams a link with `mtu` would carry
///
/// Every fragment but the last carries a multiple of 8 bytes and the "more
/// fragments" flag.
pub fn build_fragments(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    payload: &[u8],
    mtu: usize,
) -> Vec<Vec<u8>> {
    let per_fragment = (mtu.saturating_sub(IPV4_HEADER_LEN) / 8 * 8).max(8);

    if payload.len() + IPV4_HEADER_LEN <= mtu {
        let mut datagram = ipv4_header(src, dst, protocol, id, payload.len(), 0).to_vec();
        datagram.extend_from_slice(payload);
        return vec![datagram];
    }

    payload
        .chunks(per_fragment)
        .enumerate()
        .map(|(i, chunk)| {
            let offset = i * per_fragment;
            let last = offset + chunk.len() == payload.len();
            let mut field = ((offset / 8) as u16) & OFFSET_MASK;
            if !last {
                field |= FLAG_MORE_FRAGMENTS;
            }
            let mut datagram = ipv4_header(src, dst, protocol, id, chunk.len(), field).to_vec();
            datagram.extend_from_slice(chunk);
            datagram
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn test_syn_segment_parses_back() {
        let datagram = build_tcp_segment(&SegmentSpec {
            src: CLIENT,
            dst: SERVER,
            src_port: 40000,
            dst_port: 80,
            seq: 100,
            ack: 0,
            flags: TcpFlags::SYN,
            id: 7,
        });

        let (ip, payload) = Ipv4Header::parse(&datagram).unwrap();
        assert_eq!(ip.protocol, PROTO_TCP);
        assert_eq!((ip.src, ip.dst), (CLIENT, SERVER));
        assert!(ip.dont_fragment);
        assert!(!ip.is_fragment());
        // A correct header checksums to zero
        assert_eq!(checksum(&[&datagram[..IPV4_HEADER_LEN]]), 0);

        let tcp = TcpHeader::parse(payload).unwrap();
        assert_eq!(tcp.seq, 100);
        assert!(tcp.flags.contains(TcpFlags::SYN));
        assert!(!tcp.flags.contains(TcpFlags::ACK));

        let pseudo = pseudo_header(CLIENT, SERVER, PROTO_TCP, payload.len());
        assert_eq!(checksum(&[&pseudo[..], payload]), 0);
    }

    #[test]
    fn test_fragments_for_1500_mtu() {
        let payload = build_udp_payload(CLIENT, SERVER, 5000, 5001, 3000);
        let fragments = build_fragments(CLIENT, SERVER, PROTO_UDP, 42, &payload, 1500);
        assert_eq!(fragments.len(), 3);

        let headers: Vec<Ipv4Header> = fragments
            .iter()
            .map(|f| Ipv4Header::parse(f).unwrap().0)
            .collect();
        let offsets: Vec<usize> = headers.iter().map(|h| h.fragment_offset).collect();
        assert_eq!(offsets, vec![0, 1480, 2960]);
        assert_eq!(
            headers.iter().map(|h| h.more_fragments).collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert_eq!(headers.iter().map(|h| h.payload_len()).sum::<usize>(), 3000);
        assert!(headers.iter().all(|h| h.id == 42));
    }

    #[test]
    fn test_small_payload_is_not_fragmented() {
        let fragments = build_fragments(CLIENT, SERVER, PROTO_UDP, 1, &[0u8; 100], 1500);
        assert_eq!(fragments.len(), 1);
        let (ip, payload) = Ipv4Header::parse(&fragments[0]).unwrap();
        assert!(!ip.is_fragment());
        assert_eq!(payload.len(), 100);
    }

    #[test]
    fn test_rejects_short_or_non_ipv4() {
        assert!(Ipv4Header::parse(&[0x45, 0, 0]).is_none());
        assert!(Ipv4Header::parse(&[0x60; 40]).is_none());
        assert!(TcpHeader::parse(&[0u8; 10]).is_none());
    }
}
