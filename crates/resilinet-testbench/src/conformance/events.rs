//! Typed protocol events
//!
//! Raw capture records are decoded into [`ProtocolEvent`]s. Handshake events
//! are named from the initiator's point of view: a SYN is `SynSent`, a
//! SYN-ACK is `SynAckReceived` and the first plain ACK is `AckSent`,
//! whichever interface the capture ran on.

use super::packet::{udp_ports, Ipv4Header, TcpFlags, TcpHeader, PROTO_TCP, PROTO_UDP};
use crate::capture::CaptureFilter;
use crate::pcap::RawPacket;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum EventKind {
    SynSent {
        src_port: u16,
        dst_port: u16,
        seq: u32,
    },
    SynAckReceived {
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
    },
    AckSent {
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
    },
    /// One piece of a datagram; an unfragmented datagram is a single piece
    /// at offset 0 without "more fragments"
    FragmentObserved {
        id: u16,
        protocol: u8,
        offset: usize,
        more_fragments: bool,
        payload_len: usize,
    },
    /// Anything else that passed the filter (RST, FIN, data)
    Other { protocol: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProtocolEvent {
    /// Capture timestamp
    pub at: Duration,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub kind: EventKind,
}

impl ProtocolEvent {
    /// Decode one capture record
    ///
    /// Returns `None` for non-IPv4 frames, truncated headers and packets the
    /// filter rejects.
    pub fn decode(packet: &RawPacket, filter: &CaptureFilter) -> Option<ProtocolEvent> {
        let datagram = packet.ipv4_payload()?;
        let (ip, payload) = Ipv4Header::parse(datagram)?;

        let first_piece = ip.fragment_offset == 0;
        let ports = match ip.protocol {
            PROTO_TCP if first_piece => TcpHeader::parse(payload).map(|t| (t.src_port, t.dst_port)),
            PROTO_UDP if first_piece => udp_ports(payload),
            _ => None,
        };
        if !filter.matches(&ip, ports) {
            return None;
        }

        let kind = if ip.is_fragment() || ip.protocol != PROTO_TCP {
            match ip.protocol {
                PROTO_TCP | PROTO_UDP => EventKind::FragmentObserved {
                    id: ip.id,
                    protocol: ip.protocol,
                    offset: ip.fragment_offset,
                    more_fragments: ip.more_fragments,
                    payload_len: ip.payload_len(),
                },
                other => EventKind::Other { protocol: other },
            }
        } else {
            let tcp = TcpHeader::parse(payload)?;
            classify_tcp(&tcp)
        };

        Some(ProtocolEvent {
            at: packet.timestamp,
            src: ip.src,
            dst: ip.dst,
            kind,
        })
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::SynSent { .. } => "SynSent",
            EventKind::SynAckReceived { .. } => "SynAckReceived",
            EventKind::AckSent { .. } => "AckSent",
            EventKind::FragmentObserved { .. } => "FragmentObserved",
            EventKind::Other { .. } => "Other",
        }
    }
}

fn classify_tcp(tcp: &TcpHeader) -> EventKind {
    let syn = tcp.flags.contains(TcpFlags::SYN);
    let ack = tcp.flags.contains(TcpFlags::ACK);
    let rst = tcp.flags.contains(TcpFlags::RST);
    let fin = tcp.flags.contains(TcpFlags::FIN);

    match (syn, ack) {
        _ if rst => EventKind::Other { protocol: PROTO_TCP },
        (true, false) => EventKind::SynSent {
            src_port: tcp.src_port,
            dst_port: tcp.dst_port,
            seq: tcp.seq,
        },
        (true, true) => EventKind::SynAckReceived {
            src_port: tcp.src_port,
            dst_port: tcp.dst_port,
            seq: tcp.seq,
            ack: tcp.ack,
        },
        (false, true) if !fin => EventKind::AckSent {
            src_port: tcp.src_port,
            dst_port: tcp.dst_port,
            seq: tcp.seq,
            ack: tcp.ack,
        },
        _ => EventKind::Other { protocol: PROTO_TCP },
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.at.as_secs_f64();
        match self.kind {
            EventKind::SynSent { seq, .. } => {
                write!(f, "{:.6} {} -> {} SynSent(seq={})", at, self.src, self.dst, seq)
            }
            EventKind::SynAckReceived { seq, ack, .. } => write!(
                f,
                "{:.6} {} -> {} SynAckReceived(seq={}, ack={})",
                at, self.src, self.dst, seq, ack
            ),
            EventKind::AckSent { seq, ack, .. } => write!(
                f,
                "{:.6} {} -> {} AckSent(seq={}, ack={})",
                at, self.src, self.dst, seq, ack
            ),
            EventKind::FragmentObserved {
                id,
                offset,
                more_fragments,
                payload_len,
                ..
            } => write!(
                f,
                "{:.6} {} -> {} FragmentObserved(id={}, offset={}, len={}, mf={})",
                at, self.src, self.dst, id, offset, payload_len, more_fragments
            ),
            EventKind::Other { protocol } => {
                write!(f, "{:.6} {} -> {} Other(proto={})", at, self.src, self.dst, protocol)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::packet::{
        build_fragments, build_tcp_segment, build_udp_payload, SegmentSpec,
    };
    use std::net::IpAddr;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn segment(src: Ipv4Addr, dst: Ipv4Addr, ports: (u16, u16), flags: TcpFlags) -> RawPacket {
        let data = build_tcp_segment(&SegmentSpec {
            src,
            dst,
            src_port: ports.0,
            dst_port: ports.1,
            seq: 100,
            ack: 0,
            flags,
            id: 1,
        });
        RawPacket::ipv4(Duration::from_millis(5), data)
    }

    #[test]
    fn test_classifies_handshake_segments() {
        let filter = CaptureFilter::any();
        let syn = segment(CLIENT, SERVER, (40000, 80), TcpFlags::SYN);
        let syn_ack = segment(SERVER, CLIENT, (80, 40000), TcpFlags::SYN | TcpFlags::ACK);
        let ack = segment(CLIENT, SERVER, (40000, 80), TcpFlags::ACK);
        let rst = segment(SERVER, CLIENT, (80, 40000), TcpFlags::RST | TcpFlags::ACK);

        assert_eq!(ProtocolEvent::decode(&syn, &filter).unwrap().name(), "SynSent");
        assert_eq!(
            ProtocolEvent::decode(&syn_ack, &filter).unwrap().name(),
            "SynAckReceived"
        );
        assert_eq!(ProtocolEvent::decode(&ack, &filter).unwrap().name(), "AckSent");
        assert_eq!(ProtocolEvent::decode(&rst, &filter).unwrap().name(), "Other");

        let event = ProtocolEvent::decode(&syn, &filter).unwrap();
        assert_eq!(event.at, Duration::from_millis(5));
        assert_eq!(event.src, CLIENT);
    }

    #[test]
    fn test_filter_drops_other_ports() {
        let filter = CaptureFilter::between(IpAddr::V4(CLIENT), IpAddr::V4(SERVER))
            .protocol(PROTO_TCP)
            .port(443);
        let syn = segment(CLIENT, SERVER, (40000, 80), TcpFlags::SYN);
        assert!(ProtocolEvent::decode(&syn, &filter).is_none());
    }

    #[test]
    fn test_fragments_decode_with_offsets() {
        let payload = build_udp_payload(CLIENT, SERVER, 5000, 5001, 3000);
        let fragments = build_fragments(CLIENT, SERVER, PROTO_UDP, 9, &payload, 1500);
        let filter = CaptureFilter::between(IpAddr::V4(CLIENT), IpAddr::V4(SERVER))
            .protocol(PROTO_UDP);

        let kinds: Vec<EventKind> = fragments
            .into_iter()
            .map(|f| ProtocolEvent::decode(&RawPacket::ipv4(Duration::ZERO, f), &filter))
            .map(|e| e.unwrap().kind)
            .collect();

        assert_eq!(
            kinds[1],
            EventKind::FragmentObserved {
                id: 9,
                protocol: PROTO_UDP,
                offset: 1480,
                more_fragments: true,
                payload_len: 1480,
            }
        );
        assert!(matches!(
            kinds[2],
            EventKind::FragmentObserved {
                more_fragments: false,
                payload_len: 40,
                ..
            }
        ));
    }
}
