//! Streaming pcap reader
//!
//! Reads the classic libpcap file format from any async byte stream, as
//! written by `tcpdump -w -`. Both byte orders and both timestamp
//! resolutions are accepted.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

/// Upper bound on a single record; anything larger means a corrupt stream
const MAX_RECORD_LEN: u32 = 256 * 1024;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;

#[derive(Error, Debug)]
pub enum PcapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a pcap stream (magic {0:#010x})")]
    BadMagic(u32),

    #[error("Unsupported link type {0}")]
    UnsupportedLinkType(u32),

    #[error("Record of {0} bytes exceeds the sanity limit")]
    OversizedRecord(u32),
}

/// Link-layer framing of captured records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4/IPv6 datagrams
    Raw,
    /// Linux cooked capture v1
    LinuxSll,
    /// Linux cooked capture v2
    LinuxSll2,
}

impl LinkType {
    pub fn from_pcap(value: u32) -> Result<Self, PcapError> {
        match value {
            1 => Ok(LinkType::Ethernet),
            12 | 14 | 101 => Ok(LinkType::Raw),
            113 => Ok(LinkType::LinuxSll),
            276 => Ok(LinkType::LinuxSll2),
            other => Err(PcapError::UnsupportedLinkType(other)),
        }
    }

    /// Strip the link header, returning the IPv4 datagram if there is one
    pub fn ipv4_payload<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        let (ethertype, offset) = match self {
            LinkType::Raw => {
                return frame.first().filter(|b| **b >> 4 == 4).map(|_| frame);
            }
            LinkType::Ethernet => {
                let mut ethertype = read_u16_be(frame, 12)?;
                let mut offset = 14;
                while ethertype == ETHERTYPE_VLAN {
                    ethertype = read_u16_be(frame, offset + 2)?;
                    offset += 4;
                }
                (ethertype, offset)
            }
            LinkType::LinuxSll => (read_u16_be(frame, 14)?, 16),
            LinkType::LinuxSll2 => (read_u16_be(frame, 0)?, 20),
        };

        if ethertype != ETHERTYPE_IPV4 {
            return None;
        }
        frame.get(offset..)
    }
}

fn read_u16_be(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// One captured frame
#[derive(Clone, Debug, PartialEq)]
pub struct RawPacket {
    /// Capture timestamp (since the epoch for live captures)
    pub timestamp: Duration,
    pub link_type: LinkType,
    pub data: Vec<u8>,
}

impl RawPacket {
    /// Wrap a bare IPv4 datagram
    pub fn ipv4(timestamp: Duration, data: Vec<u8>) -> Self {
        Self {
            timestamp,
            link_type: LinkType::Raw,
            data,
        }
    }

    pub fn ipv4_payload(&self) -> Option<&[u8]> {
        self.link_type.ipv4_payload(&self.data)
    }
}

/// Parsed pcap global header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcapHeader {
    pub big_endian: bool,
    pub nanosecond: bool,
    pub snaplen: u32,
    pub link_type: LinkType,
}

impl PcapHeader {
    pub fn parse(bytes: &[u8; 24]) -> Result<Self, PcapError> {
        let le = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let (big_endian, nanosecond) = match le {
            MAGIC_MICROS => (false, false),
            MAGIC_NANOS => (false, true),
            m if m.swap_bytes() == MAGIC_MICROS => (true, false),
            m if m.swap_bytes() == MAGIC_NANOS => (true, true),
            other => return Err(PcapError::BadMagic(other)),
        };

        let header = PcapHeader {
            big_endian,
            nanosecond,
            snaplen: 0,
            link_type: LinkType::Ethernet,
        };
        let snaplen = header.read_u32(&bytes[16..20]);
        // The upper bits of the link type field carry FCS information
        let link_type = LinkType::from_pcap(header.read_u32(&bytes[20..24]) & 0x0fff_ffff)?;

        Ok(PcapHeader {
            snaplen,
            link_type,
            ..header
        })
    }

    fn read_u32(&self, b: &[u8]) -> u32 {
        let arr = [b[0], b[1], b[2], b[3]];
        if self.big_endian {
            u32::from_be_bytes(arr)
        } else {
            u32::from_le_bytes(arr)
        }
    }
}

/// Incremental reader over a pcap byte stream
pub struct PcapStream<R> {
    reader: R,
    header: PcapHeader,
}

impl<R: AsyncRead + Unpin> PcapStream<R> {
    /// Read the global header; returns once the stream is known to be pcap
    pub async fn open(mut reader: R) -> Result<Self, PcapError> {
        let mut bytes = [0u8; 24];
        reader.read_exact(&mut bytes).await?;
        let header = PcapHeader::parse(&bytes)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &PcapHeader {
        &self.header
    }

    /// Next record, or `None` at a clean end of stream
    pub async fn next_record(&mut self) -> Result<Option<RawPacket>, PcapError> {
        let mut rec = [0u8; 16];
        match self.reader.read_exact(&mut rec).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let secs = self.header.read_u32(&rec[0..4]);
        let frac = self.header.read_u32(&rec[4..8]);
        let incl_len = self.header.read_u32(&rec[8..12]);
        if incl_len > MAX_RECORD_LEN {
            return Err(PcapError::OversizedRecord(incl_len));
        }

        let mut data = vec![0u8; incl_len as usize];
        self.reader.read_exact(&mut data).await?;

        let nanos = if self.header.nanosecond {
            frac.min(999_999_999)
        } else {
            frac.min(999_999).saturating_mul(1000)
        };

        Ok(Some(RawPacket {
            timestamp: Duration::new(u64::from(secs), nanos),
            link_type: self.header.link_type,
            data,
        }))
    }
}
