//! Application-level parsing of tunneled L3 frames.
//!
//! Routing only needs addresses, protocol numbers, and (for IPv4) the header
//! checksum. IPv6 is parse-only. IPv4 checksum verification is advisory: the
//! recomputed value is exposed, but a mismatch does not reject the frame.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::PayloadError;
use crate::types::Protocol;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

#[derive(Debug, Clone)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub dscp_ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Raw header bytes (ihl * 4), kept for checksum computation.
    header: Vec<u8>,
}

impl Ipv4Header {
    pub fn parse(buf: &[u8]) -> Result<Ipv4Header, PayloadError> {
        if buf.len() < 20 {
            return Err(PayloadError::Truncated);
        }
        if buf[0] >> 4 != 4 {
            return Err(PayloadError::Malformed("ip version"));
        }
        let ihl = buf[0] & 0x0f;
        let header_len = ihl as usize * 4;
        if ihl < 5 || buf.len() < header_len {
            return Err(PayloadError::Malformed("ihl"));
        }
        Ok(Ipv4Header {
            ihl,
            dscp_ecn: buf[1],
            total_length: u16::from_be_bytes([buf[2], buf[3]]),
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            flags: buf[6] >> 5,
            fragment_offset: u16::from_be_bytes([buf[6] & 0x1f, buf[7]]),
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            source: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            destination: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            header: buf[..header_len].to_vec(),
        })
    }

    /// Ones'-complement checksum over the serialized header with the checksum
    /// field masked to zero.
    pub fn compute_checksum(&self) -> u16 {
        let mut sum: u32 = 0;
        for (i, chunk) in self.header.chunks(2).enumerate() {
            // Bytes 10-11 are the checksum field itself.
            let word = if i == 5 {
                0
            } else if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]]) as u32
            } else {
                (chunk[0] as u32) << 8
            };
            sum += word;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    pub fn checksum_valid(&self) -> bool {
        self.compute_checksum() == self.checksum
    }
}

#[derive(Debug, Clone)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
}

impl Ipv6Header {
    pub fn parse(buf: &[u8]) -> Result<Ipv6Header, PayloadError> {
        if buf.len() < 40 {
            return Err(PayloadError::Truncated);
        }
        if buf[0] >> 4 != 6 {
            return Err(PayloadError::Malformed("ip version"));
        }
        let mut source = [0u8; 16];
        source.copy_from_slice(&buf[8..24]);
        let mut destination = [0u8; 16];
        destination.copy_from_slice(&buf[24..40]);
        Ok(Ipv6Header {
            traffic_class: (buf[0] << 4) | (buf[1] >> 4),
            flow_label: u32::from_be_bytes([buf[1] & 0x0f, buf[2], buf[3], 0]) >> 8,
            payload_length: u16::from_be_bytes([buf[4], buf[5]]),
            next_header: buf[6],
            hop_limit: buf[7],
            source: Ipv6Addr::from(source),
            destination: Ipv6Addr::from(destination),
        })
    }
}

/// A parsed L3 frame, dispatched on the IP version nibble.
#[derive(Debug, Clone)]
pub enum IpFrame {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpFrame {
    pub fn parse(buf: &[u8]) -> Result<IpFrame, PayloadError> {
        match buf.first().map(|b| b >> 4) {
            Some(4) => Ok(IpFrame::V4(Ipv4Header::parse(buf)?)),
            Some(6) => Ok(IpFrame::V6(Ipv6Header::parse(buf)?)),
            Some(_) => Err(PayloadError::Malformed("ip version")),
            None => Err(PayloadError::Truncated),
        }
    }

    pub fn ethertype(&self) -> u16 {
        match self {
            IpFrame::V4(_) => ETHERTYPE_IPV4,
            IpFrame::V6(_) => ETHERTYPE_IPV6,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            IpFrame::V4(_) => Protocol::Ipv4,
            IpFrame::V6(_) => Protocol::Ipv6,
        }
    }

    pub fn source(&self) -> IpAddr {
        match self {
            IpFrame::V4(h) => IpAddr::V4(h.source),
            IpFrame::V6(h) => IpAddr::V6(h.source),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self {
            IpFrame::V4(h) => IpAddr::V4(h.destination),
            IpFrame::V6(h) => IpAddr::V6(h.destination),
        }
    }
}

/// Minimal IPv4 header with a correct checksum, used as a test fixture.
#[cfg(test)]
pub(crate) fn ipv4_frame(source: [u8; 4], destination: [u8; 4]) -> Vec<u8> {
    let mut buf = vec![
        0x45, 0x00, 0x00, 0x14, // version/ihl, dscp, total length 20
        0xab, 0xcd, 0x00, 0x00, // identification, flags/fragment
        0x40, 0x11, 0x00, 0x00, // ttl 64, udp, checksum placeholder
        0, 0, 0, 0, 0, 0, 0, 0,
    ];
    buf[12..16].copy_from_slice(&source);
    buf[16..20].copy_from_slice(&destination);
    let header = Ipv4Header::parse(&buf).unwrap();
    let checksum = header.compute_checksum();
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());
    buf
}
