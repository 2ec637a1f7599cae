//! Binary framing for tunnel payloads.
//!
//! Wire layout, big-endian:
//!
//! ```text
//! version(1) | ethertype(2) | data_length(2) | data(data_length) |
//! digest(16) | internal_stamp(8) | source_node_id_length(1) | source_node_id
//! ```
//!
//! `data_length` and `digest` are derived from the other fields and are
//! re-verified on every decode, so a corrupted packet is caught regardless of
//! which field was hit. `internal_stamp` is fixed-point seconds, scaled by
//! 2^30.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

pub const PACKET_VERSION: u8 = 1;

/// Fixed-point scale for packet stamps: seconds * 2^30.
const STAMP_SCALE: f64 = (1u64 << 30) as f64;

/// Fixed header bytes: version + ethertype + data_length.
const HEADER_LEN: usize = 5;
/// Trailer bytes before the source id: digest + stamp + id length.
const TRAILER_LEN: usize = 16 + 8 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    version: u8,
    ethertype: u16,
    data: Vec<u8>,
    digest: [u8; 16],
    internal_stamp: u64,
    source_node_id: String,
}

impl Packet {
    pub fn new(
        ethertype: u16,
        data: Vec<u8>,
        source_node_id: &str,
        stamp: f64,
    ) -> Result<Packet, PayloadError> {
        if data.len() > u16::MAX as usize {
            return Err(PayloadError::Malformed("data"));
        }
        if source_node_id.len() > u8::MAX as usize || source_node_id.is_empty() {
            return Err(PayloadError::Malformed("source_node_id"));
        }
        let internal_stamp = (stamp * STAMP_SCALE) as u64;
        let digest = compute_digest(ethertype, internal_stamp, &data, source_node_id);
        Ok(Packet {
            version: PACKET_VERSION,
            ethertype,
            data,
            digest,
            internal_stamp,
            source_node_id: source_node_id.to_string(),
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn ethertype(&self) -> u16 {
        self.ethertype
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn digest(&self) -> &[u8; 16] {
        &self.digest
    }

    pub fn source_node_id(&self) -> &str {
        &self.source_node_id
    }

    /// Stamp as floating seconds.
    pub fn stamp(&self) -> f64 {
        self.internal_stamp as f64 / STAMP_SCALE
    }

    /// Replace the stamp. The digest covers the stamp, so it is re-derived.
    pub fn set_stamp(&mut self, stamp: f64) {
        self.internal_stamp = (stamp * STAMP_SCALE) as u64;
        self.digest = compute_digest(
            self.ethertype,
            self.internal_stamp,
            &self.data,
            &self.source_node_id,
        );
    }

    /// Seconds elapsed between the packet's stamp and `now`.
    pub fn age(&self, now: f64) -> f64 {
        now - self.stamp()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + self.data.len() + TRAILER_LEN + self.source_node_id.len(),
        );
        out.push(self.version);
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&self.internal_stamp.to_be_bytes());
        out.push(self.source_node_id.len() as u8);
        out.extend_from_slice(self.source_node_id.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Packet, PayloadError> {
        if buf.len() < HEADER_LEN {
            return Err(PayloadError::Truncated);
        }
        let version = buf[0];
        if version != PACKET_VERSION {
            return Err(PayloadError::Version(version));
        }
        let ethertype = u16::from_be_bytes([buf[1], buf[2]]);
        let data_length = u16::from_be_bytes([buf[3], buf[4]]) as usize;

        let rest = &buf[HEADER_LEN..];
        if rest.len() < data_length + TRAILER_LEN {
            return Err(PayloadError::Truncated);
        }
        let data = rest[..data_length].to_vec();
        let rest = &rest[data_length..];

        let mut digest = [0u8; 16];
        digest.copy_from_slice(&rest[..16]);
        let internal_stamp = u64::from_be_bytes(
            rest[16..24].try_into().map_err(|_| PayloadError::Truncated)?,
        );
        let id_len = rest[24] as usize;
        let rest = &rest[25..];
        if rest.len() != id_len {
            // Short or trailing bytes both mean the declared lengths do not
            // describe this buffer.
            return Err(PayloadError::Length);
        }
        let source_node_id = std::str::from_utf8(rest)
            .map_err(|_| PayloadError::Malformed("source_node_id"))?
            .to_string();

        let expected = compute_digest(ethertype, internal_stamp, &data, &source_node_id);
        if expected != digest {
            return Err(PayloadError::Integrity);
        }

        Ok(Packet {
            version,
            ethertype,
            data,
            digest,
            internal_stamp,
            source_node_id,
        })
    }

    /// JSON sibling representation for HTTP transport.
    pub fn to_json(&self) -> PacketJson {
        PacketJson {
            version: self.version,
            ethertype: self.ethertype,
            data: BASE64.encode(&self.data),
            data_length: self.data.len() as u16,
            digest: hex::encode(self.digest),
            stamp: self.internal_stamp,
            source_node_id: self.source_node_id.clone(),
        }
    }

    /// Decode the JSON form, re-verifying the digest the same way as the
    /// binary decoder so a corrupted field is caught on either path.
    pub fn from_json(json: &PacketJson) -> Result<Packet, PayloadError> {
        if json.version != PACKET_VERSION {
            return Err(PayloadError::Version(json.version));
        }
        let data = BASE64
            .decode(&json.data)
            .map_err(|_| PayloadError::Malformed("data"))?;
        if data.len() != json.data_length as usize {
            return Err(PayloadError::Length);
        }
        let digest_bytes = hex::decode(&json.digest).map_err(|_| PayloadError::Malformed("digest"))?;
        let digest: [u8; 16] = digest_bytes
            .try_into()
            .map_err(|_| PayloadError::Malformed("digest"))?;
        if json.source_node_id.is_empty() || json.source_node_id.len() > u8::MAX as usize {
            return Err(PayloadError::Malformed("source_node_id"));
        }
        let expected = compute_digest(json.ethertype, json.stamp, &data, &json.source_node_id);
        if expected != digest {
            return Err(PayloadError::Integrity);
        }
        Ok(Packet {
            version: json.version,
            ethertype: json.ethertype,
            data,
            digest,
            internal_stamp: json.stamp,
            source_node_id: json.source_node_id.clone(),
        })
    }
}

/// JSON wire form: `data` is base64, `digest` hex, `stamp` the raw
/// fixed-point integer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketJson {
    pub version: u8,
    pub ethertype: u16,
    pub data: String,
    pub data_length: u16,
    pub digest: String,
    pub stamp: u64,
    pub source_node_id: String,
}

fn compute_digest(ethertype: u16, internal_stamp: u64, data: &[u8], source_node_id: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(ethertype.to_be_bytes());
    hasher.update(internal_stamp.to_be_bytes());
    hasher.update(data);
    hasher.update(source_node_id.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet::new(0x0800, vec![1, 2, 3, 4, 5], "node-a", 1_700_000_000.5).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let packet = sample_packet();
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_round_trip_empty_data() {
        let packet = Packet::new(0x86DD, vec![], "n", 0.0).unwrap();
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_stamp_fixed_point_conversion() {
        let mut packet = sample_packet();
        packet.set_stamp(12.25);
        // 12.25 is exactly representable at 2^-30 resolution.
        assert_eq!(packet.stamp(), 12.25);
    }

    #[test]
    fn test_tampering_any_byte_fails() {
        let packet = sample_packet();
        let encoded = packet.encode();
        for i in 0..encoded.len() {
            let mut corrupted = encoded.clone();
            corrupted[i] ^= 0x01;
            assert!(
                Packet::decode(&corrupted).is_err(),
                "flipping byte {} was not detected",
                i
            );
        }
    }

    #[test]
    fn test_unsupported_version() {
        let mut encoded = sample_packet().encode();
        encoded[0] = 7;
        assert!(matches!(
            Packet::decode(&encoded),
            Err(PayloadError::Version(7))
        ));
    }

    #[test]
    fn test_truncated_buffer() {
        let encoded = sample_packet().encode();
        assert!(matches!(
            Packet::decode(&encoded[..3]),
            Err(PayloadError::Truncated)
        ));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut encoded = sample_packet().encode();
        encoded.push(0);
        assert!(matches!(
            Packet::decode(&encoded),
            Err(PayloadError::Length)
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let packet = sample_packet();
        let json = packet.to_json();
        let decoded = Packet::from_json(&json).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_json_tampered_data_rejected() {
        let packet = sample_packet();
        let mut json = packet.to_json();
        json.data = BASE64.encode([9, 9, 9, 9, 9]);
        assert!(matches!(
            Packet::from_json(&json),
            Err(PayloadError::Integrity)
        ));
    }

    #[test]
    fn test_json_tampered_stamp_rejected() {
        let packet = sample_packet();
        let mut json = packet.to_json();
        json.stamp += 1;
        assert!(matches!(
            Packet::from_json(&json),
            Err(PayloadError::Integrity)
        ));
    }

    #[test]
    fn test_oversized_data_rejected() {
        let data = vec![0u8; u16::MAX as usize + 1];
        assert!(Packet::new(0x0800, data, "n", 0.0).is_err());
    }
}
