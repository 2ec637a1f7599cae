use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

// ============================================================================
// Address Protocol
// ============================================================================

/// L3 protocol class a tunnel address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ipv4,
    Ipv6,
}

impl Protocol {
    pub fn of(addr: &IpAddr) -> Protocol {
        match addr {
            IpAddr::V4(_) => Protocol::Ipv4,
            IpAddr::V6(_) => Protocol::Ipv6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ipv4 => "ipv4",
            Protocol::Ipv6 => "ipv6",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Mesh Membership Documents
// ============================================================================

/// Identity and addressing of one mesh participant. Immutable for the node's
/// lifetime once advertised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub listen_url: String,
    pub node_addresses: HashMap<Protocol, IpAddr>,
    pub network_addresses: HashMap<Protocol, IpNet>,
}

impl NodeInfo {
    pub fn address(&self, protocol: Protocol) -> Option<IpAddr> {
        self.node_addresses.get(&protocol).copied()
    }
}

/// Snapshot one node sends another: "here is who I am, and here is who I know
/// about". `remote` never contains `local`'s own entry. Built fresh for every
/// registration attempt and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub local: NodeInfo,
    pub remote: Vec<NodeInfo>,
    pub stamp: u64,
}

impl Registration {
    pub fn new(local: NodeInfo, remote: Vec<NodeInfo>) -> Self {
        Self {
            local,
            remote,
            stamp: unix_seconds(),
        }
    }
}

// ============================================================================
// Control API Payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoSummary {
    pub id: String,
    pub listen_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSessionRequest {
    pub node_id: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSessionResponse {
    pub id: String,
    /// New session secret, RSA-OAEP encrypted to the caller's public key,
    /// base64 encoded.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub registrations: bool,
    pub tunnel: bool,
}

/// Current wall-clock time as whole unix seconds.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current wall-clock time as fractional unix seconds, for packet stamps.
pub fn unix_seconds_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
