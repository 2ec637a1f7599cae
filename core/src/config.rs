use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::ParseError;
use crate::types::Protocol;

/// Resolved daemon configuration. Built once at startup from a TOML file and
/// validated before anything else runs; never mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub registrations: RegistrationsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Stable node id. Generated at startup when absent, which means the node
    /// re-joins the mesh as a new member after every restart.
    pub id: Option<String>,
    /// URL other nodes use to reach this node's control API.
    pub listen_url: String,
    /// Per-protocol tunnel addressing.
    pub networks: HashMap<Protocol, NetworkConfig>,
    /// Whether subnet/network broadcast packets fan out to peers.
    #[serde(default = "default_true")]
    pub broadcast_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// This node's tunnel address.
    pub address: IpAddr,
    /// The local subnet this node serves. Peers inside it get the short
    /// re-registration interval.
    pub subnet: IpNet,
    /// The overall mesh network range. Destinations outside it are dropped.
    pub network: IpNet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Shared secret used only for bootstrap, before a session exists.
    pub cluster_secret: String,
    #[serde(default = "default_validity_window")]
    pub validity_window_secs: u64,
    #[serde(default = "default_early_validity")]
    pub early_validity_secs: u64,
    #[serde(default = "default_session_max_age")]
    pub session_max_age_secs: u64,
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
}

impl AuthConfig {
    pub fn validity_window(&self) -> Duration {
        Duration::from_secs(self.validity_window_secs)
    }

    pub fn early_validity(&self) -> Duration {
        Duration::from_secs(self.early_validity_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationsConfig {
    /// Fixed interval between groom cycles.
    pub groom_interval_secs: f64,
    /// Re-registration interval for peers inside our local subnet.
    pub local_reregister_secs: f64,
    /// Staleness threshold for peers inside our local subnet.
    pub local_stale_secs: f64,
    /// Re-registration interval for peers outside our local subnet.
    pub remote_reregister_secs: f64,
    /// Staleness threshold for peers outside our local subnet.
    pub remote_stale_secs: f64,
    /// Minimum interval between bootstrap passes.
    pub bootstrap_retry_secs: f64,
    /// Window after startup during which an empty pool still reports healthy,
    /// so single-node clusters pass health checks before any peer exists.
    pub startup_grace_secs: f64,
    pub bootstrap: Vec<BootstrapGroup>,
}

impl Default for RegistrationsConfig {
    fn default() -> Self {
        Self {
            groom_interval_secs: 10.0,
            local_reregister_secs: 30.0,
            local_stale_secs: 90.0,
            remote_reregister_secs: 60.0,
            remote_stale_secs: 180.0,
            bootstrap_retry_secs: 30.0,
            startup_grace_secs: 120.0,
            bootstrap: Vec::new(),
        }
    }
}

impl RegistrationsConfig {
    pub fn groom_interval(&self) -> Duration {
        Duration::from_secs_f64(self.groom_interval_secs)
    }

    pub fn reregister_interval(&self, local_subnet: bool) -> Duration {
        Duration::from_secs_f64(if local_subnet {
            self.local_reregister_secs
        } else {
            self.remote_reregister_secs
        })
    }

    pub fn stale_threshold(&self, local_subnet: bool) -> Duration {
        Duration::from_secs_f64(if local_subnet {
            self.local_stale_secs
        } else {
            self.remote_stale_secs
        })
    }
}

/// A named set of seed URLs used only to join the mesh initially.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapGroup {
    pub name: String,
    pub urls: Vec<String>,
    /// Retry budget: -1 retries forever, 0 means a single attempt, n means
    /// n retries after the first attempt.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub request_timeout_secs: u64,
    /// Depth of each peer's bounded transmit queue.
    pub queue_depth: usize,
    /// Maximum packets per outbound transmit call.
    pub max_batch: usize,
    /// Per-protocol packet expiry before outbound handoff. Protects against
    /// TCP-retry-scale queuing delay turning into stale deliveries.
    pub expiry_secs: HashMap<Protocol, f64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let mut expiry_secs = HashMap::new();
        expiry_secs.insert(Protocol::Ipv4, 3.0);
        expiry_secs.insert(Protocol::Ipv6, 3.0);
        Self {
            request_timeout_secs: 10,
            queue_depth: 512,
            max_batch: 32,
            expiry_secs,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn expiry(&self, protocol: Protocol) -> f64 {
        self.expiry_secs.get(&protocol).copied().unwrap_or(3.0)
    }
}

fn default_true() -> bool {
    true
}

fn default_validity_window() -> u64 {
    300
}

fn default_early_validity() -> u64 {
    30
}

fn default_session_max_age() -> u64 {
    600
}

fn default_rsa_key_bits() -> usize {
    2048
}

fn default_retry_budget() -> i64 {
    -1
}

impl Config {
    /// Load and validate a configuration file. Any failure here is fatal;
    /// there is no partial-start mode.
    pub fn load(path: &Path) -> Result<Config, ParseError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ParseError::invalid("config", format!("{}: {}", path.display(), e)))?;
        Config::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Config, ParseError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ParseError::invalid("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.node.listen_url.is_empty() {
            return Err(ParseError::MissingField("node.listen_url"));
        }
        if !self.node.listen_url.starts_with("http://")
            && !self.node.listen_url.starts_with("https://")
        {
            return Err(ParseError::invalid(
                "node.listen_url",
                "must be an http:// or https:// URL",
            ));
        }
        if self.node.networks.is_empty() {
            return Err(ParseError::MissingField("node.networks"));
        }
        for (protocol, net) in &self.node.networks {
            if Protocol::of(&net.address) != *protocol {
                return Err(ParseError::invalid(
                    "node.networks.address",
                    format!("{} is not an {} address", net.address, protocol),
                ));
            }
            if !net.subnet.contains(&net.address) {
                return Err(ParseError::invalid(
                    "node.networks.address",
                    format!("{} is outside subnet {}", net.address, net.subnet),
                ));
            }
            if !net.network.contains(&net.subnet.network()) {
                return Err(ParseError::invalid(
                    "node.networks.subnet",
                    format!("{} is outside network {}", net.subnet, net.network),
                ));
            }
        }
        if self.auth.cluster_secret.is_empty() {
            return Err(ParseError::MissingField("auth.cluster_secret"));
        }
        if self.auth.early_validity_secs >= self.auth.validity_window_secs {
            return Err(ParseError::invalid(
                "auth.early_validity_secs",
                "must be smaller than validity_window_secs",
            ));
        }
        if self.auth.session_max_age_secs <= self.auth.validity_window_secs {
            return Err(ParseError::invalid(
                "auth.session_max_age_secs",
                "must be larger than validity_window_secs",
            ));
        }
        // The response-path signing shortcut hands out a possibly
        // soon-to-expire token, which is only safe when tokens outlive several
        // re-registration rounds.
        let max_reregister = self
            .registrations
            .local_reregister_secs
            .max(self.registrations.remote_reregister_secs);
        if (self.auth.validity_window_secs as f64) < 3.0 * max_reregister {
            return Err(ParseError::invalid(
                "auth.validity_window_secs",
                format!(
                    "must be at least 3x the largest re-registration interval ({}s)",
                    max_reregister
                ),
            ));
        }
        if self.transport.queue_depth == 0 {
            return Err(ParseError::invalid("transport.queue_depth", "must be > 0"));
        }
        if self.transport.max_batch == 0 {
            return Err(ParseError::invalid("transport.max_batch", "must be > 0"));
        }
        for group in &self.registrations.bootstrap {
            if group.retry_budget < -1 {
                return Err(ParseError::invalid(
                    "registrations.bootstrap.retry_budget",
                    "must be -1 (unlimited) or >= 0",
                ));
            }
            if group.urls.is_empty() {
                return Err(ParseError::invalid(
                    "registrations.bootstrap.urls",
                    format!("group {} has no seed URLs", group.name),
                ));
            }
        }
        Ok(())
    }

    /// Annotated example configuration, for operator docs and `weftd
    /// --example-config`.
    pub fn example_toml() -> &'static str {
        EXAMPLE_CONFIG
    }
}

const EXAMPLE_CONFIG: &str = r#"# weftd configuration

[node]
# Stable node identity. Omit to generate a fresh id on every start.
id = "2f9a3a86-9a6f-4a44-9f2c-7a1c1f6b2d10"
# URL other mesh nodes use to reach this node's control API.
listen_url = "https://10.0.0.10:4800"
# Fan out subnet/network broadcast packets to peers.
broadcast_enabled = true

[node.networks.ipv4]
# This node's tunnel address.
address = "10.99.1.10"
# Local subnet served by this node; in-subnet peers re-register often.
subnet = "10.99.1.0/24"
# Overall mesh range; destinations outside it are dropped.
network = "10.99.0.0/16"

[auth]
# Shared secret used only while bootstrapping, before sessions exist.
cluster_secret = "change-me"
validity_window_secs = 300
early_validity_secs = 30
session_max_age_secs = 600
rsa_key_bits = 2048

[registrations]
groom_interval_secs = 10.0
local_reregister_secs = 30.0
local_stale_secs = 90.0
remote_reregister_secs = 60.0
remote_stale_secs = 180.0
bootstrap_retry_secs = 30.0
startup_grace_secs = 120.0

[[registrations.bootstrap]]
name = "seed"
urls = ["https://10.0.0.1:4800", "https://10.0.0.2:4800"]
# -1 retries forever, 0 means a single attempt.
retry_budget = -1

[transport]
request_timeout_secs = 10
queue_depth = 512
max_batch = 32

[transport.expiry_secs]
ipv4 = 3.0
ipv6 = 3.0
"#;
