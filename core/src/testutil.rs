//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::nodes::NodeContext;
use crate::types::{NodeInfo, Protocol, Registration};

pub(crate) const TEST_CONFIG_TOML: &str = r#"
    [node]
    id = "local-node"
    listen_url = "http://127.0.0.1:4800"

    [node.networks.ipv4]
    address = "10.99.1.10"
    subnet = "10.99.1.0/24"
    network = "10.99.0.0/16"

    [auth]
    cluster_secret = "s3cret"
    rsa_key_bits = 1024

    [transport]
    queue_depth = 8
    max_batch = 4
"#;

pub(crate) fn test_config() -> Config {
    Config::from_toml(TEST_CONFIG_TOML).unwrap()
}

pub(crate) fn context_for(config: Config) -> Arc<NodeContext> {
    let config = Arc::new(config);
    let local = local_node_info(&config);
    let metrics = Arc::new(Metrics::new());
    Arc::new(NodeContext::new(config, local, metrics).unwrap())
}

pub(crate) fn local_node_info(config: &Config) -> NodeInfo {
    let mut node_addresses = HashMap::new();
    let mut network_addresses = HashMap::new();
    for (protocol, net) in &config.node.networks {
        node_addresses.insert(*protocol, net.address);
        network_addresses.insert(*protocol, net.network);
    }
    NodeInfo {
        id: config.node.id.clone().unwrap(),
        listen_url: config.node.listen_url.clone(),
        node_addresses,
        network_addresses,
    }
}

pub(crate) fn test_context() -> Arc<NodeContext> {
    context_for(test_config())
}

/// A first registration from a peer at 10.99.1.x, carrying no transitive
/// peers of its own.
pub(crate) fn peer_registration(id: &str, addr: [u8; 4]) -> Registration {
    let mut node_addresses = HashMap::new();
    node_addresses.insert(Protocol::Ipv4, std::net::IpAddr::from(addr));
    let mut network_addresses = HashMap::new();
    network_addresses.insert(Protocol::Ipv4, "10.99.0.0/16".parse().unwrap());
    Registration::new(
        NodeInfo {
            id: id.to_string(),
            listen_url: format!("http://{}.{}.{}.{}:4800", addr[0], addr[1], addr[2], addr[3]),
            node_addresses,
            network_addresses,
        },
        Vec::new(),
    )
}
