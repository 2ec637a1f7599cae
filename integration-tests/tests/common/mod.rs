//! In-process mesh harness: each test node is a full daemon — manager,
//! background loops, and the axum control API — served on an ephemeral
//! 127.0.0.1 port, with a channel-backed tunnel device the test drives
//! directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use weft_core::device::ChannelDevice;
use weft_core::{Config, Manager};
use weft_daemon::api::create_router;
use weft_daemon::state::AppState;

pub const CLUSTER_SECRET: &str = "integration-cluster-secret";

/// Timings are shrunk so re-registration, discovery, and eviction all happen
/// within a few seconds. The auth validity window still has to cover three
/// re-registration intervals.
fn node_config(index: usize, url: &str, seeds: &[String]) -> Config {
    let mut toml = format!(
        r#"
            [node]
            id = "node-{index}"
            listen_url = "{url}"

            [node.networks.ipv4]
            address = "10.99.1.{addr}"
            subnet = "10.99.1.0/24"
            network = "10.99.0.0/16"

            [auth]
            cluster_secret = "{CLUSTER_SECRET}"
            validity_window_secs = 60
            early_validity_secs = 5
            session_max_age_secs = 120
            rsa_key_bits = 1024

            [registrations]
            groom_interval_secs = 0.2
            local_reregister_secs = 0.5
            local_stale_secs = 3.0
            remote_reregister_secs = 1.0
            remote_stale_secs = 3.0
            bootstrap_retry_secs = 0.2
            startup_grace_secs = 10.0

            [transport]
            request_timeout_secs = 5
            queue_depth = 32
            max_batch = 8
        "#,
        index = index,
        addr = 10 + index,
        url = url,
    );
    if !seeds.is_empty() {
        toml.push_str("\n[[registrations.bootstrap]]\nname = \"seed\"\nurls = [");
        for seed in seeds {
            toml.push_str(&format!("\"{}\",", seed));
        }
        toml.push_str("]\n");
    }
    Config::from_toml(&toml).expect("test config must validate")
}

pub struct MeshNode {
    pub id: String,
    pub url: String,
    pub manager: Arc<Manager>,
    pub device: Arc<ChannelDevice>,
    server: JoinHandle<()>,
    /// Aborts every live connection on shutdown, not just the accept loop,
    /// so a stopped node stops answering pooled keep-alive requests too.
    shutdown: axum_server::Handle,
}

impl MeshNode {
    pub async fn spawn(index: usize, seeds: &[String]) -> MeshNode {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let url = format!("http://{}", listener.local_addr().unwrap());

        let config = node_config(index, &url, seeds);
        let device = Arc::new(ChannelDevice::new(32));
        let manager = Manager::new(config, device.clone()).expect("manager");
        manager.start();

        let app = create_router(AppState::new(manager.clone()));
        let shutdown = axum_server::Handle::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                axum_server::from_tcp(listener)
                    .handle(shutdown)
                    .serve(app.into_make_service())
                    .await
                    .expect("serve");
            }
        });

        MeshNode {
            id: format!("node-{}", index),
            url,
            manager,
            device,
            server,
            shutdown,
        }
    }

    /// Tunnel address the node was configured with.
    pub fn tunnel_addr(index: usize) -> [u8; 4] {
        [10, 99, 1, 10 + index as u8]
    }

    /// Stop serving and kill the background loops, as an abrupt node death.
    pub fn stop(&self) {
        self.shutdown.shutdown();
        self.server.abort();
        self.manager.shutdown();
        self.device.close();
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct TestMesh {
    pub nodes: Vec<MeshNode>,
}

impl TestMesh {
    /// Node 0 is the seed; all others bootstrap against it.
    pub async fn new(size: usize) -> TestMesh {
        let mut nodes = vec![MeshNode::spawn(0, &[]).await];
        let seeds = vec![nodes[0].url.clone()];
        for index in 1..size {
            nodes.push(MeshNode::spawn(index, &seeds).await);
        }
        TestMesh { nodes }
    }

    /// Wait until every node knows every other node.
    pub async fn wait_converged(&self) {
        let want = self.nodes.len() - 1;
        for node in &self.nodes {
            let pool = node.manager.pool().clone();
            wait_until(
                &format!("{} sees {} peers", node.id, want),
                Duration::from_secs(15),
                || pool.len() == want,
            )
            .await;
        }
    }
}

pub async fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Minimal valid IPv4/UDP header, 20 bytes, correct checksum.
pub fn ipv4_frame(source: [u8; 4], destination: [u8; 4]) -> Vec<u8> {
    let mut buf = vec![
        0x45, 0x00, 0x00, 0x14, 0xab, 0xcd, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 0, 0, 0, 0, 0,
        0, 0, 0,
    ];
    buf[12..16].copy_from_slice(&source);
    buf[16..20].copy_from_slice(&destination);
    let mut sum: u32 = 0;
    for (i, chunk) in buf.chunks(2).enumerate() {
        if i != 5 {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    buf[10..12].copy_from_slice(&(!(sum as u16)).to_be_bytes());
    buf
}
