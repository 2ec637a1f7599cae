//! Ties the subsystems together and owns the long-running tasks: the groom
//! loop that maintains mesh membership and the read loop that drains the
//! tunnel device into the router.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::device::{DeviceError, TunnelDevice};
use crate::metrics::Metrics;
use crate::nodes::{NodeContext, RemoteNodePool};
use crate::registrations::Registrations;
use crate::router::Router;
use crate::types::{HealthResponse, NodeInfo};

/// Largest frame we will read from the tunnel device; the codec caps payloads
/// at 16-bit lengths anyway.
const MAX_FRAME_LEN: usize = u16::MAX as usize;

pub struct Manager {
    ctx: Arc<NodeContext>,
    pool: Arc<RemoteNodePool>,
    registrations: Arc<Registrations>,
    router: Arc<Router>,
    device: Arc<dyn TunnelDevice>,
    groom_task: Mutex<Option<JoinHandle<()>>>,
    tunnel_task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(config: Config, device: Arc<dyn TunnelDevice>) -> anyhow::Result<Arc<Manager>> {
        let local = local_node_info(&config);
        info!(
            "node {} serving mesh control API at {}",
            local.id, local.listen_url
        );

        let metrics = Arc::new(Metrics::new());
        let ctx = Arc::new(NodeContext::new(Arc::new(config), local, metrics)?);
        let pool = Arc::new(RemoteNodePool::new(ctx.metrics.clone()));
        let registrations = Arc::new(Registrations::new(ctx.clone(), pool.clone()));
        let router = Arc::new(Router::new(ctx.clone(), pool.clone(), device.clone()));

        Ok(Arc::new(Manager {
            ctx,
            pool,
            registrations,
            router,
            device,
            groom_task: Mutex::new(None),
            tunnel_task: Mutex::new(None),
        }))
    }

    /// Spawn the background tasks. Both loops are supervised: a loop that
    /// dies is restarted. The tunnel loop opts out once the device reports
    /// closed, which health checks then surface.
    pub fn start(self: &Arc<Self>) {
        let registrations = self.registrations.clone();
        let interval = self.ctx.config.registrations.groom_interval();
        *self.groom_task.lock() = Some(supervise("groom", move || {
            let registrations = registrations.clone();
            async move {
                loop {
                    registrations.groom().await;
                    tokio::time::sleep(interval).await;
                }
            }
        }));

        let device = self.device.clone();
        let router = self.router.clone();
        *self.tunnel_task.lock() = Some(supervise("tunnel", move || {
            let device = device.clone();
            let router = router.clone();
            async move {
                loop {
                    match device.read_frame(MAX_FRAME_LEN).await {
                        Ok(frame) => router.route_local(&frame),
                        Err(DeviceError::Closed) => {
                            info!("tunnel device closed; read loop ending");
                            return false;
                        }
                        Err(e) => warn!("tunnel read failed: {}", e),
                    }
                }
            }
        }));
    }

    /// Stop background tasks and close every peer queue.
    pub fn shutdown(&self) {
        if let Some(task) = self.groom_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.tunnel_task.lock().take() {
            task.abort();
        }
        for node in self.pool.all() {
            node.close();
        }
        info!("manager shut down");
    }

    pub fn health(&self) -> HealthResponse {
        let registrations = self.registrations.healthy();
        let tunnel = self
            .tunnel_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished());
        HealthResponse {
            status: if registrations && tunnel {
                "ok".to_string()
            } else {
                "degraded".to_string()
            },
            registrations,
            tunnel,
        }
    }

    pub fn ctx(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &Arc<RemoteNodePool> {
        &self.pool
    }

    pub fn registrations(&self) -> &Arc<Registrations> {
        &self.registrations
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    pub fn local(&self) -> &NodeInfo {
        &self.ctx.local
    }
}

/// Identity we advertise, derived from config. A missing id means this node
/// joins as a brand-new member on every start.
fn local_node_info(config: &Config) -> NodeInfo {
    let id = config
        .node
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut node_addresses = HashMap::new();
    let mut network_addresses = HashMap::new();
    for (protocol, net) in &config.node.networks {
        node_addresses.insert(*protocol, net.address);
        network_addresses.insert(*protocol, net.network);
    }
    NodeInfo {
        id,
        listen_url: config.node.listen_url.clone(),
        node_addresses,
        network_addresses,
    }
}

/// Run `factory`'s future in its own task, restarting it with a short delay
/// whenever it panics or ends while asking for a restart (`true`). A loop
/// that resolves to `false` is done for good, and so is its supervisor.
/// Aborting the supervisor aborts the loop with it.
fn supervise<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(factory());
            let _guard = AbortOnDrop(task.abort_handle());
            match task.await {
                Ok(false) => break,
                Ok(true) => warn!("{} task ended unexpectedly; restarting", name),
                Err(e) => warn!("{} task failed: {}; restarting", name, e),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelDevice, FrameQueue};
    use crate::ip::ipv4_frame;
    use crate::metrics::DropReason;
    use crate::testutil::test_config;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tunnel_frames_reach_router() {
        let device = Arc::new(ChannelDevice::new(8));
        let manager = Manager::new(test_config(), device.clone()).unwrap();
        manager.start();

        // Unroutable destination: the read loop must still consume it and
        // count the drop.
        device
            .inbound()
            .push(ipv4_frame([10, 99, 1, 10], [10, 99, 1, 77]))
            .await
            .unwrap();
        let metrics = manager.metrics().clone();
        wait_for(move || metrics.dropped(DropReason::NoRoute) == 1).await;

        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_close_degrades_health() {
        let device = Arc::new(ChannelDevice::new(8));
        let manager = Manager::new(test_config(), device.clone()).unwrap();
        manager.start();
        assert!(manager.health().tunnel);
        assert_eq!(manager.health().status, "ok");

        device.close();
        let watched = manager.clone();
        wait_for(move || !watched.health().tunnel).await;
        assert_eq!(manager.health().status, "degraded");

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_generated_id_when_config_has_none() {
        let mut config = test_config();
        config.node.id = None;
        let device = Arc::new(ChannelDevice::new(8));
        let manager = Manager::new(config, device).unwrap();
        assert!(!manager.local().id.is_empty());
    }
}
