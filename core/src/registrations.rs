//! Mesh membership maintenance: bootstrap against seed URLs, periodic
//! re-registration with known peers, transitive peer discovery, and eviction
//! of peers that stopped registering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::SignedPayload;
use crate::error::{RegistrationError, RequestError};
use crate::faults::FaultTracker;
use crate::nodes::{NodeContext, RemoteNode, RemoteNodePool};
use crate::types::{NodeInfo, Registration};

struct GroupState {
    name: String,
    urls: Vec<String>,
    /// -1 means unlimited.
    retry_budget: i64,
    attempts: i64,
    satisfied: bool,
}

impl GroupState {
    fn exhausted(&self) -> bool {
        self.retry_budget >= 0 && self.attempts > self.retry_budget
    }
}

pub struct Registrations {
    ctx: Arc<NodeContext>,
    pool: Arc<RemoteNodePool>,
    faults: FaultTracker,
    groups: Mutex<Vec<GroupState>>,
    /// Peers we learned about transitively and have yet to contact directly.
    discovered: Mutex<Vec<NodeInfo>>,
    /// Whether the pool ever held a peer; losing them all re-arms bootstrap.
    seen_peers: AtomicBool,
    started_at: Instant,
    last_bootstrap: Mutex<Option<Instant>>,
}

impl Registrations {
    pub fn new(ctx: Arc<NodeContext>, pool: Arc<RemoteNodePool>) -> Self {
        let groups = ctx
            .config
            .registrations
            .bootstrap
            .iter()
            .map(|group| GroupState {
                name: group.name.clone(),
                urls: group.urls.clone(),
                retry_budget: group.retry_budget,
                attempts: 0,
                satisfied: false,
            })
            .collect();
        // One groom cycle of backoff for anything that just failed.
        let faults = FaultTracker::new(ctx.config.registrations.groom_interval());
        Self {
            ctx,
            pool,
            faults,
            groups: Mutex::new(groups),
            discovered: Mutex::new(Vec::new()),
            seen_peers: AtomicBool::new(false),
            started_at: Instant::now(),
            last_bootstrap: Mutex::new(None),
        }
    }

    /// The registration document we advertise: our own identity plus every
    /// peer we currently know about.
    pub fn outbound_registration(&self) -> Registration {
        let remote = self
            .pool
            .all()
            .iter()
            .map(|node| node.node_info())
            .collect();
        Registration::new(self.ctx.local.clone(), remote)
    }

    /// Apply a registration received from a peer, either over the bootstrap
    /// path or a session-authenticated one. `resolved_id` is the caller's
    /// independently resolved identity, when the transport layer has one; a
    /// mismatch with the claimed id rejects the document. Returns the
    /// response document: our own current registration.
    pub fn process_registration(
        &self,
        registration: Registration,
        resolved_id: Option<&str>,
    ) -> Result<Registration, RegistrationError> {
        if registration.local.id == self.ctx.local_id() {
            return Err(RegistrationError::FromSelf);
        }
        if let Some(resolved) = resolved_id {
            if resolved != registration.local.id {
                return Err(RegistrationError::Failed(format!(
                    "claimed id {} does not match resolved id {}",
                    registration.local.id, resolved
                )));
            }
        }

        let transitive = registration.remote.clone();
        let id = registration.local.id.clone();
        self.pool.register(&self.ctx, registration).map_err(|e| {
            self.ctx
                .metrics
                .registrations
                .with_label_values(&["error"])
                .inc();
            e
        })?;
        self.ctx
            .metrics
            .registrations
            .with_label_values(&["ok"])
            .inc();
        self.seen_peers.store(true, Ordering::Relaxed);
        debug!("registered node {}", id);

        // Peers of the registering node we have never seen become candidates
        // themselves. They enter the pool only through a direct bootstrap
        // against their advertised URL, which the groom loop performs.
        for info in transitive {
            if info.id == self.ctx.local_id() || self.pool.contains(&info.id) {
                continue;
            }
            let mut discovered = self.discovered.lock();
            if discovered.iter().any(|known| known.id == info.id) {
                continue;
            }
            info!("discovered node {} via {}", info.id, id);
            self.ctx
                .metrics
                .registrations
                .with_label_values(&["transitive"])
                .inc();
            discovered.push(info);
        }

        Ok(self.outbound_registration())
    }

    /// Fold a peer's register response back into the pool. Failures are
    /// logged, not raised: the request itself already succeeded.
    fn merge_response(&self, registration: Registration) {
        let id = registration.local.id.clone();
        if let Err(e) = self.process_registration(registration, None) {
            warn!("could not merge registration response from {}: {}", id, e);
        }
    }

    /// True once every configured bootstrap group has produced at least one
    /// successful registration, or has run out of retries.
    pub fn bootstrapped(&self) -> bool {
        self.groups
            .lock()
            .iter()
            .all(|g| g.satisfied || g.exhausted())
    }

    /// One pass over the unsatisfied bootstrap groups, rate-limited by the
    /// configured retry interval.
    pub async fn bootstrap(&self) {
        let retry = std::time::Duration::from_secs_f64(
            self.ctx.config.registrations.bootstrap_retry_secs,
        );
        {
            let mut last = self.last_bootstrap.lock();
            if last.is_some_and(|at| at.elapsed() < retry) {
                return;
            }
            *last = Some(Instant::now());
        }

        let pending: Vec<(String, Vec<String>)> = {
            let groups = self.groups.lock();
            groups
                .iter()
                .filter(|g| !g.satisfied && !g.exhausted())
                .map(|g| (g.name.clone(), g.urls.clone()))
                .collect()
        };

        for (name, urls) in pending {
            let mut ok = false;
            let mut attempted = false;
            for url in &urls {
                match self.bootstrap_url(url).await {
                    Ok(true) => {
                        attempted = true;
                        ok = true;
                        break;
                    }
                    Ok(false) => {} // skipped (self, or backing off)
                    Err(e) => {
                        attempted = true;
                        self.faults.record(url);
                        warn!("bootstrap against {} failed: {:#}", url, e);
                    }
                }
            }
            let mut groups = self.groups.lock();
            let Some(group) = groups.iter_mut().find(|g| g.name == name) else {
                continue;
            };
            if ok {
                info!("bootstrap group {} satisfied", name);
                group.satisfied = true;
            } else if attempted {
                // A pass where every URL was skipped spends no retry budget.
                group.attempts += 1;
                if group.exhausted() {
                    warn!("bootstrap group {} exhausted its retry budget", name);
                }
            }
        }
    }

    /// Register against one seed URL using the cluster secret. Returns
    /// Ok(false) when the URL was skipped rather than attempted.
    async fn bootstrap_url(&self, url: &str) -> anyhow::Result<bool> {
        let trimmed = url.trim_end_matches('/');
        if trimmed == self.ctx.local.listen_url.trim_end_matches('/') {
            return Ok(false);
        }
        if self.faults.is_blocked(url) {
            return Ok(false);
        }

        let client = self.ctx.new_client(url);
        let summary = client
            .node_info()
            .await
            .with_context(|| format!("resolving node behind {}", url))?;
        if summary.id == self.ctx.local_id() {
            debug!("seed URL {} is this node; skipping", url);
            return Ok(false);
        }

        let outbound = self.outbound_registration();
        let body = serde_json::to_vec(&outbound).context("encoding registration")?;
        let auth_cfg = &self.ctx.config.auth;
        let authorization = self.ctx.cluster.sign(
            self.ctx.local_id(),
            &summary.id,
            SignedPayload::Bytes(&body),
            auth_cfg.validity_window(),
            auth_cfg.early_validity(),
        )?;
        let response = client
            .post("/control/v0/registrations/register", body, authorization)
            .await
            .with_context(|| format!("registering with {}", url))?;

        let credential = response
            .authorization
            .as_deref()
            .ok_or(crate::error::AuthError)?;
        self.ctx.cluster.verify(
            self.ctx.local_id(),
            SignedPayload::Bytes(&response.body),
            credential,
        )?;
        let registration: Registration =
            serde_json::from_slice(&response.body).context("decoding registration response")?;
        info!("bootstrapped against {} ({})", url, registration.local.id);
        self.merge_response(registration);
        Ok(true)
    }

    /// One maintenance cycle: finish bootstrapping, introduce ourselves to
    /// transitively discovered peers, re-register with peers that are due,
    /// evict peers that went stale, expire old faults.
    pub async fn groom(&self) {
        if !self.bootstrapped() {
            self.bootstrap().await;
        }

        self.contact_discovered().await;

        let registrations_cfg = &self.ctx.config.registrations;
        for node in self.pool.all() {
            let local_subnet = self.in_local_subnet(&node);
            if !node.healthy(registrations_cfg.stale_threshold(local_subnet)) {
                warn!(peer = %node.id(), "peer went stale or unhealthy; evicting");
                self.pool.remove(node.id());
                self.ctx
                    .metrics
                    .registrations
                    .with_label_values(&["evicted"])
                    .inc();
                continue;
            }
            if node.idle() > registrations_cfg.reregister_interval(local_subnet) {
                self.reregister_peer(&node).await;
            }
        }

        // A node that had peers and lost them all has nobody left to gossip
        // with; its seed groups get a fresh retry budget.
        if self.pool.is_empty() && self.seen_peers.swap(false, Ordering::Relaxed) {
            let mut groups = self.groups.lock();
            if !groups.is_empty() {
                info!("all known peers lost; re-arming bootstrap groups");
                for group in groups.iter_mut() {
                    group.satisfied = false;
                    group.attempts = 0;
                }
            }
        }

        self.faults.expire();
    }

    /// Bootstrap directly against every peer learned transitively since the
    /// last cycle. A failed introduction is dropped here; the peer keeps
    /// showing up in registration responses until we reach it, so it will be
    /// re-queued.
    async fn contact_discovered(&self) {
        let pending = std::mem::take(&mut *self.discovered.lock());
        for info in pending {
            if self.pool.contains(&info.id) {
                continue;
            }
            if let Err(e) = self.bootstrap_url(&info.listen_url).await {
                self.faults.record(&info.listen_url);
                warn!("introduction to discovered node {} failed: {:#}", info.id, e);
            }
        }
    }

    async fn reregister_peer(&self, node: &Arc<RemoteNode>) {
        if self.faults.is_blocked(node.id()) {
            return;
        }
        let outbound = self.outbound_registration();
        match node.reregister(&outbound).await {
            Ok(response) => self.merge_response(response),
            Err(RequestError::Status { status: 404 }) => {
                // The peer restarted and no longer knows us. Fall back to a
                // cluster-authenticated registration at its listen URL.
                info!(peer = %node.id(), "peer lost our registration; re-bootstrapping");
                if let Err(e) = self.bootstrap_url(&node.listen_url()).await {
                    self.faults.record(node.id());
                    warn!(peer = %node.id(), "re-bootstrap failed: {:#}", e);
                }
            }
            Err(e) => {
                self.faults.record(node.id());
                self.ctx
                    .metrics
                    .registrations
                    .with_label_values(&["error"])
                    .inc();
                warn!(peer = %node.id(), "re-registration failed: {}", e);
            }
        }
    }

    /// Healthy once we know at least one peer, with a startup grace window so
    /// seed nodes and single-node meshes do not flap their health checks.
    pub fn healthy(&self) -> bool {
        if !self.pool.is_empty() {
            return true;
        }
        self.started_at.elapsed()
            < std::time::Duration::from_secs_f64(
                self.ctx.config.registrations.startup_grace_secs,
            )
    }

    fn in_local_subnet(&self, node: &RemoteNode) -> bool {
        self.ctx.config.node.networks.iter().any(|(protocol, net)| {
            node.node_info()
                .address(*protocol)
                .is_some_and(|addr| net.subnet.contains(&addr))
        })
    }

    #[cfg(test)]
    pub(crate) fn faults(&self) -> &FaultTracker {
        &self.faults
    }

    #[cfg(test)]
    pub(crate) fn discovered_ids(&self) -> Vec<String> {
        self.discovered.lock().iter().map(|n| n.id.clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn mark_group_satisfied(&self, name: &str) {
        if let Some(group) = self.groups.lock().iter_mut().find(|g| g.name == name) {
            group.satisfied = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::{context_for, peer_registration, test_context, TEST_CONFIG_TOML};
    use std::time::Duration;

    fn registrations() -> (Arc<NodeContext>, Arc<RemoteNodePool>, Registrations) {
        let ctx = test_context();
        let pool = Arc::new(RemoteNodePool::new(ctx.metrics.clone()));
        let reg = Registrations::new(ctx.clone(), pool.clone());
        (ctx, pool, reg)
    }

    /// Like `registrations`, with one bootstrap group pointing at an
    /// unreachable seed. Tests never let a request actually leave.
    fn registrations_with_group(
        retry_budget: i64,
    ) -> (Arc<NodeContext>, Arc<RemoteNodePool>, Registrations) {
        let toml = format!(
            "{}\n[[registrations.bootstrap]]\nname = \"seed\"\nurls = [\"{}\"]\nretry_budget = {}\n",
            TEST_CONFIG_TOML, UNREACHABLE_SEED, retry_budget
        );
        let ctx = context_for(Config::from_toml(&toml).unwrap());
        let pool = Arc::new(RemoteNodePool::new(ctx.metrics.clone()));
        let reg = Registrations::new(ctx.clone(), pool.clone());
        (ctx, pool, reg)
    }

    const UNREACHABLE_SEED: &str = "http://10.99.9.9:4800";

    #[tokio::test]
    async fn test_registration_from_self_rejected() {
        let (ctx, pool, reg) = registrations();
        let mut doc = peer_registration("peer-1", [10, 99, 1, 20]);
        doc.local.id = ctx.local_id().to_string();
        let err = reg.process_registration(doc, None).unwrap_err();
        assert!(matches!(err, RegistrationError::FromSelf));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_resolved_id_mismatch_rejected() {
        let (_ctx, pool, reg) = registrations();
        let doc = peer_registration("peer-1", [10, 99, 1, 20]);
        let err = reg
            .process_registration(doc, Some("somebody-else"))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Failed(_)));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_transitive_discovery_queues_unknown_peers() {
        let (ctx, pool, reg) = registrations();
        let mut doc = peer_registration("peer-1", [10, 99, 1, 20]);
        doc.remote
            .push(peer_registration("peer-2", [10, 99, 2, 30]).local);
        // Our own entry in the transitive list must not loop back.
        doc.remote.push(ctx.local.clone());

        let response = reg.process_registration(doc, Some("peer-1")).unwrap();

        assert!(pool.contains("peer-1"));
        // peer-2 is only queued for a direct introduction, never registered
        // off someone else's word.
        assert!(!pool.contains("peer-2"));
        assert_eq!(reg.discovered_ids(), vec!["peer-2".to_string()]);
        // The response advertises who we now know.
        assert_eq!(response.local.id, ctx.local_id());
        let ids: Vec<&str> = response.remote.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.contains(&"peer-1"));
        assert!(!ids.contains(&"peer-2"));
    }

    #[tokio::test]
    async fn test_discovery_queue_deduplicates() {
        let (_ctx, _pool, reg) = registrations();
        let mut doc = peer_registration("peer-1", [10, 99, 1, 20]);
        doc.remote
            .push(peer_registration("peer-2", [10, 99, 2, 30]).local);
        reg.process_registration(doc, None).unwrap();

        // Another peer advertising the same stranger must not queue it twice.
        let mut doc = peer_registration("peer-3", [10, 99, 1, 40]);
        doc.remote
            .push(peer_registration("peer-2", [10, 99, 2, 30]).local);
        reg.process_registration(doc, None).unwrap();

        assert_eq!(reg.discovered_ids(), vec!["peer-2".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_peer_evicted_by_groom() {
        let (_ctx, pool, reg) = registrations();
        reg.process_registration(peer_registration("peer-1", [10, 99, 1, 20]), None)
            .unwrap();
        let node = pool.find("peer-1").unwrap();
        // 10.99.1.0/24 is our local subnet, so the 90s threshold applies.
        node.backdate_last_registered(Duration::from_secs(120));

        reg.groom().await;
        assert!(!pool.contains("peer-1"));
        assert!(node.is_closed());
    }

    #[tokio::test]
    async fn test_fresh_peer_survives_groom() {
        let (_ctx, pool, reg) = registrations();
        reg.process_registration(peer_registration("peer-1", [10, 99, 1, 20]), None)
            .unwrap();
        reg.groom().await;
        assert!(pool.contains("peer-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_grace_window() {
        let (_ctx, pool, reg) = registrations();
        assert!(reg.healthy());

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!reg.healthy());

        reg.process_registration(peer_registration("peer-1", [10, 99, 1, 20]), None)
            .unwrap();
        assert!(reg.healthy());
        assert!(pool.contains("peer-1"));
    }

    #[tokio::test]
    async fn test_total_peer_loss_rearms_bootstrap() {
        let (_ctx, pool, reg) = registrations_with_group(-1);
        reg.mark_group_satisfied("seed");
        assert!(reg.bootstrapped());

        reg.process_registration(peer_registration("peer-1", [10, 99, 1, 20]), None)
            .unwrap();
        let node = pool.find("peer-1").unwrap();
        node.backdate_last_registered(Duration::from_secs(120));

        // Evicting the last peer must put the node back into bootstrapping,
        // or it would sit with an empty pool forever.
        reg.groom().await;
        assert!(pool.is_empty());
        assert!(!reg.bootstrapped());
    }

    #[tokio::test]
    async fn test_blocked_urls_spend_no_retry_budget() {
        let (_ctx, _pool, reg) = registrations_with_group(0);
        reg.faults().record(UNREACHABLE_SEED);

        // Budget 0 allows one real attempt; a pass where every seed URL is
        // fault-blocked must not consume it.
        reg.bootstrap().await;
        assert!(!reg.bootstrapped());
    }

    #[tokio::test]
    async fn test_faulted_peer_skips_reregistration() {
        let (_ctx, pool, reg) = registrations();
        reg.process_registration(peer_registration("peer-1", [10, 99, 1, 20]), None)
            .unwrap();
        let node = pool.find("peer-1").unwrap();
        // Past the re-registration interval but short of staleness. With the
        // peer marked faulted, groom must not attempt the unreachable URL.
        node.backdate_last_registered(Duration::from_secs(40));
        reg.faults().record(node.id());

        reg.groom().await;
        assert!(pool.contains("peer-1"));
    }
}
