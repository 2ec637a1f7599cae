//! One known peer: its current registration, the auth session securing calls
//! to it, and the bounded transmit queue + worker that moves packets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{AuthSession, InitSessionReply, SessionInitiator, SignedPayload, Token};
use crate::client::ApiClient;
use crate::codec::Packet;
use crate::error::{RegistrationError, RequestError};
use crate::ip::ETHERTYPE_IPV6;
use crate::metrics::DropReason;
use crate::nodes::NodeContext;
use crate::types::{
    unix_seconds_f64, InitSessionRequest, InitSessionResponse, NodeInfo, Protocol, Registration,
};

pub struct RemoteNode {
    id: String,
    ctx: Arc<NodeContext>,
    client: ApiClient,
    session: AuthSession,
    registration: RwLock<Registration>,
    last_registered: Mutex<Instant>,
    tx: Mutex<Option<mpsc::Sender<Packet>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RemoteNode {
    /// Create from the peer's first registration. The id is fixed here for
    /// the node's lifetime.
    pub fn new(ctx: Arc<NodeContext>, registration: Registration) -> Arc<RemoteNode> {
        let id = registration.local.id.clone();
        let client = ctx.new_client(&registration.local.listen_url);
        let session = AuthSession::new(
            ctx.local.id.clone(),
            id.clone(),
            ctx.config.auth.clone(),
            ctx.metrics.clone(),
        );
        Arc::new(RemoteNode {
            id,
            ctx,
            client,
            session,
            registration: RwLock::new(registration),
            last_registered: Mutex::new(Instant::now()),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_info(&self) -> NodeInfo {
        self.registration.read().local.clone()
    }

    pub fn listen_url(&self) -> String {
        self.registration.read().local.listen_url.clone()
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    /// Apply a newer registration in place. The node's id and tunnel
    /// addresses are immutable: changing an address would corrupt the
    /// address index, so such registrations are a hard error and the peer
    /// must re-bootstrap under a new id.
    pub fn update_registration(&self, registration: Registration) -> Result<(), RegistrationError> {
        if registration.local.id != self.id {
            return Err(RegistrationError::Failed(format!(
                "registration for {} applied to node {}",
                registration.local.id, self.id
            )));
        }
        if registration.local.node_addresses != self.registration.read().local.node_addresses {
            return Err(RegistrationError::Failed(
                "node address change is unsupported".to_string(),
            ));
        }
        *self.registration.write() = registration;
        *self.last_registered.lock() = Instant::now();
        Ok(())
    }

    /// Time since the peer last registered with us (or we with it).
    pub fn idle(&self) -> Duration {
        self.last_registered.lock().elapsed()
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.idle() > threshold
    }

    /// A peer is healthy while its registration is fresh and its transmit
    /// worker, if one was ever started, is still running.
    pub fn healthy(&self, stale_threshold: Duration) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.is_stale(stale_threshold) {
            return false;
        }
        match self.worker.lock().as_ref() {
            Some(handle) => !handle.is_finished(),
            None => true,
        }
    }

    /// Hand a packet to this peer's transmit queue. Never fails upward:
    /// expired, overflowing, or post-close packets are dropped and counted.
    pub fn enqueue(self: &Arc<Self>, packet: Packet) {
        if self.closed.load(Ordering::SeqCst) {
            self.ctx.metrics.drop_packet(DropReason::QueueClosed);
            return;
        }
        let expiry = self.ctx.config.transport.expiry(packet_protocol(&packet));
        if packet.age(unix_seconds_f64()) > expiry {
            self.ctx.metrics.drop_packet(DropReason::Expired);
            return;
        }
        self.ensure_worker();
        let tx = self.tx.lock().clone();
        match tx {
            None => self.ctx.metrics.drop_packet(DropReason::QueueClosed),
            Some(tx) => match tx.try_send(packet) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.ctx.metrics.drop_packet(DropReason::QueueFull);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.ctx.metrics.drop_packet(DropReason::QueueClosed);
                }
            },
        }
    }

    /// Start the transmit worker if it is missing or has died. Workers are
    /// created lazily on first outbound packet.
    fn ensure_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.ctx.config.transport.queue_depth);
        *self.tx.lock() = Some(tx);
        let node = self.clone();
        *worker = Some(tokio::spawn(async move { node.run_worker(rx).await }));
        debug!(peer = %self.id, "transmit worker started");
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Packet>) {
        let max_batch = self.ctx.config.transport.max_batch;
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < max_batch {
                match rx.try_recv() {
                    Ok(packet) => batch.push(packet),
                    Err(_) => break,
                }
            }
            self.transmit(batch).await;
        }
        debug!(peer = %self.id, "transmit worker stopped");
    }

    /// Send a batch to the peer. Failures are logged and counted; the worker
    /// loop never dies because one call failed.
    async fn transmit(&self, batch: Vec<Packet>) {
        let now = unix_seconds_f64();
        let mut live = Vec::with_capacity(batch.len());
        for packet in batch {
            // Queuing delay may have outlived the packet.
            if packet.age(now) > self.ctx.config.transport.expiry(packet_protocol(&packet)) {
                self.ctx.metrics.drop_packet(DropReason::Expired);
            } else {
                live.push(packet);
            }
        }
        if live.is_empty() {
            return;
        }

        self.ctx
            .metrics
            .transmit_batch_size
            .observe(live.len() as f64);
        let count = live.len() as u64;
        let result = if live.len() == 1 {
            self.send_single(&live[0]).await
        } else {
            self.send_batch(&live).await
        };
        match result {
            Ok(()) => {
                self.ctx
                    .metrics
                    .packets_transmitted
                    .with_label_values(&["ok"])
                    .inc_by(count);
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .packets_transmitted
                    .with_label_values(&["error"])
                    .inc_by(count);
                warn!(peer = %self.id, "packet transmit failed: {}", e);
            }
        }
    }

    async fn send_single(&self, packet: &Packet) -> Result<(), RequestError> {
        let body = serde_json::to_vec(&packet.to_json())
            .map_err(|e| RequestError::Response(e.to_string()))?;
        let authorization = self
            .session
            .authorization_for_request(self, SignedPayload::Packet(packet))
            .await?;
        let token_id = self.session.outbound_token_id();
        let path = format!("/control/v0/packet/rx/{}", self.ctx.local.id);
        let response = self
            .client
            .post(&path, body, authorization)
            .await
            .map_err(|e| self.note_request_error(e, token_id))?;
        self.session.verify_response(
            SignedPayload::Bytes(&response.body),
            response.authorization.as_deref(),
        )?;
        Ok(())
    }

    async fn send_batch(&self, batch: &[Packet]) -> Result<(), RequestError> {
        let docs: Vec<String> = batch
            .iter()
            .map(|p| serde_json::to_string(&p.to_json()))
            .collect::<Result<_, _>>()
            .map_err(|e| RequestError::Response(e.to_string()))?;
        let body =
            serde_json::to_vec(&docs).map_err(|e| RequestError::Response(e.to_string()))?;
        let authorization = self
            .session
            .authorization_for_request(self, SignedPayload::Bytes(&body))
            .await?;
        let token_id = self.session.outbound_token_id();
        let path = format!("/control/v0/packet/rx/{}/batch", self.ctx.local.id);
        let response = self
            .client
            .post(&path, body, authorization)
            .await
            .map_err(|e| self.note_request_error(e, token_id))?;
        self.session.verify_response(
            SignedPayload::Bytes(&response.body),
            response.authorization.as_deref(),
        )?;
        Ok(())
    }

    /// Re-register with this peer: send our current outbound registration,
    /// return the peer's response document for merging.
    pub async fn reregister(&self, outbound: &Registration) -> Result<Registration, RequestError> {
        let body =
            serde_json::to_vec(outbound).map_err(|e| RequestError::Response(e.to_string()))?;
        let authorization = self
            .session
            .authorization_for_request(self, SignedPayload::Bytes(&body))
            .await?;
        let token_id = self.session.outbound_token_id();
        let path = format!("/control/v0/registrations/register/{}", self.ctx.local.id);
        let response = self
            .client
            .post(&path, body, authorization)
            .await
            .map_err(|e| self.note_request_error(e, token_id))?;
        self.session.verify_response(
            SignedPayload::Bytes(&response.body),
            response.authorization.as_deref(),
        )?;
        serde_json::from_slice(&response.body).map_err(|e| RequestError::Response(e.to_string()))
    }

    fn note_request_error(&self, error: RequestError, token_id: Option<String>) -> RequestError {
        if error.is_client_error() {
            if let Some(id) = token_id {
                self.session.invalidate_outbound(&id);
            }
        }
        error
    }

    /// Terminate this peer: the queue closes, the worker drains whatever is
    /// already queued and exits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
        info!(peer = %self.id, "remote node closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_registered(&self, by: Duration) {
        let mut last = self.last_registered.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}

#[async_trait]
impl SessionInitiator for RemoteNode {
    async fn init_session(
        &self,
        public_key_pem: &str,
        current: Option<&Token>,
    ) -> Result<InitSessionReply, RequestError> {
        let request = InitSessionRequest {
            node_id: self.ctx.local.id.clone(),
            public_key: public_key_pem.to_string(),
        };
        let body =
            serde_json::to_vec(&request).map_err(|e| RequestError::Response(e.to_string()))?;
        let auth_cfg = &self.ctx.config.auth;
        let (path, authorization, verify_with_cluster) = match current {
            Some(token) => (
                format!("/auth/v0/init_session/{}", self.ctx.local.id),
                token.sign(
                    &self.ctx.local.id,
                    &self.id,
                    SignedPayload::Bytes(&body),
                    auth_cfg.validity_window(),
                    auth_cfg.early_validity(),
                )?,
                false,
            ),
            None => (
                "/auth/v0/init_session".to_string(),
                self.ctx.cluster.sign(
                    &self.ctx.local.id,
                    &self.id,
                    SignedPayload::Bytes(&body),
                    auth_cfg.validity_window(),
                    auth_cfg.early_validity(),
                )?,
                true,
            ),
        };

        let response = self.client.post(&path, body, authorization).await?;
        if verify_with_cluster {
            let credential = response.authorization.as_deref().ok_or(crate::error::AuthError)?;
            self.ctx.cluster.verify(
                &self.ctx.local.id,
                SignedPayload::Bytes(&response.body),
                credential,
            )?;
        } else if self.session.has_inbound() {
            self.session.verify_response(
                SignedPayload::Bytes(&response.body),
                response.authorization.as_deref(),
            )?;
        }

        let parsed: InitSessionResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RequestError::Response(e.to_string()))?;
        let ciphertext = BASE64
            .decode(&parsed.secret)
            .map_err(|e| RequestError::Response(e.to_string()))?;
        Ok(InitSessionReply {
            id: parsed.id,
            ciphertext,
        })
    }
}

fn packet_protocol(packet: &Packet) -> Protocol {
    if packet.ethertype() == ETHERTYPE_IPV6 {
        Protocol::Ipv6
    } else {
        Protocol::Ipv4
    }
}
