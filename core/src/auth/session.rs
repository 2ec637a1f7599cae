//! Per-peer session state: one inbound token to verify the peer's requests,
//! one outbound token to sign ours, and the rotation machinery that replaces
//! the outbound secret off the critical path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::auth::token::{SignedPayload, Token};
use crate::concurrent_lock::ConcurrentLock;
use crate::config::AuthConfig;
use crate::error::{AuthError, RequestError};
use crate::metrics::Metrics;
use crate::types::{InitSessionRequest, InitSessionResponse};

/// Transport used to run a rotation handshake against the peer. Implemented
/// by `RemoteNode` over its API client; kept narrow so the session never sees
/// the rest of the peer machinery.
#[async_trait]
pub trait SessionInitiator: Send + Sync {
    /// Call the peer's init-session endpoint with our ephemeral public key.
    /// `current` is the cached outbound token, if any: with one the call is
    /// session-authenticated, without one it falls back to the cluster
    /// secret.
    async fn init_session(
        &self,
        public_key_pem: &str,
        current: Option<&Token>,
    ) -> Result<InitSessionReply, RequestError>;
}

/// Raw init-session result: the new token id and the RSA-encrypted secret.
#[derive(Debug)]
pub struct InitSessionReply {
    pub id: String,
    pub ciphertext: Vec<u8>,
}

pub struct AuthSession {
    local_id: String,
    peer_id: String,
    auth: AuthConfig,
    inbound: Mutex<Option<Token>>,
    outbound: Mutex<Option<Token>>,
    lock: ConcurrentLock,
    metrics: Arc<Metrics>,
}

impl AuthSession {
    pub fn new(local_id: String, peer_id: String, auth: AuthConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            local_id,
            peer_id,
            auth,
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            lock: ConcurrentLock::new(),
            metrics,
        }
    }

    /// Sign an outbound-initiated request, rotating the outbound token first
    /// if it is missing or close to its maximum age. Signing runs as a block
    /// so many callers proceed concurrently; the rotation itself runs in the
    /// exclusive section because it replaces the secret those callers read.
    pub async fn authorization_for_request(
        &self,
        initiator: &dyn SessionInitiator,
        payload: SignedPayload<'_>,
    ) -> Result<String, RequestError> {
        self.lock
            .block(|| async {
                if self.needs_rotation() {
                    self.lock
                        .synchronize(|| async {
                            // Re-check: another caller may have rotated while
                            // we waited for the exclusive section.
                            if self.needs_rotation() {
                                self.rotate(initiator).await
                            } else {
                                Ok(())
                            }
                        })
                        .await?;
                }
                self.sign_with_outbound(payload)
            })
            .await
    }

    /// Sign a mutual-authentication response to an inbound request. Uses the
    /// cached outbound token as-is: if two peers rotate simultaneously while
    /// each is answering the other's request, rotating here would create a
    /// circular wait. A soon-to-expire token is still acceptable because the
    /// validity window is config-checked to cover several rotation rounds.
    pub async fn authorization_for_response(
        &self,
        initiator: &dyn SessionInitiator,
        payload: SignedPayload<'_>,
    ) -> Result<String, RequestError> {
        let cached = self.outbound.lock().clone();
        match cached {
            Some(token) => self.sign_token(&token, payload).map_err(RequestError::from),
            None => self.authorization_for_request(initiator, payload).await,
        }
    }

    /// Verify an inbound request credential against the peer's current
    /// inbound token.
    pub fn verify_request(
        &self,
        payload: SignedPayload<'_>,
        credential: &str,
    ) -> Result<(), AuthError> {
        let inbound = self.inbound.lock().clone().ok_or(AuthError)?;
        if inbound.age() > self.auth.session_max_age() + self.auth.validity_window() {
            debug!(peer = %self.peer_id, "inbound session token expired");
            *self.inbound.lock() = None;
            return Err(AuthError);
        }
        inbound.verify(&self.local_id, payload, credential)
    }

    /// Verify the peer's mutual-auth response header. The peer signs
    /// responses with its own outbound token, which is our inbound one.
    pub fn verify_response(
        &self,
        payload: SignedPayload<'_>,
        credential: Option<&str>,
    ) -> Result<(), AuthError> {
        match credential {
            Some(credential) => self.verify_request(payload, credential),
            None => Err(AuthError),
        }
    }

    /// Handle a peer-initiated rotation: mint a fresh inbound token and
    /// return its secret encrypted to the caller's public key.
    pub fn accept_rotation(
        &self,
        request: &InitSessionRequest,
    ) -> Result<InitSessionResponse, AuthError> {
        let public_key =
            RsaPublicKey::from_public_key_pem(&request.public_key).map_err(|_| AuthError)?;
        let token = Token::generate();
        let ciphertext = public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &token.secret)
            .map_err(|_| AuthError)?;
        let response = InitSessionResponse {
            id: token.id.clone(),
            secret: BASE64.encode(ciphertext),
        };
        *self.inbound.lock() = Some(token);
        info!(peer = %self.peer_id, "accepted session rotation");
        Ok(response)
    }

    /// React to a 4xx on a request we signed: the outbound token is
    /// invalidated only if the id that failed still matches the cached one,
    /// so a stale failure cannot race a newer valid token out.
    pub fn invalidate_outbound(&self, failed_token_id: &str) {
        let mut outbound = self.outbound.lock();
        if outbound.as_ref().is_some_and(|t| t.id == failed_token_id) {
            warn!(peer = %self.peer_id, "outbound session token rejected by peer; discarding");
            *outbound = None;
        }
    }

    pub fn outbound_token_id(&self) -> Option<String> {
        self.outbound.lock().as_ref().map(|t| t.id.clone())
    }

    pub fn has_inbound(&self) -> bool {
        self.inbound.lock().is_some()
    }

    fn needs_rotation(&self) -> bool {
        let rotation_age = self
            .auth
            .session_max_age()
            .checked_sub(self.auth.validity_window())
            .unwrap_or(Duration::ZERO);
        match self.outbound.lock().as_ref() {
            None => true,
            Some(token) => token.age() > rotation_age,
        }
    }

    async fn rotate(&self, initiator: &dyn SessionInitiator) -> Result<(), RequestError> {
        let bits = self.auth.rsa_key_bits;
        let private_key =
            tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut rand::thread_rng(), bits))
                .await
                .map_err(|_| AuthError)?
                .map_err(|_| AuthError)?;
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| AuthError)?;

        let current = self.outbound.lock().clone();
        let reply = initiator
            .init_session(&public_key_pem, current.as_ref())
            .await?;
        let secret = private_key
            .decrypt(Oaep::new::<Sha256>(), &reply.ciphertext)
            .map_err(|_| AuthError)?;

        *self.outbound.lock() = Some(Token::from_parts(reply.id, secret));
        self.metrics.sessions_rotated.inc();
        info!(peer = %self.peer_id, "rotated outbound session token");
        Ok(())
    }

    fn sign_with_outbound(&self, payload: SignedPayload<'_>) -> Result<String, RequestError> {
        let token = self.outbound.lock().clone().ok_or(AuthError)?;
        self.sign_token(&token, payload).map_err(RequestError::from)
    }

    fn sign_token(&self, token: &Token, payload: SignedPayload<'_>) -> Result<String, AuthError> {
        token.sign(
            &self.local_id,
            &self.peer_id,
            payload,
            self.auth.validity_window(),
            self.auth.early_validity(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_auth_config() -> AuthConfig {
        AuthConfig {
            cluster_secret: "cluster-secret".to_string(),
            validity_window_secs: 300,
            early_validity_secs: 30,
            session_max_age_secs: 600,
            // Small keys keep rotation tests fast; OAEP-SHA256 of a 32-byte
            // secret needs at least 1024 bits.
            rsa_key_bits: 1024,
        }
    }

    fn session_pair() -> (Arc<AuthSession>, Arc<AuthSession>) {
        let metrics = Arc::new(Metrics::new());
        let a = Arc::new(AuthSession::new(
            "node-a".to_string(),
            "node-b".to_string(),
            test_auth_config(),
            metrics.clone(),
        ));
        let b = Arc::new(AuthSession::new(
            "node-b".to_string(),
            "node-a".to_string(),
            test_auth_config(),
            metrics,
        ));
        (a, b)
    }

    /// Initiator that hands the rotation straight to the responding session,
    /// standing in for the HTTP round trip.
    struct Loopback {
        responder: Arc<AuthSession>,
        caller_id: String,
    }

    #[async_trait]
    impl SessionInitiator for Loopback {
        async fn init_session(
            &self,
            public_key_pem: &str,
            _current: Option<&Token>,
        ) -> Result<InitSessionReply, RequestError> {
            let response = self.responder.accept_rotation(&InitSessionRequest {
                node_id: self.caller_id.clone(),
                public_key: public_key_pem.to_string(),
            })?;
            let ciphertext = BASE64
                .decode(&response.secret)
                .map_err(|e| RequestError::Response(e.to_string()))?;
            Ok(InitSessionReply {
                id: response.id,
                ciphertext,
            })
        }
    }

    /// Initiator for paths that must not rotate.
    struct NoRotation;

    #[async_trait]
    impl SessionInitiator for NoRotation {
        async fn init_session(
            &self,
            _public_key_pem: &str,
            _current: Option<&Token>,
        ) -> Result<InitSessionReply, RequestError> {
            panic!("rotation attempted on a non-rotating path");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rotation_then_verify() {
        let (a, b) = session_pair();
        let initiator = Loopback {
            responder: b.clone(),
            caller_id: "node-a".to_string(),
        };

        let credential = a
            .authorization_for_request(&initiator, SignedPayload::Bytes(b"hello"))
            .await
            .unwrap();

        // b received the rotation, so it can now verify a's request.
        b.verify_request(SignedPayload::Bytes(b"hello"), &credential)
            .unwrap();
        assert!(b
            .verify_request(SignedPayload::Bytes(b"tampered"), &credential)
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_second_request_reuses_token() {
        let (a, b) = session_pair();
        let initiator = Loopback {
            responder: b.clone(),
            caller_id: "node-a".to_string(),
        };
        a.authorization_for_request(&initiator, SignedPayload::Bytes(b"first"))
            .await
            .unwrap();
        let id_before = a.outbound_token_id().unwrap();

        // Fresh token, well under the rotation age: no new handshake.
        let credential = a
            .authorization_for_request(&NoRotation, SignedPayload::Bytes(b"second"))
            .await
            .unwrap();
        assert_eq!(a.outbound_token_id().unwrap(), id_before);
        b.verify_request(SignedPayload::Bytes(b"second"), &credential)
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_rotation_completes() {
        let (a, b) = session_pair();
        let to_b = Loopback {
            responder: b.clone(),
            caller_id: "node-a".to_string(),
        };
        let to_a = Loopback {
            responder: a.clone(),
            caller_id: "node-b".to_string(),
        };

        let both = tokio::join!(
            a.authorization_for_request(&to_b, SignedPayload::Bytes(b"a->b")),
            b.authorization_for_request(&to_a, SignedPayload::Bytes(b"b->a")),
        );
        let (cred_a, cred_b) = (both.0.unwrap(), both.1.unwrap());

        b.verify_request(SignedPayload::Bytes(b"a->b"), &cred_a).unwrap();
        a.verify_request(SignedPayload::Bytes(b"b->a"), &cred_b).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_response_path_bypasses_rotation() {
        let (a, b) = session_pair();
        let initiator = Loopback {
            responder: b.clone(),
            caller_id: "node-a".to_string(),
        };
        a.authorization_for_request(&initiator, SignedPayload::Bytes(b"warm-up"))
            .await
            .unwrap();

        // With a cached token the response path must not touch the network,
        // even if the token were due for rotation.
        let credential = a
            .authorization_for_response(&NoRotation, SignedPayload::Bytes(b"reply"))
            .await
            .unwrap();
        b.verify_request(SignedPayload::Bytes(b"reply"), &credential)
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invalidation_only_for_matching_id() {
        let (a, b) = session_pair();
        let initiator = Loopback {
            responder: b.clone(),
            caller_id: "node-a".to_string(),
        };
        a.authorization_for_request(&initiator, SignedPayload::Bytes(b"x"))
            .await
            .unwrap();
        let current = a.outbound_token_id().unwrap();

        a.invalidate_outbound("some-older-token-id");
        assert_eq!(a.outbound_token_id().unwrap(), current);

        a.invalidate_outbound(&current);
        assert!(a.outbound_token_id().is_none());
    }

    #[test]
    fn test_verify_without_inbound_fails() {
        let metrics = Arc::new(Metrics::new());
        let session = AuthSession::new(
            "node-a".to_string(),
            "node-b".to_string(),
            test_auth_config(),
            metrics,
        );
        assert!(session
            .verify_request(SignedPayload::Bytes(b"x"), "not-a-jwt")
            .is_err());
        assert!(session
            .verify_response(SignedPayload::Bytes(b"x"), None)
            .is_err());
    }
}
