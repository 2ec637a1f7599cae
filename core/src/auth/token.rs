//! Signed, time-boxed bearer credentials.
//!
//! A `Token` is a signing key plus identity; the credentials minted from it
//! are per-request JWTs bound to a payload digest and an audience. Tokens are
//! not session identity — the session (see `session.rs`) is the long-lived
//! pairing, tokens are what it signs with.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

use crate::codec::Packet;
use crate::error::AuthError;

/// Token id used by the shared cluster bootstrap secret.
pub const CLUSTER_TOKEN_ID: &str = "cluster";

const SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Token {
    pub id: String,
    pub secret: Vec<u8>,
    pub stamp: SystemTime,
}

impl Token {
    /// Fresh random token for a session rotation.
    pub fn generate() -> Token {
        let mut secret = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Token {
            id: Uuid::new_v4().to_string(),
            secret,
            stamp: SystemTime::now(),
        }
    }

    /// The cluster-wide bootstrap token. Never rotates; only acceptable on
    /// the bootstrap endpoints.
    pub fn cluster(secret: &str) -> Token {
        Token {
            id: CLUSTER_TOKEN_ID.to_string(),
            secret: secret.as_bytes().to_vec(),
            stamp: SystemTime::now(),
        }
    }

    pub fn from_parts(id: String, secret: Vec<u8>) -> Token {
        Token {
            id,
            secret,
            stamp: SystemTime::now(),
        }
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.stamp)
            .unwrap_or_default()
    }

    /// Mint a signed credential over `payload`, addressed to `audience`.
    pub fn sign(
        &self,
        issuer: &str,
        audience: &str,
        payload: SignedPayload<'_>,
        validity_window: Duration,
        early_validity: Duration,
    ) -> Result<String, AuthError> {
        let now = unix_now();
        let claims = Claims {
            iss: issuer.to_string(),
            iat: now,
            nbf: now.saturating_sub(early_validity.as_secs()),
            exp: now + validity_window.as_secs(),
            aud: audience.to_string(),
            sub: self.id.clone(),
            dig: payload.digest(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|_| AuthError)
    }

    /// Verify a credential against this token's secret, our node id, and the
    /// payload it claims to cover. Every failure collapses to the same
    /// generic error.
    pub fn verify(
        &self,
        local_id: &str,
        payload: SignedPayload<'_>,
        credential: &str,
    ) -> Result<(), AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[local_id]);
        validation.validate_nbf = true;
        let decoded = jsonwebtoken::decode::<Claims>(
            credential,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|_| AuthError)?;
        if decoded.claims.sub != self.id {
            return Err(AuthError);
        }
        if decoded.claims.dig != payload.digest() {
            return Err(AuthError);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: u64,
    nbf: u64,
    exp: u64,
    aud: String,
    sub: String,
    /// Tagged digest of the signed payload.
    dig: String,
}

/// What a credential is bound to. Packets already carry a content digest, so
/// signing one reuses it instead of hashing the payload again; the tag keeps
/// the two schemes from being confused for one another.
#[derive(Debug, Clone, Copy)]
pub enum SignedPayload<'a> {
    Packet(&'a Packet),
    Bytes(&'a [u8]),
}

impl SignedPayload<'_> {
    fn digest(&self) -> String {
        match self {
            SignedPayload::Packet(packet) => format!("pkt:{}", hex::encode(packet.digest())),
            SignedPayload::Bytes(bytes) => {
                format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
