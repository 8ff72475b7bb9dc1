//! Session identifiers and the codec that authenticates them.
//!
//! A [`SessionId`] pairs a public circuit id (safe to log) with a secret the
//! client presents when it reconnects. The secret is an HS256-signed token
//! whose claims carry the circuit id and a random nonce, so a secret binds to
//! exactly one id and any modification is detected on parse.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tether_core::logging::REDACTED;
use tether_core::{CircuitId, RedactionPolicy};
use tracing::debug;

use crate::error::{CircuitError, Result};

/// Longest secret accepted by [`SessionIdCodec::try_parse`].
pub const MAX_SECRET_LEN: usize = 1024;

const ID_BYTES: usize = 32;
const NONCE_BYTES: usize = 16;
const KEY_BYTES: usize = 32;

/// Public id plus reconnection secret for one circuit.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionId {
    id: CircuitId,
    secret: String,
}

impl SessionId {
    /// The loggable circuit id.
    pub fn id(&self) -> &CircuitId {
        &self.id
    }

    /// The reconnection secret. Never log this directly.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionId")
            .field("id", &self.id)
            .field("secret", &REDACTED)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    cid: String,
    nonce: String,
}

/// Mints and verifies [`SessionId`]s.
pub struct SessionIdCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    redaction: RedactionPolicy,
}

impl SessionIdCodec {
    /// Codec with a fresh random signing key for this process.
    pub fn new(redaction: RedactionPolicy) -> Self {
        let mut key = [0u8; KEY_BYTES];
        rand::rng().fill(&mut key);
        Self::with_key(&key, redaction)
    }

    /// Codec with an explicit signing key, for sharing secrets across processes.
    pub fn with_key(key: &[u8], redaction: RedactionPolicy) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            redaction,
        }
    }

    /// Policy applied to secrets in rejection logs.
    pub fn redaction(&self) -> RedactionPolicy {
        self.redaction
    }

    /// Generate a new random id and its signed secret.
    pub fn generate(&self) -> Result<SessionId> {
        let mut id = [0u8; ID_BYTES];
        let mut nonce = [0u8; NONCE_BYTES];
        let mut rng = rand::rng();
        rng.fill(&mut id);
        rng.fill(&mut nonce);

        let claims = SessionClaims {
            cid: URL_SAFE_NO_PAD.encode(id),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
        };
        let secret = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CircuitError::Internal(format!("failed to sign session id: {e}")))?;

        Ok(SessionId {
            id: CircuitId::from_string(claims.cid),
            secret,
        })
    }

    /// Verify a secret presented by a client.
    ///
    /// Returns `None` for empty, oversized, malformed, or tampered input.
    pub fn try_parse(&self, secret: &str) -> Option<SessionId> {
        if secret.is_empty() || secret.len() > MAX_SECRET_LEN {
            debug!(len = secret.len(), "rejected session secret with invalid length");
            return None;
        }

        match jsonwebtoken::decode::<SessionClaims>(secret, &self.decoding, &self.validation) {
            Ok(data) if is_valid_id(&data.claims.cid) => Some(SessionId {
                id: CircuitId::from_string(data.claims.cid),
                secret: secret.to_owned(),
            }),
            Ok(_) => {
                debug!(
                    token = %self.redaction.secret(secret),
                    "rejected session secret with malformed circuit id"
                );
                None
            }
            Err(e) => {
                debug!(
                    token = %self.redaction.secret(secret),
                    error = %e,
                    "rejected session secret"
                );
                None
            }
        }
    }
}

fn is_valid_id(cid: &str) -> bool {
    URL_SAFE_NO_PAD
        .decode(cid)
        .is_ok_and(|bytes| bytes.len() == ID_BYTES)
}
