//! Capability tokens for collaborator invites.
//!
//! A token is `op1.<payload>.<signature>`: the payload is base64url JSON
//! `{v, pid, role, exp}` and the signature is HMAC-SHA256 over the encoded
//! payload segment. Tokens carry no identity beyond the fixed `admin` role
//! and are not revocable; a leaked token stays valid until it expires.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Leading segment of every token
pub const TOKEN_VERSION_TAG: &str = "op1";

/// Payload schema version
pub const PAYLOAD_VERSION: u64 = 1;

/// The only role tokens are issued for
pub const ADMIN_ROLE: &str = "admin";

/// Default lifetime of an invite: seven days
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Errors that can occur during token operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed token")]
    Malformed,

    #[error("Unknown token version: {0}")]
    UnknownVersion(String),

    #[error("Signature mismatch")]
    BadSignature,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported payload version: {0}")]
    UnsupportedPayloadVersion(u64),

    #[error("Token has no project")]
    MissingProject,

    #[error("Unsupported role: {0}")]
    UnsupportedRole(String),

    #[error("Token expired")]
    Expired,
}

/// Signed body of a token
#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    v: u64,
    pid: String,
    role: String,
    exp: i64,
}

/// Verified contents of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub project_id: String,
    pub role: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Stateless signer and verifier for capability tokens
pub struct TokenCodec {
    secret: Vec<u8>,
    /// Lifetime of invites in seconds
    ttl_seconds: u64,
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_seconds: u64) -> Result<Self, TokenError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(TokenError::InvalidConfig("secret is empty".to_string()));
        }
        Ok(Self { secret, ttl_seconds })
    }

    /// Codec with a fresh 32-byte secret. Its tokens die with the process.
    pub fn with_random_secret(ttl_seconds: u64) -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret, ttl_seconds }
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| TokenError::InvalidConfig(e.to_string()))
    }

    /// Admin token for a project with the configured lifetime
    pub fn issue_invite(&self, project_id: &str) -> Result<String, TokenError> {
        self.issue(project_id, ADMIN_ROLE, self.ttl_seconds)
    }

    pub fn issue(&self, project_id: &str, role: &str, ttl_seconds: u64) -> Result<String, TokenError> {
        self.issue_at(project_id, role, ttl_seconds, now_seconds())
    }

    pub fn issue_at(&self, project_id: &str, role: &str, ttl_seconds: u64, now: i64) -> Result<String, TokenError> {
        if project_id.is_empty() {
            return Err(TokenError::MissingProject);
        }

        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let payload = TokenPayload {
            v: PAYLOAD_VERSION,
            pid: project_id.to_string(),
            role: role.to_string(),
            exp: now.saturating_add(ttl),
        };
        let json = serde_json::to_vec(&payload).map_err(|e| TokenError::InvalidPayload(e.to_string()))?;
        let payload_segment = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(payload_segment.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}.{}", TOKEN_VERSION_TAG, payload_segment, signature))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, now_seconds())
    }

    /// Check signature, payload and expiry as of `now` (unix seconds)
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims, TokenError> {
        let parts: Vec<&str> = token.split('.').collect();
        let [tag, payload_segment, signature_segment] = parts.as_slice() else {
            return Err(TokenError::Malformed);
        };

        if *tag != TOKEN_VERSION_TAG {
            return Err(TokenError::UnknownVersion(tag.to_string()));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| TokenError::BadSignature)?;
        let mut mac = self.mac()?;
        mac.update(payload_segment.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&signature).map_err(|_| TokenError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload_segment)
            .map_err(|e| TokenError::InvalidPayload(e.to_string()))?;
        let payload: TokenPayload =
            serde_json::from_slice(&json).map_err(|e| TokenError::InvalidPayload(e.to_string()))?;

        if payload.v != PAYLOAD_VERSION {
            return Err(TokenError::UnsupportedPayloadVersion(payload.v));
        }
        if payload.pid.is_empty() {
            return Err(TokenError::MissingProject);
        }
        if payload.role != ADMIN_ROLE {
            return Err(TokenError::UnsupportedRole(payload.role));
        }
        if payload.exp < now {
            return Err(TokenError::Expired);
        }

        Ok(TokenClaims {
            project_id: payload.pid,
            role: payload.role,
            expires_at: payload.exp,
        })
    }
}

fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}
