// src/core/token/mod.rs

//! Validation of the short-lived signed tokens the panel issues for
//! websocket sessions and one-time download/upload URLs. Tokens are JWTs
//! signed with HMAC-SHA256 using the node's shared secret.

use crate::core::errors::TokenError;
use crate::core::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Permission strings carried in token claims.
pub mod permission {
    pub const CONNECT: &str = "websocket.connect";
    pub const SEND_COMMAND: &str = "control.console";
    pub const POWER_START: &str = "control.start";
    pub const POWER_STOP: &str = "control.stop";
    pub const POWER_RESTART: &str = "control.restart";
    pub const BACKUP_READ: &str = "backup.read";

    /// Admin permissions are never granted by the `*` wildcard.
    pub const ADMIN_ERRORS: &str = "admin.websocket.errors";
    pub const ADMIN_INSTALL: &str = "admin.websocket.install";
    pub const ADMIN_TRANSFER: &str = "admin.websocket.transfer";
}

/// How long a consumed one-time nonce is remembered. Anything older than
/// the longest token lifetime the panel issues is safe to forget.
const NONCE_TTL: Duration = Duration::from_secs(15 * 60);

/// The payload of a panel-signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub iss: String,
    /// The server UUID this token is scoped to.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Present on one-time tokens (downloads, uploads).
    #[serde(default)]
    pub nonce: String,
    /// Present on file-download tokens.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Present on backup-download tokens.
    #[serde(default)]
    pub backup_uuid: Option<Uuid>,
}

impl Claims {
    /// Checks a permission, honoring the `*` wildcard for everything
    /// except admin permissions, which must always be explicit.
    pub fn has_permission(&self, perm: &str) -> bool {
        if perm.starts_with("admin.") {
            self.permissions.iter().any(|p| p == perm)
        } else {
            self.permissions.iter().any(|p| p == perm || p == "*")
        }
    }

    pub fn server_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// Verifies panel-signed tokens and tracks revocations.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    /// Tokens issued before the agent booted are stale by definition.
    boot_time: i64,
    /// JTIs revoked by the panel, with the time of revocation so the
    /// purger can eventually drop them.
    jti_denylist: DashMap<String, Instant>,
    /// One-time nonces already consumed.
    nonces: Mutex<HashMap<String, Instant>>,
}

impl TokenValidator {
    pub fn new(secret: &str, boot_time: DateTime<Utc>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub", "iat"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            boot_time: boot_time.timestamp(),
            jti_denylist: DashMap::new(),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Validates a token: signature, expiry, issue time, and revocation.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.decode(token)?;
        if !claims.jti.is_empty() && self.jti_denylist.contains_key(&claims.jti) {
            metrics::TOKENS_REJECTED_TOTAL.inc();
            return Err(TokenError::Denylisted);
        }
        Ok(claims)
    }

    /// Validates a one-time token, atomically consuming its nonce. The
    /// second sighting of the same nonce fails even when the two arrive
    /// concurrently.
    pub fn validate_one_time(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.validate(token)?;
        if claims.nonce.is_empty() {
            return Err(TokenError::MissingField("nonce"));
        }

        let mut nonces = self.nonces.lock();
        if nonces.contains_key(&claims.nonce) {
            metrics::TOKENS_REJECTED_TOTAL.inc();
            return Err(TokenError::NonceSeen);
        }
        nonces.insert(claims.nonce.clone(), Instant::now());
        Ok(claims)
    }

    fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |err| {
                metrics::TOKENS_REJECTED_TOTAL.inc();
                match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        TokenError::InvalidSignature
                    }
                    _ => TokenError::Malformed,
                }
            },
        )?;

        if data.claims.iat < self.boot_time {
            metrics::TOKENS_REJECTED_TOTAL.inc();
            return Err(TokenError::IssuedBeforeBoot);
        }
        Ok(data.claims)
    }

    /// Revokes a set of JTIs (panel-initiated, e.g. `POST .../ws/deny`).
    pub fn deny_jtis(&self, jtis: &[String]) {
        let now = Instant::now();
        for jti in jtis {
            self.jti_denylist.insert(jti.clone(), now);
        }
    }

    pub fn is_denied(&self, jti: &str) -> bool {
        self.jti_denylist.contains_key(jti)
    }

    /// Drops consumed nonces past their TTL and revocations old enough
    /// that any matching token has long expired.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.nonces
            .lock()
            .retain(|_, seen| now.duration_since(*seen) < NONCE_TTL);
        self.jti_denylist
            .retain(|_, revoked| now.duration_since(*revoked) < NONCE_TTL * 4);
    }
}
