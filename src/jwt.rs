//! Short-lived admin assertions.
//!
//! The portal authenticates itself to the identity API with an HS256 JWT
//! carrying the `admin` role that is valid for one minute. Nothing here does
//! I/O; the only inputs are the shared secret and the clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::token::AdminToken;

/// Validity window of a minted admin assertion, in seconds.
pub const ADMIN_TOKEN_TTL_SECS: i64 = 60;

/// Role claim carried by every admin assertion.
pub const ADMIN_ROLE: &str = "admin";

/// Subject claim identifying this service.
pub const PORTAL_SUBJECT: &str = "ssh-portal";

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Claims of an admin assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminClaims {
    pub role: String,
    pub iat: i64,
    pub exp: i64,
    pub sub: String,
}

impl AdminClaims {
    fn issued_at(now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            role: ADMIN_ROLE.to_string(),
            iat,
            exp: (now + Duration::seconds(ADMIN_TOKEN_TTL_SECS)).timestamp(),
            sub: PORTAL_SUBJECT.to_string(),
        }
    }

    /// True while `at` is strictly before the expiry.
    #[cfg(test)]
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at.timestamp() < self.exp
    }
}

/// Signs admin assertions with the shared JWT secret.
pub struct AdminTokenMinter {
    key: EncodingKey,
    clock: Arc<dyn Clock>,
}

impl AdminTokenMinter {
    /// Build a minter on the wall clock and prove the secret can sign.
    ///
    /// Called once at startup so a bad secret stops the process instead of
    /// failing every session.
    pub fn new(secret: &str) -> Result<Self, ConfigError> {
        Self::with_clock(secret, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &str, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::Missing("JWTSECRET"));
        }
        let minter = Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            clock,
        };
        minter.mint()?;
        Ok(minter)
    }

    /// Mint a fresh assertion valid for [`ADMIN_TOKEN_TTL_SECS`].
    pub fn mint(&self) -> Result<AdminToken, jsonwebtoken::errors::Error> {
        let claims = AdminClaims::issued_at(self.clock.now());
        let raw = encode(&Header::default(), &claims, &self.key)?;
        Ok(AdminToken::new(raw))
    }
}
