//! Short-lived connection tokens
//!
//! A successful join pre-check is the only way to obtain one. The real-time
//! channel refuses admission without a valid token for the same session, so
//! a token carries everything admission needs: who, in which role, and the
//! tier observed when access was granted.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{ConnectionRole, ViewerIdentity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClaims {
    /// Session the token admits to
    pub sid: Uuid,
    pub identity: ViewerIdentity,
    pub role: ConnectionRole,
    pub tier: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct ConnectionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl ConnectionTokens {
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub fn issue(
        &self,
        session_id: Uuid,
        identity: &ViewerIdentity,
        role: ConnectionRole,
        tier: Option<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = ConnectionClaims {
            sid: session_id,
            identity: identity.clone(),
            role,
            tier,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("failed to sign connection token: {e}")))
    }

    /// Validate signature, expiry and session binding
    pub fn verify(&self, token: &str, session_id: Uuid) -> Result<ConnectionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        let data = decode::<ConnectionClaims>(token, &self.decoding, &validation)?;
        if data.claims.sid != session_id {
            return Err(AppError::NotAuthorized(
                "connection token was issued for another session".to_string(),
            ));
        }
        Ok(data.claims)
    }
}
