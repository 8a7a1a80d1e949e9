use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pilotctl_types::{now, AuthToken, Principal, Timestamp};
use tracing::{debug, warn};

use crate::config::TOKEN_TTL_SECS;
use crate::error::ServiceError;
use crate::routes::ServiceContext;
use crate::storage::PilotStore;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication token is required and not provided")]
    Missing,
    #[error("malformed authentication token: {0}")]
    Malformed(String),
    #[error("authentication failed for host '{0}': token has expired")]
    Expired(String),
    #[error("authentication failed for host '{0}': host has not been admitted to service")]
    NotAdmitted(String),
    #[error("authentication failed for host '{host_uuid}': cannot check admission: {reason}")]
    StoreUnavailable { host_uuid: String, reason: String },
}

/// Decode a pilot token.
///
/// The token is the base64 encoding of `uuid|ip|hostname|issued_at`,
/// written back to front.
pub fn decode_token(token: &str) -> Result<AuthToken, AuthError> {
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    let reversed: String = token.chars().rev().collect();
    let bytes = STANDARD
        .decode(reversed)
        .map_err(|e| AuthError::Malformed(format!("cannot decode: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| AuthError::Malformed("decoded token is not utf-8".into()))?;

    let parts: Vec<&str> = text.split('|').collect();
    let [host_uuid, host_ip, hostname, issued_at] = parts.as_slice() else {
        return Err(AuthError::Malformed(format!(
            "expected 4 fields, found {}",
            parts.len()
        )));
    };
    let issued_at = issued_at
        .parse::<Timestamp>()
        .map_err(|e| AuthError::Malformed(format!("invalid timestamp: {e}")))?;

    Ok(AuthToken {
        host_uuid: host_uuid.to_string(),
        host_ip: host_ip.to_string(),
        hostname: hostname.to_string(),
        issued_at,
    })
}

/// Inverse of [`decode_token`], as a pilot builds it.
pub fn encode_token(token: &AuthToken) -> String {
    let plain = format!(
        "{}|{}|{}|{}",
        token.host_uuid, token.host_ip, token.hostname, token.issued_at
    );
    STANDARD.encode(plain).chars().rev().collect()
}

/// A pilot whose token has been accepted.
#[derive(Clone, Debug)]
pub struct AuthenticatedPilot {
    pub principal: Principal,
    pub token: AuthToken,
}

/// Turns bearer tokens into principals.
///
/// Tokens carry no integrity tag, so anyone who knows the encoding can mint
/// one for any host. Freshness and admission are the only checks.
#[derive(Clone)]
pub struct TokenAuthenticator {
    store: Arc<dyn PilotStore>,
    ttl_secs: i64,
}

impl TokenAuthenticator {
    pub fn new(store: Arc<dyn PilotStore>) -> Self {
        Self {
            store,
            ttl_secs: TOKEN_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedPilot, AuthError> {
        self.authenticate_at(token, now()).await
    }

    /// Authenticate as of `now`.
    ///
    /// Tokens dated in the future are accepted.
    pub async fn authenticate_at(
        &self,
        token: &str,
        now: Timestamp,
    ) -> Result<AuthenticatedPilot, AuthError> {
        let token = decode_token(token).inspect_err(|e| warn!(error = %e, "rejected token"))?;

        if token.age(now) >= self.ttl_secs {
            warn!(
                host = %token.host_uuid,
                ip = %token.host_ip,
                hostname = %token.hostname,
                age = token.age(now),
                "rejected expired token"
            );
            return Err(AuthError::Expired(token.host_uuid));
        }

        let admitted = self
            .store
            .is_admitted(&token.host_uuid)
            .await
            .map_err(|e| AuthError::StoreUnavailable {
                host_uuid: token.host_uuid.clone(),
                reason: e.to_string(),
            })?;
        if !admitted {
            warn!(
                host = %token.host_uuid,
                ip = %token.host_ip,
                hostname = %token.hostname,
                "rejected host not admitted"
            );
            return Err(AuthError::NotAdmitted(token.host_uuid));
        }

        debug!(host = %token.host_uuid, "pilot authenticated");
        Ok(AuthenticatedPilot {
            principal: Principal::pilot(token.host_uuid.as_str()),
            token,
        })
    }
}

impl FromRequestParts<Arc<ServiceContext>> for AuthenticatedPilot {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ServiceContext>,
    ) -> Result<Self, Self::Rejection> {
        let token = match parts.headers.get(AUTHORIZATION) {
            Some(value) => value
                .to_str()
                .map_err(|_| AuthError::Malformed("authorization header is not text".into()))?,
            None => "",
        };
        Ok(state.authenticator.authenticate(token).await?)
    }
}
