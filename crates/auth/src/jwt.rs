//! Signed tokens for the operator/admin surfaces.
//!
//! Access and refresh tokens are HS256 JWTs with distinct secrets and
//! lifetimes (15 minutes vs 7 days by default). Secrets shorter than 32
//! bytes are refused at construction. Refresh tokens can be revoked
//! independently: the SHA-256/base64url hash of the token is stored in a
//! rotation set and checked on every refresh verification.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::permission::Role;
use crate::principal::Principal;

/// Minimum secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Default access-token lifetime.
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);

/// Default refresh-token lifetime.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,

    #[error("token rejected: {0}")]
    Invalid(String),

    #[error("refresh token revoked")]
    Revoked,
}

/// Standard claims plus the gateway's custom claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,

    pub email: String,
    pub role: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_projects: Vec<String>,
    #[serde(default)]
    pub admin: bool,
}

/// Settings for the token service.
#[derive(Clone, Debug)]
pub struct TokenConfig {
    pub issuer: String,
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl TokenConfig {
    pub fn new(
        issuer: impl Into<String>,
        access_secret: impl Into<String>,
        refresh_secret: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

/// Issues and validates access/refresh tokens.
#[derive(Debug)]
pub struct TokenService {
    config: TokenConfig,
    /// SHA-256/base64url hashes of revoked refresh tokens.
    revoked: Mutex<HashSet<String>>,
}

impl TokenService {
    /// Refuses secrets shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn new(config: TokenConfig) -> Result<Self, TokenError> {
        if config.access_secret.len() < MIN_SECRET_LEN
            || config.refresh_secret.len() < MIN_SECRET_LEN
        {
            return Err(TokenError::WeakSecret);
        }
        Ok(Self {
            config,
            revoked: Mutex::new(HashSet::new()),
        })
    }

    /// Mint an access token for a principal.
    pub fn issue_access(&self, principal: &Principal) -> Result<String, TokenError> {
        self.issue(principal, self.config.access_ttl, &self.config.access_secret)
    }

    /// Mint a refresh token for a principal.
    pub fn issue_refresh(&self, principal: &Principal) -> Result<String, TokenError> {
        self.issue(principal, self.config.refresh_ttl, &self.config.refresh_secret)
    }

    fn issue(
        &self,
        principal: &Principal,
        ttl: Duration,
        secret: &str,
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: self.config.issuer.clone(),
            sub: principal.user_id.clone(),
            iat: now,
            nbf: now,
            exp: now + ttl.as_secs() as i64,
            email: principal.email.clone(),
            role: principal.role.to_string(),
            workspace_id: principal.workspace_id.clone(),
            project_id: principal.project_id.clone(),
            allowed_projects: principal.allowed_projects.clone(),
            admin: principal.admin_override,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| TokenError::Invalid(e.to_string()))
    }

    /// Validate an access token: signature, issuer, nbf, exp.
    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify(token, &self.config.access_secret)
    }

    /// Validate a refresh token, including the revocation set.
    pub fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.verify(token, &self.config.refresh_secret)?;
        let revoked = self.revoked.lock().unwrap_or_else(|e| e.into_inner());
        if revoked.contains(&token_hash(token)) {
            return Err(TokenError::Revoked);
        }
        Ok(claims)
    }

    fn verify(&self, token: &str, secret: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.validate_nbf = true;
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| TokenError::Invalid(e.to_string()))
    }

    /// Add a refresh token's hash to the rotation set.
    pub fn revoke_refresh(&self, token: &str) {
        let mut revoked = self.revoked.lock().unwrap_or_else(|e| e.into_inner());
        revoked.insert(token_hash(token));
    }

    /// Rebuild a principal from validated claims.
    pub fn principal_from_claims(claims: &Claims) -> Result<Principal, TokenError> {
        let role = Role::parse(&claims.role)
            .ok_or_else(|| TokenError::Invalid(format!("unknown role '{}'", claims.role)))?;
        let mut principal = Principal::new(
            claims.sub.clone(),
            claims.email.clone(),
            role,
            claims.workspace_id.clone(),
        )
        .with_allowed_projects(claims.allowed_projects.clone());
        principal.project_id = claims.project_id.clone();
        if claims.admin {
            principal = principal.with_admin_override();
        }
        Ok(principal)
    }
}

/// SHA-256, base64url without padding.
fn token_hash(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}
