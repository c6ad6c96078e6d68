//! Identity credentials presented at the signaling handshake and on REST calls

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::{config::AuthConfig, Error, Result};

/// Verified identity behind a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable account identifier (`sub` claim)
    pub subject: String,
    /// Identifies one login of `subject`; the broadcaster seat is keyed on it
    pub session: String,
}

/// Verifies a bearer credential and yields the identity behind it
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity>;
}

/// Token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Session identifier; falls back to a digest of the token when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 verifier over a shared secret
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    issuer: Option<String>,
    default_ttl: Duration,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.issuer)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &[u8], issuer: Option<String>, default_ttl: Duration) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            issuer,
            default_ttl,
        }
    }

    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            config.issuer.clone(),
            Duration::from_secs(config.token_ttl_seconds),
        )
    }

    /// Mint a token for `subject`
    ///
    /// Used by the `token` subcommand and by tests; production deployments
    /// usually mint tokens in their own account service with the same secret.
    pub fn issue(&self, subject: &str, session: Option<&str>, ttl: Option<Duration>) -> Result<String> {
        let now = Utc::now().timestamp();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| Error::InvalidInput("token lifetime too large".to_string()))?;

        let claims = Claims {
            sub: subject.to_string(),
            sid: session.map(str::to_string),
            iss: self.issuer.clone(),
            iat: now,
            exp: now.saturating_add(ttl_secs),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    fn decode_claims(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 30;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());
        validation.required_spec_claims.insert("sub".to_string());
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        Ok(decode::<Claims>(token, &self.decoding_key, &validation)?.claims)
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity> {
        let token = strip_bearer(token);
        if token.is_empty() {
            return Err(Error::Authentication("missing token".to_string()));
        }

        let claims = self.decode_claims(token)?;
        if claims.sub.is_empty() {
            return Err(Error::Authentication("token has no subject".to_string()));
        }

        let session = claims
            .sid
            .filter(|sid| !sid.is_empty())
            .unwrap_or_else(|| hex::encode(Sha256::digest(token.as_bytes())));

        Ok(Identity {
            subject: claims.sub,
            session,
        })
    }
}

/// Accept both `Bearer <token>` and a raw token
#[must_use]
pub fn strip_bearer(token: &str) -> &str {
    let token = token.trim();
    token
        .strip_prefix("Bearer ")
        .or_else(|| token.strip_prefix("bearer "))
        .map_or(token, str::trim)
}
