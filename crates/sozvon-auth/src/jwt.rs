//! HS256 JWT validation.
//!
//! Tokens are issued by the auth service and shared across services through
//! a common HMAC secret. Only the `login` claim is load-bearing here.

use std::fmt;

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sozvon_core::Identity;
use tracing::debug;

use crate::IdentityProvider;
use crate::errors::AuthError;

/// Issuer stamped into tokens minted by [`JwtIdentityProvider::issue`].
pub const ISSUER: &str = "sozvon-auth";

/// Token claims.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User login; the routing identity.
    #[serde(default)]
    pub login: String,
    /// Optional user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued-at, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Not-before, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Subject, conventionally equal to `login`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

/// [`IdentityProvider`] backed by an HMAC secret.
pub struct JwtIdentityProvider {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtIdentityProvider")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl JwtIdentityProvider {
    /// Build a provider from the shared secret.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mint a token for `login` valid for `ttl`.
    ///
    /// Used by tests and local tooling; production tokens come from the
    /// auth service.
    pub fn issue(&self, login: &str, ttl: Duration) -> Result<String, AuthError> {
        if login.is_empty() {
            return Err(AuthError::MissingClaim("login"));
        }
        let now = Utc::now();
        let claims = Claims {
            login: login.to_string(),
            user_id: None,
            exp: (now + ttl).timestamp(),
            iat: Some(now.timestamp()),
            nbf: Some(now.timestamp()),
            iss: Some(ISSUER.to_string()),
            sub: Some(login.to_string()),
        };
        self.encode(&claims)
    }

    /// Sign arbitrary claims with HS256.
    pub fn encode(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }

    /// Decode and verify a token, returning its claims.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        if data.claims.login.is_empty() {
            return Err(AuthError::MissingClaim("login"));
        }
        Ok(data.claims)
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn validate_token(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Invalid("empty token".into()));
        }
        match self.decode(token) {
            Ok(claims) => Ok(Identity::new(claims.login)),
            Err(e) => {
                debug!(kind = e.kind(), error = %e, "token rejected");
                Err(e)
            }
        }
    }
}
