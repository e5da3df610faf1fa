//! # sozvon-auth
//!
//! Maps an opaque bearer credential to an [`Identity`](sozvon_core::Identity).
//!
//! Both the relay and the gateway hold an `Arc<dyn IdentityProvider>` and
//! call it before upgrading a socket. The shipped implementation,
//! [`JwtIdentityProvider`], validates HMAC-signed JWTs whose `login` claim
//! carries the identity.

#![deny(unsafe_code)]

pub mod errors;
pub mod jwt;

pub use errors::AuthError;
pub use jwt::{Claims, ISSUER, JwtIdentityProvider};

use sozvon_core::Identity;

/// Validates bearer credentials.
pub trait IdentityProvider: Send + Sync {
    /// Resolve a token to the identity it was issued for.
    fn validate_token(&self, token: &str) -> Result<Identity, AuthError>;
}
