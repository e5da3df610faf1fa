//! Authentication errors.

use thiserror::Error;

/// Why a bearer credential was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Malformed, badly signed, or otherwise unusable token.
    #[error("invalid token: {0}")]
    Invalid(String),
    /// The token's `exp` is in the past.
    #[error("token expired")]
    Expired,
    /// A required claim is absent or empty.
    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),
}

impl AuthError {
    /// Short machine-readable label, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::Expired => "expired",
            Self::MissingClaim(_) => "missing_claim",
        }
    }
}
