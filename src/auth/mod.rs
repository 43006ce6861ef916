//! Authentication: capability tokens, identity exchange, and the user store.
//!
//! Two token shapes are minted over ES256 — short-lived instance tokens
//! that gate terminal attachment, and long-lived user tokens returned by
//! the identity exchange. Both carry the same claim struct, discriminated
//! by `typ`.

use serde::{Deserialize, Serialize};

pub mod github;
pub mod token;
pub mod users;

/// Discriminator for the two token shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived attach capability bound to one instance.
    Instance,
    /// Long-lived user credential from the identity exchange.
    User,
}

/// Signed claims carried by both token shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Token shape discriminator.
    pub typ: TokenType,
    /// Subject: user id for user tokens, instance id for instance tokens.
    pub sub: String,
    /// Issuer; must match the configured issuer on validation.
    pub iss: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Not-before, seconds since the epoch. Instance tokens only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Instance the token grants attachment to. Instance tokens only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Errors produced when minting or validating tokens.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token is not a structurally valid JWT.
    #[error("malformed token")]
    Malformed,

    /// The signature does not verify against the active key.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token has expired.
    #[error("token expired")]
    Expired,

    /// The token was signed with a non-ECDSA algorithm.
    #[error("unexpected signing algorithm")]
    WrongAlgorithm,

    /// The issuer claim does not match the configured issuer.
    #[error("unexpected token issuer")]
    WrongIssuer,

    /// Key material could not be generated, loaded, or encoded.
    #[error("key material error: {0}")]
    KeyMaterial(String),
}
