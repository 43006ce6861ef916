//! External identity verification against the GitHub API.
//!
//! The auth exchange accepts a GitHub bearer token plus claimed identity
//! fields; the token is confirmed by asking GitHub who it belongs to and
//! comparing against the claim. Abstracted behind [`IdentityVerifier`] so
//! handler tests can inject a canned identity.

use async_trait::async_trait;
use serde::Deserialize;

/// Default GitHub API base URL.
const GITHUB_API_BASE: &str = "https://api.github.com";

/// GitHub requires a User-Agent on all API calls.
const USER_AGENT: &str = concat!("orzbob-control-plane/", env!("CARGO_PKG_VERSION"));

/// Identity fields confirmed by the external provider.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubIdentity {
    /// Numeric GitHub user id.
    pub id: u64,
    /// GitHub login handle.
    pub login: String,
    /// Public email, when set on the account.
    pub email: Option<String>,
}

/// Errors produced during identity verification.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The presented token was rejected by the provider.
    #[error("identity token rejected")]
    Unauthorized,

    /// Transport or protocol failure talking to the provider.
    #[error("identity provider error: {0}")]
    Http(String),
}

/// Confirms that a bearer token belongs to a claimed identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve the identity the token belongs to.
    async fn verify(&self, token: &str) -> Result<GitHubIdentity, IdentityError>;
}

/// GitHub-backed identity verifier.
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
}

impl GitHubClient {
    /// Create a client against the public GitHub API.
    pub fn new() -> Self {
        Self::with_base_url(GITHUB_API_BASE.to_owned())
    }

    /// Create a client against a custom base URL (tests).
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityVerifier for GitHubClient {
    async fn verify(&self, token: &str) -> Result<GitHubIdentity, IdentityError> {
        let response = self
            .client
            .get(format!("{}/user", self.base_url))
            .bearer_auth(token)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(IdentityError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(IdentityError::Http(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        response
            .json::<GitHubIdentity>()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))
    }
}
