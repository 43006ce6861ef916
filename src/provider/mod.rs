//! Sandbox provider abstractions and implementations.
//!
//! Defines the [`Provider`] trait and the shared instance/secret types used
//! by all provider implementations.
//!
//! Two providers are implemented:
//! - [`fake::FakeProvider`] — in-memory maps, for tests and local runs
//! - [`docker::DockerProvider`] — one Docker container per sandbox
//!
//! The tier label is opaque at this layer; the API layer validates it
//! against the supported set before a request reaches a provider.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod docker;
pub mod fake;

/// Label key carrying the owning organization id on every instance.
pub const ORG_LABEL: &str = "orzbob.io/org-id";

/// Provider implementation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// In-memory fake provider.
    Fake,
    /// Docker-backed sandbox provider.
    Docker,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fake => f.write_str("fake"),
            Self::Docker => f.write_str("docker"),
        }
    }
}

/// Provider-reported lifecycle label for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Requested but not yet running.
    Pending,
    /// Sandbox is live and attachable.
    Running,
    /// Deletion in progress.
    Terminating,
    /// Provider-side failure.
    Failed,
}

/// Identity of a running sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Opaque globally unique id, generated at create time.
    pub id: String,
    /// Resource tier label. Opaque to the provider.
    pub tier: String,
    /// Provider-reported lifecycle status.
    pub status: InstanceStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Names of secrets mounted as environment variables.
    pub secret_names: Vec<String>,
    /// Free-form labels. Carries at least the owning org id.
    pub labels: HashMap<String, String>,
    /// Provider-internal handle (container id for Docker). Not serialized
    /// to API clients.
    #[serde(skip)]
    pub handle: Option<String>,
}

impl Instance {
    /// The owning org id, when labeled.
    pub fn org_id(&self) -> Option<&str> {
        self.labels.get(ORG_LABEL).map(String::as_str)
    }
}

/// Opaque named bag of string-valued entries mounted as environment
/// variables into future instances. Immutable between create and delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// Name, unique within the provider namespace.
    pub name: String,
    /// Provider namespace the secret lives in.
    pub namespace: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Entry mapping. Values never appear in logs or list responses.
    #[serde(skip_serializing)]
    pub data: HashMap<String, String>,
}

impl Secret {
    /// Sorted entry keys, for list/get responses that must not leak values.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Request to materialize a new sandbox.
#[derive(Debug, Clone, Default)]
pub struct InstanceSpec {
    /// Resource tier label.
    pub tier: String,
    /// Secrets to resolve into environment variables.
    pub secret_names: Vec<String>,
    /// Initial labels.
    pub labels: HashMap<String, String>,
}

/// Errors produced by provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The referenced instance does not exist.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The referenced secret does not exist.
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// A secret with this name already exists.
    #[error("secret already exists: {0}")]
    SecretExists(String),

    /// The backing infrastructure rejected or failed the request.
    #[error("provider infrastructure error: {0}")]
    Infrastructure(String),
}

impl ProviderError {
    /// Returns `true` for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound(_) | Self::SecretNotFound(_))
    }
}

/// Polymorphic CRUD over sandbox instances and opaque secret objects.
///
/// Contract shared by all implementations: `get`/`delete` on a missing id
/// fail with the not-found variant; create with an unknown tier is accepted
/// (the tier label is opaque here and validated by the API layer).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Materialize a new sandbox. Secrets named in the spec are resolved
    /// into environment variables; missing secrets fail the create.
    async fn create_instance(&self, spec: InstanceSpec) -> Result<Instance, ProviderError>;

    /// Fetch one instance by id.
    async fn get_instance(&self, id: &str) -> Result<Instance, ProviderError>;

    /// List all instances.
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError>;

    /// Delete one instance by id.
    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError>;

    /// Set one label on an existing instance.
    async fn label_instance(
        &self,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ProviderError>;

    /// Create a named secret. Fails when the name is taken.
    async fn create_secret(
        &self,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<Secret, ProviderError>;

    /// Fetch one secret by name.
    async fn get_secret(&self, name: &str) -> Result<Secret, ProviderError>;

    /// List all secrets.
    async fn list_secrets(&self) -> Result<Vec<Secret>, ProviderError>;

    /// Delete one secret by name.
    async fn delete_secret(&self, name: &str) -> Result<(), ProviderError>;

    /// Which implementation this is.
    fn kind(&self) -> ProviderKind;
}
