//! In-memory fake provider for tests and local development.
//!
//! Never fails a valid request: instances materialize instantly in the
//! `Running` state and ids come from a monotonic counter, so test runs are
//! deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    Instance, InstanceSpec, InstanceStatus, Provider, ProviderError, ProviderKind, Secret,
};

/// Namespace reported for fake secrets.
const FAKE_NAMESPACE: &str = "default";

/// In-memory provider implementation.
pub struct FakeProvider {
    instances: Mutex<HashMap<String, Instance>>,
    secrets: Mutex<HashMap<String, Secret>>,
    next_id: AtomicU64,
}

impl FakeProvider {
    /// Create an empty fake provider.
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn mint_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("inst-{n:08x}")
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn create_instance(&self, spec: InstanceSpec) -> Result<Instance, ProviderError> {
        // Referenced secrets must exist, same as the real provider.
        {
            let secrets = self.secrets.lock().await;
            for name in &spec.secret_names {
                if !secrets.contains_key(name) {
                    return Err(ProviderError::SecretNotFound(name.clone()));
                }
            }
        }

        let instance = Instance {
            id: self.mint_id(),
            tier: spec.tier,
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            secret_names: spec.secret_names,
            labels: spec.labels,
            handle: None,
        };

        self.instances
            .lock()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, ProviderError> {
        self.instances
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::InstanceNotFound(id.to_owned()))
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let mut instances: Vec<Instance> = self.instances.lock().await.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.instances
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::InstanceNotFound(id.to_owned()))
    }

    async fn label_instance(
        &self,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ProviderError> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| ProviderError::InstanceNotFound(id.to_owned()))?;
        instance.labels.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn create_secret(
        &self,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<Secret, ProviderError> {
        let mut secrets = self.secrets.lock().await;
        if secrets.contains_key(name) {
            return Err(ProviderError::SecretExists(name.to_owned()));
        }
        let secret = Secret {
            name: name.to_owned(),
            namespace: FAKE_NAMESPACE.to_owned(),
            created_at: Utc::now(),
            data,
        };
        secrets.insert(name.to_owned(), secret.clone());
        Ok(secret)
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, ProviderError> {
        self.secrets
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::SecretNotFound(name.to_owned()))
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, ProviderError> {
        let mut secrets: Vec<Secret> = self.secrets.lock().await.values().cloned().collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ProviderError> {
        self.secrets
            .lock()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::SecretNotFound(name.to_owned()))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Fake
    }
}
