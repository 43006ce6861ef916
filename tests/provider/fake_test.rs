//! Provider contract, exercised against the in-memory fake.

use std::collections::HashMap;

use orzbob::provider::fake::FakeProvider;
use orzbob::provider::{
    InstanceSpec, InstanceStatus, Provider, ProviderError, ProviderKind, ORG_LABEL,
};

fn small_spec() -> InstanceSpec {
    InstanceSpec {
        tier: "small".to_owned(),
        secret_names: Vec::new(),
        labels: HashMap::new(),
    }
}

#[tokio::test]
async fn instances_crud_round_trip() {
    let provider = FakeProvider::new();
    assert_eq!(provider.kind(), ProviderKind::Fake);

    let created = provider.create_instance(small_spec()).await.expect("create");
    assert_eq!(created.status, InstanceStatus::Running);
    assert_eq!(created.tier, "small");

    let fetched = provider.get_instance(&created.id).await.expect("get");
    assert_eq!(fetched.id, created.id);

    let listed = provider.list_instances().await.expect("list");
    assert_eq!(listed.len(), 1);

    provider.delete_instance(&created.id).await.expect("delete");
    assert!(matches!(
        provider.get_instance(&created.id).await,
        Err(ProviderError::InstanceNotFound(_))
    ));
    assert!(matches!(
        provider.delete_instance(&created.id).await,
        Err(ProviderError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn ids_are_unique_and_monotonic() {
    let provider = FakeProvider::new();
    let a = provider.create_instance(small_spec()).await.expect("create");
    let b = provider.create_instance(small_spec()).await.expect("create");
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn unknown_tier_is_accepted() {
    // The tier label is opaque at this layer; validation is the API's job.
    let provider = FakeProvider::new();
    let spec = InstanceSpec {
        tier: "quantum".to_owned(),
        secret_names: Vec::new(),
        labels: HashMap::new(),
    };
    let created = provider.create_instance(spec).await.expect("create");
    assert_eq!(created.tier, "quantum");
}

#[tokio::test]
async fn labels_can_be_added_after_create() {
    let provider = FakeProvider::new();
    let created = provider.create_instance(small_spec()).await.expect("create");

    provider
        .label_instance(&created.id, ORG_LABEL, "org-a")
        .await
        .expect("label");

    let fetched = provider.get_instance(&created.id).await.expect("get");
    assert_eq!(fetched.org_id(), Some("org-a"));
}

#[tokio::test]
async fn secrets_crud_and_mounting() {
    let provider = FakeProvider::new();

    let mut data = HashMap::new();
    data.insert("TOKEN".to_owned(), "t0p".to_owned());
    let secret = provider.create_secret("ci-token", data).await.expect("create");
    assert_eq!(secret.namespace, "default");
    assert_eq!(secret.keys(), vec!["TOKEN".to_owned()]);

    // Duplicate names are rejected.
    assert!(matches!(
        provider.create_secret("ci-token", HashMap::new()).await,
        Err(ProviderError::SecretExists(_))
    ));

    // Creating an instance referencing the secret records the mount.
    let spec = InstanceSpec {
        tier: "small".to_owned(),
        secret_names: vec!["ci-token".to_owned()],
        labels: HashMap::new(),
    };
    let created = provider.create_instance(spec).await.expect("create");
    assert_eq!(created.secret_names, vec!["ci-token".to_owned()]);

    // A missing secret fails the create.
    let spec = InstanceSpec {
        tier: "small".to_owned(),
        secret_names: vec!["ghost".to_owned()],
        labels: HashMap::new(),
    };
    assert!(matches!(
        provider.create_instance(spec).await,
        Err(ProviderError::SecretNotFound(_))
    ));

    provider.delete_secret("ci-token").await.expect("delete");
    assert!(matches!(
        provider.get_secret("ci-token").await,
        Err(ProviderError::SecretNotFound(_))
    ));
}
