//! Secret CRUD over the live HTTP surface.

use serde_json::{json, Value};

use super::support::spawn_server;

#[tokio::test]
async fn secret_lifecycle() {
    let server = spawn_server().await;
    let (token, _user) = server.seed_user(3001, "secretive").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/secrets", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"name": "api-keys", "data": {"API_KEY": "s3cr3t"}}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["name"], "api-keys");
    assert_eq!(body["namespace"], "default");

    // List and get expose keys, never values.
    let resp = client
        .get(format!("{}/v1/secrets", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request");
    let body: Value = resp.json().await.expect("json");
    let listed = body["secrets"].as_array().expect("array");
    assert_eq!(listed.len(), 1);
    assert!(listed[0].get("data").is_none());

    let resp = client
        .get(format!("{}/v1/secrets/api-keys", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["keys"], json!(["API_KEY"]));
    assert!(body.get("data").is_none());

    let resp = client
        .delete(format!("{}/v1/secrets/api-keys", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 204);

    let resp = client
        .get(format!("{}/v1/secrets/api-keys", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn create_validates_name_and_data() {
    let server = spawn_server().await;
    let (token, _user) = server.seed_user(3002, "validator").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/secrets", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"name": "", "data": {"K": "v"}}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/v1/secrets", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"name": "empty"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn instance_create_mounts_existing_secret_and_rejects_missing() {
    let server = spawn_server().await;
    let (token, _user) = server.seed_user(3003, "mounter").await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/v1/secrets", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"name": "db-creds", "data": {"PGPASSWORD": "hunter2"}}))
        .send()
        .await
        .expect("request");

    let resp = client
        .post(format!("{}/v1/instances", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"tier": "small", "secrets": ["db-creds"]}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 201);

    let resp = client
        .post(format!("{}/v1/instances", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"tier": "small", "secrets": ["no-such-secret"]}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
}
