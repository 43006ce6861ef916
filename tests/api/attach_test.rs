//! WebSocket attach authorization matrix and frame echo.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use orzbob::auth::{Claims, TokenType};

use super::support::{spawn_server_with_quota, TestServer, TEST_ISSUER};

async fn create_instance(server: &TestServer, token: &str) -> (String, String) {
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/instances", server.base_url))
        .bearer_auth(token)
        .json(&json!({"tier": "small"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.expect("json");
    (
        body["id"].as_str().expect("id").to_owned(),
        body["attach_url"].as_str().expect("attach url").to_owned(),
    )
}

fn ws_base(server: &TestServer, instance_id: &str) -> String {
    format!(
        "{}/v1/instances/{instance_id}/attach",
        server.base_url.replacen("http://", "ws://", 1)
    )
}

async fn dial_expecting_status(url: &str, expected: u16) {
    match connect_async(url).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status().as_u16(), expected, "dialing {url}");
        }
        Ok(_) => panic!("dial of {url} unexpectedly upgraded"),
        Err(other) => panic!("dial of {url} failed unexpectedly: {other}"),
    }
}

#[tokio::test]
async fn attach_authorization_matrix() {
    let server = spawn_server_with_quota(3).await;
    let (user_token, _user) = server.seed_user(2001, "attacher").await;

    let (id_one, attach_url_one) = create_instance(&server, &user_token).await;
    let (_id_two, attach_url_two) = create_instance(&server, &user_token).await;

    let base = ws_base(&server, &id_one);

    // Missing token.
    dial_expecting_status(&base, 401).await;

    // Garbage token.
    dial_expecting_status(&format!("{base}?token=garbage.garbage.garbage"), 401).await;

    // Valid token for a different instance.
    let other_token = attach_url_two
        .split("token=")
        .nth(1)
        .expect("token in url")
        .to_owned();
    dial_expecting_status(&format!("{base}?token={other_token}"), 403).await;

    // Expired token for the right instance.
    let now = Utc::now().timestamp();
    let expired = server
        .state
        .tokens
        .sign_claims_for_test(&Claims {
            typ: TokenType::Instance,
            sub: id_one.clone(),
            iss: TEST_ISSUER.to_owned(),
            iat: now - 7200,
            nbf: Some(now - 7200),
            exp: now - 3600,
            instance_id: Some(id_one.clone()),
        })
        .expect("sign");
    dial_expecting_status(&format!("{base}?token={expired}"), 401).await;

    // The real attach URL upgrades and echoes.
    let (mut socket, response) = connect_async(&attach_url_one).await.expect("upgrade");
    assert_eq!(response.status().as_u16(), 101);

    socket
        .send(Message::Text("hi".to_owned()))
        .await
        .expect("send");

    let echoed = loop {
        match socket.next().await.expect("frame").expect("frame ok") {
            Message::Binary(data) => break data,
            Message::Text(text) => break text.into_bytes(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    };
    assert_eq!(echoed, b"hi");
}

#[tokio::test]
async fn attach_unknown_instance_is_404() {
    let server = spawn_server_with_quota(3).await;

    // Mint a valid token for an id the provider has never seen.
    let token = server
        .state
        .tokens
        .generate_instance_token("inst-ghost", std::time::Duration::from_secs(120))
        .expect("mint");

    let url = format!("{}?token={token}", ws_base(&server, "inst-ghost"));
    dial_expecting_status(&url, 404).await;
}

#[tokio::test]
async fn user_token_cannot_attach() {
    let server = spawn_server_with_quota(3).await;
    let (user_token, _user) = server.seed_user(2002, "wrong-shape").await;
    let (id, _attach_url) = create_instance(&server, &user_token).await;

    let url = format!("{}?token={user_token}", ws_base(&server, &id));
    dial_expecting_status(&url, 401).await;
}
