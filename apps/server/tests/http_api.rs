use std::sync::Arc;

use calibra_server::{AppState, ServerConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;

async fn start_server() -> (String, Arc<AppState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(AppState::new(ServerConfig::default()));
    tokio::spawn(calibra_server::serve(listener, Arc::clone(&state)));
    (format!("http://{}", addr), state)
}

async fn login(http: &reqwest::Client, base: &str, user: &str) -> Value {
    http.post(format!("{}/auth/login", base))
        .json(&json!({"username": user, "password": "calibra"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn refresh_token_cannot_be_reused() {
    let (base, state) = start_server().await;
    let http = reqwest::Client::new();
    let tokens = login(&http, &base, "alice").await;
    let body = json!({"refresh_token": tokens["refresh_token"]});

    let first = http
        .post(format!("{}/auth/refresh", base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let reused = http
        .post(format!("{}/auth/refresh", base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(reused.status(), 401);
    assert_eq!(state.refresh_calls(), 2);
}

#[tokio::test]
async fn expired_token_on_draft_carries_redirect_marker() {
    let (base, _state) = start_server().await;
    let http = reqwest::Client::new();

    let response = http
        .get(format!("{}/drafts/inward/42", base))
        .bearer_auth("not-a-token")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(response.headers()["x-redirect-required"], "true");
    assert_eq!(response.headers()["x-redirect-record-id"], "42");
}

#[tokio::test]
async fn second_user_gets_conflict_with_holder() {
    let (base, _state) = start_server().await;
    let http = reqwest::Client::new();
    let alice = login(&http, &base, "alice").await;
    let bob = login(&http, &base, "bob").await;
    let target = json!({"entity_type": "inward", "entity_id": "42"});

    let owned = http
        .post(format!("{}/locks/acquire", base))
        .bearer_auth(alice["access_token"].as_str().unwrap())
        .json(&target)
        .send()
        .await
        .unwrap();
    assert_eq!(owned.status(), 200);

    let blocked = http
        .post(format!("{}/locks/acquire", base))
        .bearer_auth(bob["access_token"].as_str().unwrap())
        .json(&target)
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 409);
    let body: Value = blocked.json().await.unwrap();
    assert_eq!(body["locked_by"], "alice");
}

#[tokio::test]
async fn missing_draft_is_not_found_until_saved() {
    let (base, state) = start_server().await;
    let http = reqwest::Client::new();
    let tokens = login(&http, &base, "alice").await;
    let token = tokens["access_token"].as_str().unwrap().to_string();

    let missing = http
        .get(format!("{}/drafts/inward/7", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let saved = http
        .post(format!("{}/drafts/inward/7/draft", base))
        .bearer_auth(&token)
        .json(&json!({"steps": [{"nominal": 5, "readings": [5.1, 4.9]}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(saved.status(), 200);
    let evaluation: Value = saved.json().await.unwrap();
    assert_eq!(evaluation["steps"][0]["mean"], json!(5.0));

    let stored: Value = http
        .get(format!("{}/drafts/inward/7", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored["steps"][0]["readings"], json!([5.1, 4.9]));
    assert_eq!(state.draft_saves(), 1);
}
