//! End-to-end WebSocket session tests: a real hub served on an ephemeral
//! port, driven by tungstenite clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use hiroba_server::config::Config;
use hiroba_server::domain::{ChannelKind, DataStore, User};
use hiroba_server::infrastructure::store::InMemoryDataStore;
use hiroba_server::ui::{AppState, router};
use hiroba_shared::time::SystemClock;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Serve a seeded hub on an ephemeral port; returns its ws URL.
async fn spawn_server() -> String {
    let store = Arc::new(InMemoryDataStore::new());
    store.seed_user(User::new("alice", "alice"), "tok-alice").await;
    store.seed_user(User::new("bob", "bob"), "tok-bob").await;
    store
        .create_channel("general", "general", ChannelKind::Text, "alice")
        .await
        .unwrap();

    let state = AppState::build(
        store as Arc<dyn DataStore>,
        Arc::new(SystemClock),
        &Config::default(),
    )
    .unwrap();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("ws://{addr}/ws")
}

async fn connect(url: &str, token: &str) -> WsClient {
    let (mut client, _response) = connect_async(url).await.expect("connect");
    client
        .send(Message::text(format!(
            "{{\"op\":\"authenticate\",\"d\":{{\"token\":\"{token}\"}}}}"
        )))
        .await
        .expect("send authenticate");
    client
}

/// Next text frame as JSON, skipping control frames.
async fn recv_json(client: &mut WsClient) -> Option<serde_json::Value> {
    loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, client.next()).await.ok()??;
        match next {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).expect("valid envelope"));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Read frames until one with the given op arrives.
async fn recv_op(client: &mut WsClient, op: &str) -> Option<serde_json::Value> {
    loop {
        let value = recv_json(client).await?;
        if value["op"] == op {
            return Some(value);
        }
    }
}

#[tokio::test]
async fn test_authenticate_yields_ready_snapshot() {
    // given:
    let url = spawn_server().await;

    // when:
    let mut alice = connect(&url, "tok-alice").await;
    let ready = recv_op(&mut alice, "ready").await.expect("ready");

    // then: everything needed to render, including the clock anchor
    let d = &ready["d"];
    assert_eq!(d["user"]["id"], "alice");
    assert_eq!(d["channels"][0]["id"], "general");
    assert!(d["server_time"].as_f64().unwrap() > 0.0);
    assert!(d["voice_states"].as_array().unwrap().is_empty());
    assert!(d["online_users"].as_array().is_some());
}

#[tokio::test]
async fn test_invalid_token_is_rejected() {
    // given:
    let url = spawn_server().await;

    // when:
    let mut client = connect(&url, "tok-wrong").await;

    // then: no ready; the server closes the connection
    assert!(recv_json(&mut client).await.is_none());
}

#[tokio::test]
async fn test_presence_online_and_offline_broadcasts() {
    // given: alice connected
    let url = spawn_server().await;
    let mut alice = connect(&url, "tok-alice").await;
    recv_op(&mut alice, "ready").await.expect("alice ready");

    // when: bob connects
    let mut bob = connect(&url, "tok-bob").await;
    recv_op(&mut bob, "ready").await.expect("bob ready");

    // then: alice sees him come online
    let online = recv_op(&mut alice, "user_online").await.expect("user_online");
    assert_eq!(online["d"]["user"]["id"], "bob");

    // when: bob disconnects
    bob.close(None).await.unwrap();

    // then: exactly one offline transition
    let offline = recv_op(&mut alice, "user_offline").await.expect("user_offline");
    assert_eq!(offline["d"]["user_id"], "bob");
}

#[tokio::test]
async fn test_message_flow_reaches_all_clients() {
    // given: two connected clients
    let url = spawn_server().await;
    let mut alice = connect(&url, "tok-alice").await;
    recv_op(&mut alice, "ready").await.expect("alice ready");
    let mut bob = connect(&url, "tok-bob").await;
    recv_op(&mut bob, "ready").await.expect("bob ready");

    // when: bob posts to general
    bob.send(Message::text(
        r#"{"op":"send_message","d":{"channel_id":"general","content":"hello"}}"#,
    ))
    .await
    .unwrap();

    // then: both receive the broadcast
    let to_alice = recv_op(&mut alice, "message_create").await.expect("to alice");
    assert_eq!(to_alice["d"]["content"], "hello");
    assert_eq!(to_alice["d"]["author"]["id"], "bob");
    let to_bob = recv_op(&mut bob, "message_create").await.expect("to bob");
    assert_eq!(to_bob["d"]["content"], "hello");
}

#[tokio::test]
async fn test_unknown_op_is_ignored_and_connection_survives() {
    // given:
    let url = spawn_server().await;
    let mut alice = connect(&url, "tok-alice").await;
    recv_op(&mut alice, "ready").await.expect("ready");

    // when: an op from the future, then a ping
    alice
        .send(Message::text(r#"{"op":"quantum_handshake","d":{"qubits":3}}"#))
        .await
        .unwrap();
    alice
        .send(Message::text(r#"{"op":"ping","d":{}}"#))
        .await
        .unwrap();

    // then: the unknown op was dropped, the connection still answers
    assert!(recv_op(&mut alice, "pong").await.is_some());
}

#[tokio::test]
async fn test_rate_limit_closes_flooding_connection() {
    // given:
    let url = spawn_server().await;
    let mut alice = connect(&url, "tok-alice").await;
    recv_op(&mut alice, "ready").await.expect("ready");

    // when: 31 operations inside one window (limit is 30)
    for _ in 0..31 {
        alice
            .send(Message::text(r#"{"op":"ping","d":{}}"#))
            .await
            .unwrap();
    }

    // then: the 31st is rejected by closing the connection, not buffering —
    // at most 30 pongs ever arrive and the stream ends
    let mut pongs = 0;
    while let Some(value) = recv_json(&mut alice).await {
        if value["op"] == "pong" {
            pongs += 1;
        }
    }
    assert!(pongs <= 30);
}

#[tokio::test]
async fn test_typing_start_excludes_the_typist() {
    // given:
    let url = spawn_server().await;
    let mut alice = connect(&url, "tok-alice").await;
    recv_op(&mut alice, "ready").await.expect("alice ready");
    let mut bob = connect(&url, "tok-bob").await;
    recv_op(&mut bob, "ready").await.expect("bob ready");

    // when: bob starts typing, then sends a message
    bob.send(Message::text(
        r#"{"op":"typing_start","d":{"channel_id":"general"}}"#,
    ))
    .await
    .unwrap();
    bob.send(Message::text(
        r#"{"op":"send_message","d":{"channel_id":"general","content":"done"}}"#,
    ))
    .await
    .unwrap();

    // then: alice sees the typing event; bob's next event is the message,
    // never his own typing echo
    let typing = recv_op(&mut alice, "typing_start").await.expect("typing");
    assert_eq!(typing["d"]["user_id"], "bob");
    let next = recv_json(&mut bob).await.expect("bob's next event");
    assert_eq!(next["op"], "message_create");
}
