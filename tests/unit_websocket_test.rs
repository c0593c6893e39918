mod common;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::routing::get;
use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use helmsman::core::events::topic;
use helmsman::core::server::{PowerAction, Server};
use helmsman::core::token::{Claims, TokenValidator, permission};
use helmsman::core::websocket::{WebsocketMessage, WebsocketSession, inbound, outbound};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

const SECRET: &str = "panel-shared-secret";

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn validator() -> Arc<TokenValidator> {
    Arc::new(TokenValidator::new(
        SECRET,
        Utc::now() - ChronoDuration::seconds(30),
    ))
}

fn sign(server: Uuid, permissions: Vec<&str>) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iss: "https://panel.example.com".to_string(),
        sub: server.to_string(),
        iat: now,
        exp: now + 600,
        jti: Uuid::new_v4().to_string(),
        permissions: permissions.into_iter().map(str::to_string).collect(),
        nonce: String::new(),
        file_path: None,
        backup_uuid: None,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// Serves one server's websocket endpoint on an ephemeral port and
/// returns the url to dial.
async fn spawn_endpoint(server: Arc<Server>, validator: Arc<TokenValidator>) -> String {
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let server = server.clone();
            let validator = validator.clone();
            async move {
                ws.on_upgrade(move |socket| async move {
                    WebsocketSession::new(server, validator).run(socket).await;
                })
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn connect(url: &str) -> ClientSocket {
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn send_frame(socket: &mut ClientSocket, event: &str, args: Vec<String>) {
    let raw = serde_json::to_string(&WebsocketMessage::new(event, args)).unwrap();
    socket.send(Message::Text(raw.into())).await.unwrap();
}

/// Reads the next text frame, skipping control frames, with a deadline.
async fn recv_frame(socket: &mut ClientSocket) -> WebsocketMessage {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let frame = tokio::time::timeout_at(deadline, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed while waiting for a frame")
            .unwrap();
        if let Message::Text(raw) = frame {
            return serde_json::from_str(&raw).unwrap();
        }
    }
}

#[tokio::test]
async fn test_nothing_is_processed_before_auth() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    let url = spawn_endpoint(server.clone(), validator()).await;
    let mut socket = connect(&url).await;

    send_frame(
        &mut socket,
        inbound::SET_STATE,
        vec!["start".to_string()],
    )
    .await;
    let reply = recv_frame(&mut socket).await;
    assert_eq!(reply.event, outbound::JWT_ERROR);

    send_frame(
        &mut socket,
        inbound::SEND_COMMAND,
        vec!["say hi".to_string()],
    )
    .await;
    let reply = recv_frame(&mut socket).await;
    assert_eq!(reply.event, outbound::JWT_ERROR);

    // The unauthenticated frames had no effect on the server.
    assert_eq!(server.phase().to_string(), "offline");
    assert!(env.sent_commands.lock().is_empty());
}

#[tokio::test]
async fn test_bad_token_yields_jwt_error() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());
    let url = spawn_endpoint(server.clone(), validator()).await;
    let mut socket = connect(&url).await;

    // Signed for a different server entirely.
    send_frame(
        &mut socket,
        inbound::AUTH,
        vec![sign(Uuid::new_v4(), vec!["*"])],
    )
    .await;
    let reply = recv_frame(&mut socket).await;
    assert_eq!(reply.event, outbound::JWT_ERROR);

    send_frame(
        &mut socket,
        inbound::AUTH,
        vec!["not even a token".to_string()],
    )
    .await;
    let reply = recv_frame(&mut socket).await;
    assert_eq!(reply.event, outbound::JWT_ERROR);
}

#[tokio::test]
async fn test_first_auth_emits_state_snapshot_reauth_does_not() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());
    let url = spawn_endpoint(server.clone(), validator()).await;
    let mut socket = connect(&url).await;

    send_frame(
        &mut socket,
        inbound::AUTH,
        vec![sign(server.uuid(), vec!["*"])],
    )
    .await;

    // First authentication: auth success, the current phase, and (for an
    // offline server) one stats snapshot.
    assert_eq!(recv_frame(&mut socket).await.event, outbound::AUTH_SUCCESS);

    let status = recv_frame(&mut socket).await;
    assert_eq!(status.event, topic::STATUS);
    assert_eq!(status.args, vec!["offline".to_string()]);

    let stats = recv_frame(&mut socket).await;
    assert_eq!(stats.event, topic::STATS);
    let payload: Value = serde_json::from_str(&stats.args[0]).unwrap();
    assert_eq!(payload["state"], "offline");

    // A token refresh replays nothing: only auth success, and the next
    // frame after it is live traffic.
    send_frame(
        &mut socket,
        inbound::AUTH,
        vec![sign(server.uuid(), vec!["*"])],
    )
    .await;
    assert_eq!(recv_frame(&mut socket).await.event, outbound::AUTH_SUCCESS);

    server.events().publish_str(topic::DAEMON_MESSAGE, "hello");
    let next = recv_frame(&mut socket).await;
    assert_eq!(next.event, topic::DAEMON_MESSAGE);
    assert_eq!(next.args, vec!["hello".to_string()]);
}

#[tokio::test]
async fn test_install_output_is_admin_gated() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());
    let url = spawn_endpoint(server.clone(), validator()).await;

    // Wildcard grants everything except admin permissions.
    let mut plain = connect(&url).await;
    send_frame(
        &mut plain,
        inbound::AUTH,
        vec![sign(server.uuid(), vec!["*"])],
    )
    .await;
    for _ in 0..3 {
        recv_frame(&mut plain).await;
    }

    server
        .events()
        .publish_str(topic::INSTALL_OUTPUT, "secret install line");
    server.events().publish_str(topic::DAEMON_MESSAGE, "public line");

    // The install line was filtered out; the very next frame this client
    // sees is the public one.
    let next = recv_frame(&mut plain).await;
    assert_eq!(next.event, topic::DAEMON_MESSAGE);
    assert_eq!(next.args, vec!["public line".to_string()]);
    drop(plain);

    // An install observer receives it.
    let mut admin = connect(&url).await;
    send_frame(
        &mut admin,
        inbound::AUTH,
        vec![sign(
            server.uuid(),
            vec![permission::CONNECT, permission::ADMIN_INSTALL],
        )],
    )
    .await;
    for _ in 0..3 {
        recv_frame(&mut admin).await;
    }

    server
        .events()
        .publish_str(topic::INSTALL_OUTPUT, "visible install line");
    let next = recv_frame(&mut admin).await;
    assert_eq!(next.event, topic::INSTALL_OUTPUT);
    assert_eq!(next.args, vec!["visible install line".to_string()]);
}

#[tokio::test]
async fn test_send_command_reaches_the_environment() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = spawn_endpoint(server.clone(), validator()).await;
    let mut socket = connect(&url).await;
    send_frame(
        &mut socket,
        inbound::AUTH,
        vec![sign(server.uuid(), vec!["*"])],
    )
    .await;
    // Running server: auth success + status only.
    assert_eq!(recv_frame(&mut socket).await.event, outbound::AUTH_SUCCESS);
    let status = recv_frame(&mut socket).await;
    assert_eq!(status.args, vec!["running".to_string()]);

    send_frame(
        &mut socket,
        inbound::SEND_COMMAND,
        vec!["say hello".to_string()],
    )
    .await;

    // The command flows through the session into the environment.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if env.sent_commands.lock().contains(&"say hello".to_string()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "command never reached the environment"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn test_frame_wire_shape() {
    let frame: WebsocketMessage =
        serde_json::from_str(r#"{"event":"set state","args":["start"]}"#).unwrap();
    assert_eq!(frame.event, inbound::SET_STATE);
    assert_eq!(frame.args, vec!["start".to_string()]);

    // Args may be omitted entirely.
    let frame: WebsocketMessage = serde_json::from_str(r#"{"event":"auth success"}"#).unwrap();
    assert_eq!(frame.event, outbound::AUTH_SUCCESS);
    assert!(frame.args.is_empty());
}

#[test]
fn test_frame_serialization_roundtrip() {
    let frame = WebsocketMessage::new("console output", vec!["[INFO] done".to_string()]);
    let raw = serde_json::to_string(&frame).unwrap();
    assert_eq!(raw, r#"{"event":"console output","args":["[INFO] done"]}"#);

    let parsed: WebsocketMessage = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.event, frame.event);
    assert_eq!(parsed.args, frame.args);
}
