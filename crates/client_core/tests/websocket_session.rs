use std::{future::Future, time::Duration};

use axum::{
    extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use client_core::{
    open_session, ClientConfig, MessageId, ReconnectPolicy, SessionOptions, SessionStatus,
    ThreadId, UserId,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(serve_socket)
}

/// Minimal chat server: accepts any credentials and echoes sends back with a
/// server id.
async fn serve_socket(mut socket: WebSocket) {
    let mut user = String::new();
    let mut next_id = 0;
    while let Some(Ok(frame)) = socket.recv().await {
        let WsFrame::Text(text) = frame else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let payload = &request["payload"];
        let replies = match request["type"].as_str() {
            Some("auth") => {
                user = payload["username"].as_str().unwrap_or_default().to_string();
                vec![
                    json!({"type": "auth-success", "payload": {"userId": user}}),
                    json!({"type": "presence-snapshot", "payload": {"users": [user, "bob"]}}),
                ]
            }
            Some("request-history") => vec![json!({
                "type": "history-snapshot",
                "payload": {"threadId": payload["threadId"], "messages": []}
            })],
            Some("send-message") => {
                next_id += 1;
                vec![json!({
                    "type": "message",
                    "payload": {
                        "id": format!("srv-{next_id}"),
                        "username": user,
                        "message": payload["body"],
                        "receiver": payload.get("receiver").cloned().unwrap_or(Value::Null),
                        "timestamp": payload["timestamp"],
                    }
                })]
            }
            _ => Vec::new(),
        };
        for reply in replies {
            if socket.send(WsFrame::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

async fn spawn_chat_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws", get(ws_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn config(server_url: String, reconnect: ReconnectPolicy) -> ClientConfig {
    ClientConfig {
        server_url,
        database_url: "sqlite::memory:".to_string(),
        reconnect,
        session: SessionOptions::default(),
    }
}

#[tokio::test]
async fn login_send_and_reconcile_over_websocket() {
    let server_url = spawn_chat_server().await;
    let controller = open_session(&config(server_url, ReconnectPolicy::default()))
        .await
        .expect("session");
    tokio::spawn(controller.clone().run());

    controller.login("alice", "pw").await.expect("login");
    eventually("authentication", || {
        let controller = controller.clone();
        async move { controller.session().await.status == SessionStatus::Authenticated }
    })
    .await;
    eventually("presence", || {
        let controller = controller.clone();
        async move { controller.online_users().await == vec![UserId::from("bob")] }
    })
    .await;

    controller
        .send_message("hello", None, None)
        .await
        .expect("send");
    eventually("server echo", || {
        let controller = controller.clone();
        async move {
            let messages = controller.messages_for(&ThreadId::broadcast()).await;
            messages.len() == 1 && messages[0].id == MessageId::from("srv-1")
        }
    })
    .await;

    let messages = controller.messages_for(&ThreadId::broadcast()).await;
    assert_eq!(messages[0].sender, UserId::from("alice"));
    assert_eq!(messages[0].body, "hello");
}

#[tokio::test]
async fn unreachable_server_switches_to_offline_mode() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let controller = open_session(&config(
        format!("http://{addr}"),
        ReconnectPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(10),
        },
    ))
    .await
    .expect("session");
    tokio::spawn(controller.clone().run());

    controller.start().await;
    eventually("offline mode", || {
        let controller = controller.clone();
        async move { controller.is_offline().await }
    })
    .await;
    eventually("reconnect budget exhausted", || {
        let controller = controller.clone();
        async move { controller.session().await.status == SessionStatus::Disconnected }
    })
    .await;
}
