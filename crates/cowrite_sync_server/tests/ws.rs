//! End-to-end gateway tests against a live server on 127.0.0.1:0.

use std::sync::Arc;
use std::time::Duration;

use cowrite_core::protocol::{ClientEvent, ErrorCode, ServerEvent};
use cowrite_sync_server::{
    config::Config, handlers::AppState, rate_limit::ChatRateLimiter, rooms::RoomRegistry, routes,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (String, AppState) {
    let state = AppState {
        registry: Arc::new(RoomRegistry::new(8, 100)),
        rate_limiter: ChatRateLimiter::new(),
        config: Arc::new(Config::default()),
    };
    let app = routes(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{}/ws", addr), state)
}

async fn send(ws: &mut Ws, event: &ClientEvent) {
    let json = serde_json::to_string(event).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

async fn next_event(ws: &mut Ws) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Connect and join; panics unless the join succeeds. Returns the socket
/// and the issued user id.
async fn join(url: &str, room_id: &str, nickname: &str) -> (Ws, String) {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send(
        &mut ws,
        &ClientEvent::JoinRoom {
            room_id: room_id.to_string(),
            nickname: nickname.to_string(),
            user_id: None,
        },
    )
    .await;

    match next_event(&mut ws).await {
        ServerEvent::RoomJoined {
            success: true,
            user_id,
            ..
        } => (ws, user_id),
        other => panic!("join failed: {:?}", other),
    }
}

#[tokio::test]
async fn chat_reaches_all_members_in_server_order() {
    let (url, state) = start_server().await;
    let room = state.registry.create_room().await;

    let (mut a, _) = join(&url, room.id(), "ada").await;
    let (mut b, _) = join(&url, room.id(), "brin").await;

    // a observes b's arrival
    match next_event(&mut a).await {
        ServerEvent::UserJoined { user } => assert_eq!(user.nickname, "brin"),
        other => panic!("expected user-joined, got {:?}", other),
    }

    for content in ["one", "two", "three"] {
        send(
            &mut a,
            &ClientEvent::SendMessage {
                content: content.to_string(),
            },
        )
        .await;
    }

    // Both members, sender included, see the same linear order
    for ws in [&mut a, &mut b] {
        for expected in ["one", "two", "three"] {
            match next_event(ws).await {
                ServerEvent::NewMessage { message } => assert_eq!(message.content, expected),
                other => panic!("expected new-message, got {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn document_updates_are_relayed_to_peers_only() {
    let (url, state) = start_server().await;
    let room = state.registry.create_room().await;

    let (mut a, a_id) = join(&url, room.id(), "ada").await;
    let (mut b, _) = join(&url, room.id(), "brin").await;
    let _ = next_event(&mut a).await; // b's user-joined

    send(&mut a, &ClientEvent::DocumentUpdate { update: vec![7, 8, 9] }).await;
    // Follow with a chat message as an ordering fence
    send(&mut a, &ClientEvent::SendMessage { content: "fence".to_string() }).await;

    match next_event(&mut b).await {
        ServerEvent::DocumentUpdate { update, user_id } => {
            assert_eq!(update, vec![7, 8, 9]);
            assert_eq!(user_id, a_id);
        }
        other => panic!("expected document update, got {:?}", other),
    }

    // The sender receives the fence but never its own delta
    match next_event(&mut a).await {
        ServerEvent::NewMessage { message } => assert_eq!(message.content, "fence"),
        other => panic!("sender got its own delta back: {:?}", other),
    }
}

#[tokio::test]
async fn disconnect_broadcasts_user_left_and_awareness_removal() {
    let (url, state) = start_server().await;
    let room = state.registry.create_room().await;

    let (mut a, _) = join(&url, room.id(), "ada").await;
    let (b, b_id) = join(&url, room.id(), "brin").await;
    let _ = next_event(&mut a).await; // b's user-joined

    drop(b);

    let mut saw_left = false;
    let mut saw_removal = false;
    for _ in 0..2 {
        match next_event(&mut a).await {
            ServerEvent::UserLeft { user_id } => {
                assert_eq!(user_id, b_id);
                saw_left = true;
            }
            ServerEvent::AwarenessRemoval { user_id } => {
                assert_eq!(user_id, b_id);
                saw_removal = true;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(saw_left && saw_removal);
}

#[tokio::test]
async fn join_to_unknown_room_is_rejected() {
    let (url, _state) = start_server().await;

    let (mut ws, _) = connect_async(&url).await.unwrap();
    send(
        &mut ws,
        &ClientEvent::JoinRoom {
            room_id: "nope".to_string(),
            nickname: "ada".to_string(),
            user_id: None,
        },
    )
    .await;

    match next_event(&mut ws).await {
        ServerEvent::RoomJoined { success, error, .. } => {
            assert!(!success);
            assert_eq!(error, Some(ErrorCode::RoomNotFound));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn resume_reclaims_identity_after_reconnect() {
    let (url, state) = start_server().await;
    let room = state.registry.create_room().await;

    let (a, a_id) = join(&url, room.id(), "ada").await;
    drop(a);

    // Give the server a moment to process the disconnect
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut ws, _) = connect_async(&url).await.unwrap();
    send(
        &mut ws,
        &ClientEvent::JoinRoom {
            room_id: room.id().to_string(),
            nickname: "ada".to_string(),
            user_id: Some(a_id.clone()),
        },
    )
    .await;

    match next_event(&mut ws).await {
        ServerEvent::RoomJoined {
            success: true,
            user_id,
            users,
            ..
        } => {
            assert_eq!(user_id, a_id);
            assert_eq!(users.len(), 1, "resume must not create a duplicate");
        }
        other => panic!("resume failed: {:?}", other),
    }
}

#[tokio::test]
async fn events_before_join_are_rejected_without_closing() {
    let (url, state) = start_server().await;
    let room = state.registry.create_room().await;

    let (mut ws, _) = connect_async(&url).await.unwrap();
    send(
        &mut ws,
        &ClientEvent::SendMessage {
            content: "hello?".to_string(),
        },
    )
    .await;

    match next_event(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotInRoom),
        other => panic!("expected error, got {:?}", other),
    }

    // The same socket can still join afterwards
    send(
        &mut ws,
        &ClientEvent::JoinRoom {
            room_id: room.id().to_string(),
            nickname: "ada".to_string(),
            user_id: None,
        },
    )
    .await;
    match next_event(&mut ws).await {
        ServerEvent::RoomJoined { success: true, .. } => {}
        other => panic!("join failed: {:?}", other),
    }
}
