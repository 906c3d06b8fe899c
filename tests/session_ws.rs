//! Session tests against a local WebSocket server standing in for the
//! realtime backend. Audio devices are disabled so the tests run on
//! headless machines.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use talkwire::{Role, Session, SessionConfig, SessionEvent, StatusUpdate};

/// Accept one client, push the scripted events, then collect whatever
/// the client sends until it closes or goes quiet.
async fn spawn_backend(
    script: Vec<serde_json::Value>,
) -> (String, JoinHandle<Vec<serde_json::Value>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        for event in script {
            ws.send(WsMessage::Text(event.to_string().into()))
                .await
                .unwrap();
        }
        let mut received = Vec::new();
        while let Ok(Some(Ok(message))) = timeout(Duration::from_secs(2), ws.next()).await {
            match message {
                WsMessage::Text(text) => {
                    received.push(serde_json::from_str(&text).unwrap());
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        received
    });
    (format!("ws://{}", addr), handle)
}

fn text_only_config(url: String) -> SessionConfig {
    SessionConfig {
        url,
        enable_capture: false,
        enable_playback: false,
        ..SessionConfig::default()
    }
}

async fn next_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
) -> SessionEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

#[tokio::test]
async fn transcript_flows_from_events_to_messages() {
    let script = vec![
        json!({"type": "history_added", "item": {
            "item_id": "i1",
            "role": "user",
            "content": [{"type": "text", "text": "Hi"}],
        }}),
        json!({"type": "response.audio_transcript.delta", "delta": "Hel"}),
        json!({"type": "response.audio_transcript.delta", "delta": "lo"}),
        json!({"type": "response.audio_transcript.done"}),
    ];
    let (url, backend) = spawn_backend(script).await;
    let (mut session, mut events) = Session::connect(text_only_config(url)).await.unwrap();

    match next_event(&mut events).await {
        SessionEvent::Message(message) => {
            assert_eq!(message.role, Role::User);
            assert_eq!(message.text, "Hi");
        }
        other => panic!("expected user message, got {:?}", other),
    }
    assert_eq!(next_event(&mut events).await, SessionEvent::Partial("Hel".into()));
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Partial("Hello".into())
    );
    match next_event(&mut events).await {
        SessionEvent::Message(message) => {
            assert_eq!(message.role, Role::Assistant);
            assert_eq!(message.text, "Hello");
        }
        other => panic!("expected assistant message, got {:?}", other),
    }

    session.send_text("thanks");
    session.disconnect().await;

    let received = backend.await.unwrap();
    assert!(received
        .iter()
        .any(|m| m["type"] == "text" && m["text"] == "thanks"));
}

#[tokio::test]
async fn malformed_messages_are_dropped_without_killing_the_session() {
    let script = vec![
        json!({"no_type_field": true}),
        json!({"type": "some_future_event", "payload": 1}),
        json!({"type": "error", "error": "model overloaded"}),
        json!({"type": "history_added", "item": {
            "item_id": "i2",
            "role": "assistant",
            "content": [{"type": "audio", "transcript": "still here"}],
        }}),
    ];
    let (url, backend) = spawn_backend(script).await;
    let (mut session, mut events) = Session::connect(text_only_config(url)).await.unwrap();

    // The malformed and unknown messages surface nothing; the error and
    // the real item come through in order.
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Status(StatusUpdate::BackendError("model overloaded".into()))
    );
    match next_event(&mut events).await {
        SessionEvent::Message(message) => assert_eq!(message.text, "still here"),
        other => panic!("expected message, got {:?}", other),
    }

    session.disconnect().await;
    backend.await.unwrap();
}

#[tokio::test]
async fn disconnect_is_idempotent_and_send_text_becomes_a_noop() {
    let (url, backend) = spawn_backend(Vec::new()).await;
    let (mut session, _events) = Session::connect(text_only_config(url)).await.unwrap();
    assert!(session.is_connected());

    session.disconnect().await;
    assert!(!session.is_connected());
    // Second disconnect and post-disconnect sends must not panic or
    // reach the wire.
    session.disconnect().await;
    session.send_text("into the void");
    session.interrupt();

    let received = backend.await.unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn interrupt_reaches_the_backend() {
    let (url, backend) = spawn_backend(Vec::new()).await;
    let (mut session, _events) = Session::connect(text_only_config(url)).await.unwrap();

    session.interrupt();
    session.disconnect().await;

    let received = backend.await.unwrap();
    assert!(received.iter().any(|m| m["type"] == "interrupt"));
}

#[tokio::test]
async fn server_close_surfaces_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let (_session, mut events) = Session::connect(text_only_config(format!("ws://{}", addr)))
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    backend.await.unwrap();
}

#[tokio::test]
async fn connecting_to_a_dead_endpoint_is_a_recoverable_error() {
    // Bind and immediately drop to get a port nobody is listening on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = Session::connect(text_only_config(format!("ws://{}", addr))).await;
    assert!(matches!(
        result,
        Err(talkwire::SessionError::ConnectionFailure(_))
    ));
}
