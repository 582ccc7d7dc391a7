//! Transport channel tests against the in-process loopback server

use std::sync::Arc;
use std::time::Duration;

use bookchat_transport::{
    ConnectionState, ConversationSummaryDelta, LoopbackServer, Message, MessageBody, Topic,
    TransportChannel, TransportError, TransportEvent,
};
use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;

fn text_message(conversation: &str, id: &str, sender: &str, text: &str) -> Message {
    Message {
        message_id: id.to_string(),
        conversation_id: conversation.to_string(),
        sender_id: sender.to_string(),
        sender_name: Some(sender.to_string()),
        sender_avatar: None,
        body: MessageBody::Text {
            content: text.to_string(),
        },
        is_read: false,
        created_at: Utc::now(),
    }
}

async fn next_event(events: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("Timed out waiting for transport event")
        .expect("Event channel closed")
}

async fn expect_state(events: &mut UnboundedReceiver<TransportEvent>, expected: ConnectionState) {
    match next_event(events).await {
        TransportEvent::Connection(state) => assert_eq!(state, expected),
        other => panic!("Expected connection event, got {:?}", other),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connected_channel() -> (
    LoopbackServer,
    TransportChannel,
    UnboundedReceiver<TransportEvent>,
) {
    init_tracing();
    let server = LoopbackServer::new();
    let (channel, mut events) = TransportChannel::new(Arc::new(server.clone()));
    channel.connect().await.expect("Failed to connect");
    expect_state(&mut events, ConnectionState::Connecting).await;
    expect_state(&mut events, ConnectionState::Connected).await;
    (server, channel, events)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
}

#[tokio::test]
async fn test_connect_transitions_to_connected() {
    let (server, channel, _events) = connected_channel().await;
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert!(channel.connection_id().is_some());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_repeated_connect_does_not_redial() {
    let (server, channel, mut events) = connected_channel().await;

    channel.connect().await.expect("Second connect should succeed");
    expect_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(server.dial_count(), 1);
}

#[tokio::test]
async fn test_failed_dial_reports_error_and_allows_retry() {
    let server = LoopbackServer::new();
    server.fail_next_dials(1);
    let (channel, mut events) = TransportChannel::new(Arc::new(server.clone()));

    let result = channel.connect().await;
    assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    expect_state(&mut events, ConnectionState::Connecting).await;
    assert!(matches!(next_event(&mut events).await, TransportEvent::Error(_)));
    expect_state(&mut events, ConnectionState::Error).await;
    assert_eq!(channel.state(), ConnectionState::Error);

    channel.connect().await.expect("Retry should succeed");
    expect_state(&mut events, ConnectionState::Connecting).await;
    expect_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(server.dial_count(), 2);
}

#[tokio::test]
async fn test_subscribe_requires_connection() {
    let server = LoopbackServer::new();
    let (channel, _events) = TransportChannel::new(Arc::new(server));

    let result = channel.subscribe(Topic::Conversation("c1".to_string())).await;
    assert!(matches!(result, Err(TransportError::NotConnected)));
}

#[tokio::test]
async fn test_message_event_delivered_to_observer() {
    let (server, channel, mut events) = connected_channel().await;
    let _subscription = channel
        .subscribe(Topic::Conversation("c1".to_string()))
        .await
        .expect("Failed to subscribe");
    assert_eq!(server.subscriptions(), vec!["/topic/conversation/c1"]);

    let message = text_message("c1", "m1", "alice", "hi");
    assert_eq!(server.publish_message(&message), 1);

    match next_event(&mut events).await {
        TransportEvent::Message {
            conversation_id,
            message: received,
        } => {
            assert_eq!(conversation_id, "c1");
            assert_eq!(received, message);
        }
        other => panic!("Wrong event type: {:?}", other),
    }
}

#[tokio::test]
async fn test_summary_event_delivered_to_observer() {
    let (server, channel, mut events) = connected_channel().await;
    let _subscription = channel
        .subscribe(Topic::Summary("u1".to_string()))
        .await
        .expect("Failed to subscribe");

    let delta = ConversationSummaryDelta {
        conversation_id: "c9".to_string(),
        sender_id: "u2".to_string(),
        last_message: Some("see you".to_string()),
        last_message_time: Some(Utc::now()),
        unread_count: Some(12),
    };
    server.publish_summary("u1", &delta);

    match next_event(&mut events).await {
        TransportEvent::Summary {
            participant_id,
            delta: received,
        } => {
            assert_eq!(participant_id, "u1");
            assert_eq!(received, delta);
        }
        other => panic!("Wrong event type: {:?}", other),
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (server, channel, mut events) = connected_channel().await;
    let topic = Topic::Conversation("c1".to_string());
    let subscription = channel.subscribe(topic.clone()).await.unwrap();

    subscription.unsubscribe();
    assert!(channel.active_topics().is_empty());
    wait_until(|| server.subscriber_count(&topic) == 0).await;

    assert_eq!(server.publish_message(&text_message("c1", "m1", "a", "x")), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_dropping_subscription_releases_it() {
    let (server, channel, _events) = connected_channel().await;
    let topic = Topic::Summary("u1".to_string());
    {
        let _subscription = channel.subscribe(topic.clone()).await.unwrap();
        assert_eq!(server.subscriber_count(&topic), 1);
    }
    wait_until(|| server.subscriber_count(&topic) == 0).await;
}

#[tokio::test]
async fn test_malformed_payload_is_dropped() {
    let (server, channel, mut events) = connected_channel().await;
    let _subscription = channel
        .subscribe(Topic::Conversation("c1".to_string()))
        .await
        .unwrap();

    // IMAGE without an image reference violates the message invariant
    server.publish_raw(
        "/topic/conversation/c1",
        serde_json::json!({
            "messageId": "bad",
            "conversationId": "c1",
            "senderId": "a",
            "messageType": "IMAGE",
            "createdAt": "2024-01-01T00:00:00Z"
        }),
    );
    let good = text_message("c1", "m2", "a", "fine");
    server.publish_message(&good);

    match next_event(&mut events).await {
        TransportEvent::Message { message, .. } => assert_eq!(message.message_id, "m2"),
        other => panic!("Wrong event type: {:?}", other),
    }
}

#[tokio::test]
async fn test_server_drop_reports_disconnected() {
    let (server, channel, mut events) = connected_channel().await;
    let _subscription = channel
        .subscribe(Topic::Summary("u1".to_string()))
        .await
        .unwrap();

    server.drop_connections();
    expect_state(&mut events, ConnectionState::Disconnected).await;
    assert!(channel.active_topics().is_empty());

    let result = channel.subscribe(Topic::Summary("u1".to_string())).await;
    assert!(matches!(result, Err(TransportError::NotConnected)));
}

#[tokio::test]
async fn test_broken_connection_reports_error() {
    let (server, _channel, mut events) = connected_channel().await;

    server.break_connections("reset by peer");
    assert!(matches!(next_event(&mut events).await, TransportEvent::Error(_)));
    expect_state(&mut events, ConnectionState::Error).await;
}

#[tokio::test]
async fn test_stale_subscription_is_inert_after_reconnect() {
    let (server, channel, mut events) = connected_channel().await;
    let topic = Topic::Summary("u1".to_string());
    let stale = channel.subscribe(topic.clone()).await.unwrap();

    channel.disconnect();
    expect_state(&mut events, ConnectionState::Disconnected).await;
    channel.connect().await.unwrap();
    expect_state(&mut events, ConnectionState::Connecting).await;
    expect_state(&mut events, ConnectionState::Connected).await;

    let fresh = channel.subscribe(topic.clone()).await.unwrap();
    drop(stale);

    assert_eq!(channel.active_topics(), vec![topic.clone()]);
    wait_until(|| server.subscriber_count(&topic) == 1).await;
    assert_eq!(fresh.topic(), &topic);
}

#[tokio::test]
async fn test_server_error_frame_surfaces() {
    let (server, _channel, mut events) = connected_channel().await;
    server.broadcast_error("quota exceeded");

    match next_event(&mut events).await {
        TransportEvent::Error(message) => assert_eq!(message, "quota exceeded"),
        other => panic!("Wrong event type: {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_is_safe_in_any_state() {
    let server = LoopbackServer::new();
    let (channel, mut events) = TransportChannel::new(Arc::new(server.clone()));

    channel.disconnect();
    expect_state(&mut events, ConnectionState::Disconnected).await;

    channel.connect().await.unwrap();
    expect_state(&mut events, ConnectionState::Connecting).await;
    expect_state(&mut events, ConnectionState::Connected).await;
    channel.disconnect();
    expect_state(&mut events, ConnectionState::Disconnected).await;
    wait_until(|| server.connection_count() == 0).await;
}
