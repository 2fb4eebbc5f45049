//! Broadcast delivery tests

use agent_broker::testing::{FailingHandler, RecordingHandler};
use agent_broker::{create_broadcast_message, AgentMessage, MessageType};
use serde_json::json;

use test_helpers::{agent, eventually, test_broker, WAIT};

#[tokio::test]
async fn test_broadcast_reaches_every_registered_agent_once() {
    let broker = test_broker();
    let handlers: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| {
            let handler = RecordingHandler::new();
            broker.register(agent(id), handler.clone()).unwrap();
            handler
        })
        .collect();
    broker.start().await.unwrap();

    assert!(broker.send(create_broadcast_message(&agent("a"), json!({"notice": 1}))).await);

    for handler in &handlers {
        assert!(handler.wait_for(1, WAIT).await);
    }
    // Let any stray duplicate land before counting
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    for handler in &handlers {
        assert_eq!(handler.count(), 1);
    }

    broker.stop().await;
}

#[tokio::test]
async fn test_broadcast_uses_registry_at_dequeue_time() {
    let broker = test_broker();
    let early = RecordingHandler::new();
    broker.register(agent("early"), early.clone()).unwrap();

    assert!(broker.send(create_broadcast_message(&agent("early"), json!({}))).await);

    let late = RecordingHandler::new();
    broker.register(agent("late"), late.clone()).unwrap();
    broker.start().await.unwrap();

    assert!(early.wait_for(1, WAIT).await);
    assert!(late.wait_for(1, WAIT).await);

    broker.stop().await;
}

#[tokio::test]
async fn test_message_without_recipients_is_broadcast() {
    let broker = test_broker();
    let a = RecordingHandler::new();
    let b = RecordingHandler::new();
    broker.register(agent("a"), a.clone()).unwrap();
    broker.register(agent("b"), b.clone()).unwrap();
    broker.start().await.unwrap();

    let status = AgentMessage::builder(agent("a"), MessageType::StatusUpdate)
        .payload(json!({"status": "idle"}))
        .build();
    assert!(broker.send(status).await);

    assert!(a.wait_for(1, WAIT).await);
    assert!(b.wait_for(1, WAIT).await);

    broker.stop().await;
}

#[tokio::test]
async fn test_failing_recipient_does_not_affect_others() {
    let broker = test_broker();
    let healthy = RecordingHandler::new();
    let failing = FailingHandler::new(1);
    broker.register(agent("healthy"), healthy.clone()).unwrap();
    broker.register(agent("failing"), failing.clone()).unwrap();
    broker.start().await.unwrap();

    assert!(broker.send(create_broadcast_message(&agent("x"), json!({}))).await);

    // The failing agent is retried alone; the healthy one sees the message once
    assert!(failing.wait_for(2, WAIT).await);
    assert!(eventually(WAIT, || broker.stats().messages_retried == 1).await);
    assert_eq!(healthy.count(), 1);
    assert!(broker.dead_letters().is_empty());

    broker.stop().await;
}
