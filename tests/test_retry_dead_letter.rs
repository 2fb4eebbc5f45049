//! Retry and dead-letter behavior tests

use agent_broker::testing::{FailingHandler, PanickingHandler};
use agent_broker::{
    AgentMessage, BrokerConfig, DeadLetterReason, MessageType, Priority,
};
use serde_json::json;

use test_helpers::{agent, eventually, test_broker, test_broker_with, WAIT};

fn event_to(id: &str) -> AgentMessage {
    AgentMessage::builder(agent("sender"), MessageType::Event)
        .recipient(agent(id))
        .payload(json!({"job": 1}))
        .build()
}

#[tokio::test]
async fn test_exhausted_retries_produce_one_dead_letter() {
    let broker = test_broker();
    let failing = FailingHandler::always();
    broker.register(agent("f"), failing.clone()).unwrap();
    broker.start().await.unwrap();

    assert!(broker.send(event_to("f")).await);

    let attempts = broker.config().retry_max_attempts as usize + 1;
    assert!(failing.wait_for(attempts, WAIT).await);
    assert!(eventually(WAIT, || broker.stats().messages_dead_lettered == 1).await);

    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason(), DeadLetterReason::RetriesExhausted);
    assert_eq!(dead[0].recipient(), Some("f"));
    assert_eq!(dead[0].last_error(), Some("mock handler failure"));
    assert_eq!(dead[0].message().retry_count(), 3);

    let stats = broker.stats();
    assert_eq!(stats.messages_retried, 3);
    assert_eq!(stats.messages_failed, 4);
    assert_eq!(failing.attempts(), attempts);

    broker.stop().await;
}

#[tokio::test]
async fn test_retry_attempts_carry_incremented_retry_count() {
    let broker = test_broker();
    let failing = FailingHandler::new(2);
    broker.register(agent("f"), failing.clone()).unwrap();
    broker.start().await.unwrap();

    let original = event_to("f");
    let message_id = original.message_id().to_string();
    assert!(broker.send(original).await);

    assert!(failing.wait_for(3, WAIT).await);
    let seen = failing.messages().await;
    let counts: Vec<u32> = seen.iter().map(|m| m.retry_count()).collect();
    assert_eq!(counts, vec![0, 1, 2]);
    assert!(seen.iter().all(|m| m.message_id() == message_id));
    assert!(broker.dead_letters().is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn test_panicking_handler_is_treated_as_failure() {
    let config = BrokerConfig {
        retry_max_attempts: 1,
        ..BrokerConfig::for_testing()
    };
    let broker = test_broker_with(config);
    let panicking = PanickingHandler::new();
    broker.register(agent("p"), panicking.clone()).unwrap();
    broker.start().await.unwrap();

    assert!(broker.send(event_to("p")).await);

    assert!(panicking.wait_for(2, WAIT).await);
    assert!(eventually(WAIT, || broker.dead_letters().len() == 1).await);
    let dead = broker.dead_letters();
    assert!(dead[0].last_error().unwrap_or_default().contains("panicked"));
    assert!(broker.stats().all_workers_healthy());

    broker.stop().await;
}

#[tokio::test]
async fn test_low_priority_not_retried_below_threshold() {
    let config = BrokerConfig {
        retry_min_priority: Priority::Normal,
        ..BrokerConfig::for_testing()
    };
    let broker = test_broker_with(config);
    let failing = FailingHandler::always();
    broker.register(agent("f"), failing.clone()).unwrap();
    broker.start().await.unwrap();

    let low = AgentMessage::builder(agent("sender"), MessageType::Event)
        .recipient(agent("f"))
        .priority(Priority::Low)
        .build();
    assert!(broker.send(low).await);

    assert!(eventually(WAIT, || broker.dead_letters().len() == 1).await);
    assert_eq!(failing.attempts(), 1);
    assert_eq!(broker.stats().messages_retried, 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_error_messages_are_never_retried() {
    let broker = test_broker();
    let failing = FailingHandler::always();
    broker.register(agent("f"), failing.clone()).unwrap();
    broker.start().await.unwrap();

    let error = AgentMessage::builder(agent("sender"), MessageType::Error)
        .recipient(agent("f"))
        .build();
    assert!(broker.send(error).await);

    assert!(eventually(WAIT, || broker.stats().messages_failed == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(failing.attempts(), 1);
    assert!(broker.dead_letters().is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn test_unknown_recipient_dead_lettered() {
    let broker = test_broker();
    broker.start().await.unwrap();

    assert!(broker.send(event_to("missing")).await);

    assert!(eventually(WAIT, || broker.dead_letters().len() == 1).await);
    let dead = broker.dead_letters();
    assert_eq!(dead[0].reason(), DeadLetterReason::UnknownRecipient);
    assert_eq!(dead[0].recipient(), Some("missing"));

    broker.stop().await;
}

#[tokio::test]
async fn test_dead_letter_store_is_bounded() {
    let config = BrokerConfig {
        dead_letter_max_size: 3,
        ..BrokerConfig::for_testing()
    };
    let broker = test_broker_with(config);
    broker.start().await.unwrap();

    for _ in 0..5 {
        assert!(broker.send(event_to("missing")).await);
    }

    assert!(eventually(WAIT, || broker.stats().messages_dead_lettered == 5).await);
    assert_eq!(broker.dead_letters().len(), 3);
    assert_eq!(broker.clear_dead_letters(), 3);
    assert!(broker.dead_letters().is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn test_secret_in_handler_error_is_redacted() {
    let config = BrokerConfig {
        retry_max_attempts: 0,
        ..BrokerConfig::for_testing()
    };
    let broker = test_broker_with(config);
    let failing = FailingHandler::with_error(usize::MAX, "upstream rejected api_key=sk-123456");
    broker.register(agent("f"), failing.clone()).unwrap();
    broker.start().await.unwrap();

    assert!(broker.send(event_to("f")).await);
    assert!(eventually(WAIT, || broker.dead_letters().len() == 1).await);

    let error = broker.dead_letters()[0].last_error().unwrap_or_default().to_string();
    assert!(!error.contains("sk-123456"), "secret leaked: {error}");

    broker.stop().await;
}
