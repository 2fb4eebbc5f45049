//! Request/response correlation tests
//!
//! Exercises `send_request` end to end: reply routing, timeouts, re-sent
//! envelopes, cancelled callers and late responses.

use agent_broker::testing::{EchoHandler, RecordingHandler, SlowHandler};
use agent_broker::{
    create_request_message, handler_fn, into_payload, sync_handler_fn, AgentMessage, BrokerError,
    DeadLetterReason, HandlerError, MessageType,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use test_helpers::{agent, eventually, test_broker, WAIT};

#[tokio::test]
async fn test_request_receives_handler_reply() {
    let broker = test_broker();
    broker
        .register(agent("a"), RecordingHandler::new())
        .unwrap();
    broker
        .register(
            agent("b"),
            sync_handler_fn(|message| {
                let x = message.payload()["x"].as_i64().unwrap_or_default();
                Ok(Some(into_payload(json!({ "y": x + 1 }))))
            }),
        )
        .unwrap();
    broker.start().await.unwrap();

    let request = create_request_message(&agent("a"), &agent("b"), json!({"x": 1}));
    let reply = broker.send_request(request, Duration::from_secs(1)).await.unwrap();

    assert_eq!(reply, into_payload(json!({"y": 2})));
    let stats = broker.stats();
    assert_eq!(stats.requests_completed, 1);
    assert_eq!(stats.responses_generated, 1);
    assert_eq!(stats.pending_requests, 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_response_is_not_delivered_to_requester_handler() {
    let broker = test_broker();
    let requester = RecordingHandler::new();
    broker.register(agent("a"), requester.clone()).unwrap();
    broker.register(agent("b"), EchoHandler::new()).unwrap();
    broker.start().await.unwrap();

    let request = create_request_message(&agent("a"), &agent("b"), json!({"ping": true}));
    let reply = broker.send_request(request, WAIT).await.unwrap();

    assert_eq!(reply["ping"], json!(true));
    assert_eq!(requester.count(), 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_request_times_out_without_reply() {
    let broker = test_broker();
    broker.register(agent("a"), RecordingHandler::new()).unwrap();
    let silent = RecordingHandler::new();
    broker.register(agent("b"), silent.clone()).unwrap();
    broker.start().await.unwrap();

    let request = create_request_message(&agent("a"), &agent("b"), json!({}));
    let caller_correlation_id = request.correlation_id().to_string();
    let result = broker.send_request(request, Duration::from_millis(100)).await;

    assert_eq!(silent.count(), 1);
    let correlation_id = silent.messages().await[0].correlation_id().to_string();
    assert_ne!(correlation_id, caller_correlation_id);

    match result {
        Err(BrokerError::RequestTimeout {
            correlation_id: cid,
            timeout_ms,
        }) => {
            assert_eq!(cid, correlation_id);
            assert_eq!(timeout_ms, 100);
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    let stats = broker.stats();
    assert_eq!(stats.requests_timeout, 1);
    assert_eq!(stats.pending_requests, 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_late_response_is_discarded() {
    let broker = test_broker();
    broker.register(agent("a"), RecordingHandler::new()).unwrap();
    let slow = SlowHandler::replying(Duration::from_millis(150), json!({"done": true}));
    broker.register(agent("b"), slow.clone()).unwrap();
    broker.start().await.unwrap();

    let request = create_request_message(&agent("a"), &agent("b"), json!({}));
    let result = broker.send_request(request, Duration::from_millis(30)).await;
    assert!(matches!(result, Err(BrokerError::RequestTimeout { .. })));

    assert!(eventually(WAIT, || broker.stats().late_responses == 1).await);
    assert_eq!(broker.stats().requests_completed, 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_resent_envelope_ignores_reply_to_timed_out_call() {
    let broker = test_broker();
    broker.register(agent("a"), RecordingHandler::new()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    broker
        .register(
            agent("b"),
            handler_fn(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, HandlerError>(Some(into_payload(json!({ "call": n }))))
                }
            }),
        )
        .unwrap();
    broker.start().await.unwrap();

    let request = create_request_message(&agent("a"), &agent("b"), json!({}));
    let first = broker
        .send_request(request.clone(), Duration::from_millis(50))
        .await;
    assert!(matches!(first, Err(BrokerError::RequestTimeout { .. })));

    let second = broker.send_request(request, WAIT).await.unwrap();
    assert_eq!(second["call"], json!(2));
    assert!(eventually(WAIT, || broker.stats().late_responses == 1).await);

    broker.stop().await;
}

#[tokio::test]
async fn test_requests_sharing_caller_correlation_id_resolve_independently() {
    let broker = test_broker();
    broker.register(agent("a"), RecordingHandler::new()).unwrap();
    broker.register(agent("b"), EchoHandler::new()).unwrap();
    broker.start().await.unwrap();

    let build = |n: i64| {
        AgentMessage::builder(agent("a"), MessageType::Request)
            .recipient(agent("b"))
            .correlation_id("shared-cid")
            .payload(json!({ "n": n }))
            .build()
    };

    let (first, second) = tokio::join!(
        broker.send_request(build(1), WAIT),
        broker.send_request(build(2), WAIT)
    );
    assert_eq!(first.unwrap()["n"], json!(1));
    assert_eq!(second.unwrap()["n"], json!(2));

    broker.stop().await;
}

#[tokio::test]
async fn test_aborted_request_leaves_no_pending_entry() {
    let broker = test_broker();
    let request = create_request_message(&agent("a"), &agent("b"), json!({}));

    let waiting = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.send_request(request, Duration::from_secs(60)).await })
    };
    assert!(eventually(WAIT, || broker.stats().pending_requests == 1).await);

    waiting.abort();
    assert!(waiting.await.unwrap_err().is_cancelled());
    assert_eq!(broker.stats().pending_requests, 0);
    assert_eq!(broker.stats().requests_timeout, 0);
}

#[tokio::test]
async fn test_request_to_unknown_agent_dead_letters_and_times_out() {
    let broker = test_broker();
    broker.register(agent("a"), RecordingHandler::new()).unwrap();
    broker.start().await.unwrap();

    let request = create_request_message(&agent("a"), &agent("ghost"), json!({}));
    let result = broker.send_request(request, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(BrokerError::RequestTimeout { .. })));

    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason(), DeadLetterReason::UnknownRecipient);
    assert_eq!(dead[0].recipient(), Some("ghost"));

    broker.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let broker = test_broker();
    broker.register(agent("client"), RecordingHandler::new()).unwrap();
    broker.register(agent("echo"), EchoHandler::new()).unwrap();
    broker.start().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            let request = create_request_message(&agent("client"), &agent("echo"), json!({"i": i}));
            broker.send_request(request, WAIT).await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply["i"], json!(i));
    }
    assert_eq!(broker.stats().requests_completed, 20);

    broker.stop().await;
}

#[tokio::test]
async fn test_send_request_default_uses_configured_timeout() {
    let broker = test_broker();
    broker.register(agent("a"), RecordingHandler::new()).unwrap();
    broker.register(agent("b"), EchoHandler::new()).unwrap();
    broker.start().await.unwrap();

    let request = create_request_message(&agent("a"), &agent("b"), json!({"k": "v"}));
    let reply = broker.send_request_default(request).await.unwrap();
    assert_eq!(reply["k"], json!("v"));

    broker.stop().await;
}
