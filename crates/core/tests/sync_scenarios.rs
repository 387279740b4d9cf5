use std::sync::Arc;
use std::time::Duration;

use palaver_client::{HttpTransport, ServiceConfig, SessionClient};
use palaver_core::{
    ChatEngine, DEFAULT_MAX_POLL_FAILURES, EngineConfig, StopReason, TranscriptEvent,
};
use palaver_storage::{DeliveryStatus, MemoryPersistence, SessionPersistence};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "albert-chat-session-id";

fn engine_for(
    server: &MockServer,
    persistence: Arc<dyn SessionPersistence>,
) -> (ChatEngine, UnboundedReceiver<TranscriptEvent>) {
    let config = ServiceConfig::new(server.uri()).with_poll_interval(Duration::from_millis(20));
    let client = SessionClient::new(config, Arc::new(HttpTransport::new(server.uri())), persistence);
    ChatEngine::new(EngineConfig::default(), client)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition was not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain(events: &mut UnboundedReceiver<TranscriptEvent>) -> Vec<TranscriptEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn send_reply_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "abc" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/info/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [
                { "role": "user", "text": "Hi" },
                { "role": "agent", "text": "Hello" }
            ],
            "running": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let persistence = Arc::new(MemoryPersistence::new());
    let (engine, mut events) = engine_for(&server, persistence.clone());

    let sender = engine.clone();
    let send = tokio::spawn(async move { sender.send("Hi").await });

    wait_until(|| engine.message_count() == 1).await;
    let optimistic = engine.message(0).unwrap();
    assert_eq!(optimistic.status, Some(DeliveryStatus::Pending));
    assert!(optimistic.local_only);

    send.await.unwrap().unwrap();
    wait_until(|| engine.message_count() == 2 && !engine.is_awaiting_agent()).await;

    let messages = engine.messages();
    assert_eq!(messages[0].content, "Hi");
    assert_eq!(messages[0].status, Some(DeliveryStatus::Sent));
    assert!(!messages[0].local_only);
    assert_eq!(messages[1].content, "Hello");
    assert!(!messages[1].is_streaming_placeholder);
    assert!(!engine.is_polling());
    assert_eq!(engine.typing_anchor(), None);
    assert_eq!(persistence.load(KEY).unwrap().as_deref(), Some("abc"));
    assert!(drain(&mut events).contains(&TranscriptEvent::PollingStopped {
        reason: StopReason::Idle
    }));
}

#[tokio::test]
async fn streamed_reply_is_continued_from_the_text_offset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info/abc"))
        .and(query_param("offsetHistory", "0"))
        .and(query_param("offsetText", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [{ "role": "agent", "text": "lo" }],
            "running": false
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/info/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [{ "role": "agent", "text": "Hel" }],
            "offsets": { "history": 0, "text": 3 },
            "running": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, _events) = engine_for(&server, Arc::new(MemoryPersistence::with_entry(KEY, "abc")));

    assert!(engine.resume().await);
    wait_until(|| !engine.is_awaiting_agent()).await;

    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello");
    assert!(!messages[0].is_streaming_placeholder);
    assert!(!engine.is_polling());
}

#[tokio::test]
async fn expired_session_resets_the_transcript_and_reinitializes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info/stale"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [{ "role": "agent", "text": "Welcome back" }],
            "running": true
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/info/stale"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "fresh" })))
        .expect(1)
        .mount(&server)
        .await;

    let persistence = Arc::new(MemoryPersistence::with_entry(KEY, "stale"));
    let (engine, mut events) = engine_for(&server, persistence.clone());

    assert!(engine.resume().await);
    assert_eq!(engine.message_count(), 1);

    wait_until(|| engine.client().session_id().as_deref() == Some("fresh")).await;

    assert_eq!(engine.message_count(), 0);
    assert!(!engine.is_awaiting_agent());
    assert!(!engine.is_polling());
    assert_eq!(persistence.load(KEY).unwrap().as_deref(), Some("fresh"));

    let events = drain(&mut events);
    assert!(events.contains(&TranscriptEvent::Cleared));
    assert!(events.contains(&TranscriptEvent::PollingStopped {
        reason: StopReason::SessionExpired
    }));
}

#[tokio::test]
async fn repeated_fetch_failures_stop_polling_with_a_notice() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [{ "role": "agent", "text": "Thinking" }],
            "running": true
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/info/abc"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (engine, mut events) = engine_for(&server, Arc::new(MemoryPersistence::with_entry(KEY, "abc")));

    assert!(engine.resume().await);
    assert!(engine.is_awaiting_agent());

    wait_until(|| !engine.is_awaiting_agent()).await;

    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_local_notice());
    assert_eq!(messages[1].content, engine.config().texts.connection_lost);
    assert!(!messages[0].is_streaming_placeholder);
    assert_eq!(engine.tool_call_anchor(), None);
    assert!(!engine.is_polling());
    assert_eq!(engine.client().session_id().as_deref(), Some("abc"));
    assert_eq!(
        engine.client().poll_failure_count(),
        DEFAULT_MAX_POLL_FAILURES
    );

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1 + DEFAULT_MAX_POLL_FAILURES as usize);
    assert!(drain(&mut events).contains(&TranscriptEvent::PollingStopped {
        reason: StopReason::FailureCeiling
    }));
}

#[tokio::test]
async fn concurrent_refreshes_issue_one_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info/abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "history": [{ "role": "agent", "text": "Hi there" }],
                    "running": false
                }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (engine, _events) = engine_for(&server, Arc::new(MemoryPersistence::with_entry(KEY, "abc")));
    engine.client().load_persisted_session();

    tokio::join!(engine.refresh(), engine.refresh());

    assert_eq!(engine.message_count(), 1);
    assert_eq!(engine.messages()[0].content, "Hi there");
}
