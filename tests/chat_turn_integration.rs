//! End-to-end chat turns against a mock backend.

use careline_voice::broker::ConvoBroker;
use careline_voice::playback::NullSink;
use careline_voice::store::MessageStore;
use careline_voice::transcribe::ScriptedMic;
use careline_voice::types::MessageRole;
use careline_voice::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn broker_at(base_url: &str, chat_timeout_ms: u64) -> ConvoBroker {
    let mut config = ClientConfig::default();
    config.gateway.base_url = base_url.to_owned();
    config.gateway.chat_timeout_ms = chat_timeout_ms;
    let store = Arc::new(MessageStore::open_in_memory().expect("store"));
    ConvoBroker::new(
        &config,
        store,
        Box::new(ScriptedMic { chunks: Vec::new() }),
        Box::new(NullSink),
    )
}

fn broker_for(server: &MockServer, chat_timeout_ms: u64) -> ConvoBroker {
    broker_at(&server.uri(), chat_timeout_ms)
}

/// A backend that streams one fragment per request, then holds the chunked
/// body open until the client tears the connection down.
async fn hold_open_server(fragment: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // Read far enough to see the end of the request headers.
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let head = "HTTP/1.1 200 OK\r\n\
                            content-type: application/octet-stream\r\n\
                            transfer-encoding: chunked\r\n\r\n";
                let chunk = format!("{:x}\r\n{fragment}\r\n", fragment.len());
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                // Never send the terminating chunk; the client cancels.
                tokio::time::sleep(Duration::from_secs(600)).await;
            });
        }
    });
    format!("http://{addr}")
}

/// Poll the live view until an assistant message shows up.
async fn wait_for_assistant_reply(broker: &ConvoBroker) {
    let mut view = broker.messages().expect("view");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let has_reply = view
            .borrow_and_update()
            .iter()
            .any(|m| m.role == MessageRole::Assistant);
        if has_reply {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no assistant fragment arrived"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn chat_turn_persists_user_and_growing_assistant_message() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"response_message":"Drink plenty"}"#,
        r#"{"response_message":" of fluids.","sources":[{"id":"s1","title":"Hydration"}]}"#,
    );
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .and(body_partial_json(serde_json::json!({
            "query": { "role": "user", "content": "I have a fever" },
            "language": "en",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/octet-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let broker = broker_for(&server, 5_000);
    broker.send_chat("I have a fever").await.expect("chat turn");

    let messages = broker.messages().expect("view").borrow().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].body, "I have a fever");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].body, "Drink plenty of fluids.");
    assert_eq!(messages[1].sources.len(), 1);
    assert_eq!(messages[1].sources[0].id, "s1");

    assert!(!*broker.waiting().borrow());
    assert!(!*broker.send_timeout().borrow());
    assert!(!*broker.server_error().borrow());
}

#[tokio::test]
async fn slow_backend_latches_the_timeout_flag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"response_message":"late"}"#, "application/octet-stream")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let broker = broker_for(&server, 200);
    broker.send_chat("anyone there?").await.expect("timeout is not an error");

    assert!(*broker.send_timeout().borrow());
    assert!(!*broker.waiting().borrow());
    // Only the user message made it to the store.
    let messages = broker.messages().expect("view").borrow().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn backend_rejection_latches_the_error_flag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let broker = broker_for(&server, 5_000);
    broker.send_chat("hello").await.expect_err("rejected");

    assert!(*broker.server_error().borrow());
    assert!(!*broker.waiting().borrow());
}

#[tokio::test]
async fn next_turn_clears_latched_flags() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let broker = broker_for(&server, 5_000);
    broker.send_chat("first").await.expect_err("rejected");
    assert!(*broker.server_error().borrow());

    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"response_message":"ok"}"#, "application/octet-stream"),
        )
        .mount(&server)
        .await;

    broker.send_chat("second").await.expect("chat turn");
    assert!(!*broker.server_error().borrow());
    assert!(!*broker.send_timeout().borrow());
}

#[tokio::test]
async fn stopping_playback_ends_a_streaming_turn_cleanly() {
    let url = hold_open_server(r#"{"response_message":"One moment"}"#).await;
    let broker = broker_at(&url, 5_000);

    let turn = tokio::spawn({
        let broker = broker.clone();
        async move { broker.send_chat("hello").await }
    });
    wait_for_assistant_reply(&broker).await;

    // A user-initiated stop is a normal end of the turn: no error flag,
    // no Err, and the waiting flag is released.
    broker.stop_playing();
    turn.await.expect("turn task").expect("interrupted turn is not an error");
    assert!(!*broker.server_error().borrow());
    assert!(!*broker.send_timeout().borrow());
    assert!(!*broker.waiting().borrow());
}

#[tokio::test]
async fn new_turn_supersedes_a_streaming_one_without_clearing_its_flags() {
    let url = hold_open_server(r#"{"response_message":"still talking"}"#).await;
    let broker = broker_at(&url, 5_000);

    let first = tokio::spawn({
        let broker = broker.clone();
        async move { broker.send_chat("first").await }
    });
    wait_for_assistant_reply(&broker).await;

    let second = tokio::spawn({
        let broker = broker.clone();
        async move { broker.send_chat("second").await }
    });

    // Starting the second turn cancels the first, which settles cleanly.
    first.await.expect("first task").expect("superseded turn is not an error");

    // The second turn is still streaming; its waiting flag must survive
    // the first turn's teardown.
    assert!(*broker.waiting().borrow());
    assert!(!*broker.server_error().borrow());

    broker.stop_playing();
    second.await.expect("second task").expect("interrupted turn is not an error");
    assert!(!*broker.waiting().borrow());
}

#[tokio::test]
async fn feedback_posts_in_the_background() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/feedback"))
        .and(body_partial_json(serde_json::json!({
            "feedback_type": "thumbs_down",
            "feedback_category": "accuracy",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let broker = broker_for(&server, 5_000);
    broker.submit_feedback("thumbs_down", "accuracy", "answer was off");

    // Fire-and-forget: give the background task a moment, then let the
    // mock server's expectation verify the delivery on drop.
    tokio::time::sleep(Duration::from_millis(300)).await;
}
