//! End-to-end voice turns: recording, live transcription, streamed
//! response with audio, and the mic state round trip.

use base64::Engine;
use careline_voice::broker::ConvoBroker;
use careline_voice::playback::NullSink;
use careline_voice::store::MessageStore;
use careline_voice::transcribe::ScriptedMic;
use careline_voice::types::{MessageRole, MicState};
use careline_voice::ClientConfig;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A minimal PCM WAV container around the given samples.
fn wav_bytes(samples: &[i16], rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Transcription server that answers binary audio with a partial
/// transcript and the completion sentinel with the final one.
async fn spawn_transcription_server(final_text: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let ws = tokio_tungstenite::accept_async(socket).await.expect("handshake");
        let (mut sink, mut stream) = ws.split();
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                WsMessage::Binary(_) => {
                    let frame = format!(r#"{{"text":"par","is_final":false}}"#);
                    sink.send(WsMessage::Text(frame)).await.expect("partial");
                }
                WsMessage::Text(text) if text == "completed" => {
                    let frame = format!(r#"{{"text":"{final_text}","is_final":true}}"#);
                    sink.send(WsMessage::Text(frame)).await.expect("final");
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });
    format!("ws://{addr}")
}

async fn voice_broker(gateway: &MockServer, ws_url: String) -> ConvoBroker {
    let mut config = ClientConfig::default();
    config.gateway.base_url = gateway.uri();
    config.transcribe.url = ws_url;
    config.transcribe.finish_timeout_ms = 5_000;
    let store = Arc::new(MessageStore::open_in_memory().expect("store"));
    ConvoBroker::new(
        &config,
        store,
        Box::new(ScriptedMic {
            chunks: vec![vec![0.2_f32; 512]; 4],
        }),
        Box::new(NullSink),
    )
}

#[tokio::test]
async fn voice_turn_round_trip() {
    let clip = base64::engine::general_purpose::STANDARD
        .encode(wav_bytes(&[2_000; 800], 16_000)); // 50ms of tone
    let body = format!(
        concat!(
            r#"{{"query_message":"what is dengue"}}"#,
            r#"{{"response_message":"Dengue is a viral","audio_base64":"{clip}"}}"#,
            r#"{{"response_message":" infection."}}"#,
        ),
        clip = clip
    );

    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/voice"))
        .and(body_partial_json(serde_json::json!({
            "query": { "role": "user", "content": "what is dengue" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/octet-stream"))
        .expect(1)
        .mount(&gateway)
        .await;

    let ws_url = spawn_transcription_server("what is dengue").await;
    let broker = voice_broker(&gateway, ws_url).await;

    broker.start_recording().expect("start");
    assert!(broker.is_recording());
    assert_eq!(*broker.mic_state().borrow(), MicState::Active);

    // Let a few PCM frames and partial transcripts round-trip.
    tokio::time::sleep(Duration::from_millis(300)).await;
    broker.finish_and_send().await;

    let messages = broker.messages().expect("view").borrow().clone();
    assert_eq!(messages.len(), 2, "one user and one assistant message");
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].body, "what is dengue");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].body, "Dengue is a viral infection.");

    assert!(!broker.is_recording());
    assert!(!*broker.waiting().borrow());
    assert_eq!(*broker.mic_state().borrow(), MicState::Pending);

    // The decoded clip drains through the playback queue.
    let mut playing = broker.playing();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *playing.borrow() {
            playing.changed().await.expect("playing channel");
        }
    })
    .await
    .expect("playback finishes");
}

#[tokio::test]
async fn silent_recording_sends_no_turn() {
    let gateway = MockServer::start().await;
    // No /voice mock mounted: any request would 404 and latch the error
    // flag, which the assertions below would catch.
    let ws_url = spawn_transcription_server("").await;
    let broker = voice_broker(&gateway, ws_url).await;

    broker.start_recording().expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;
    broker.finish_and_send().await;

    assert!(broker.messages().expect("view").borrow().is_empty());
    assert!(!*broker.server_error().borrow());
    assert_eq!(*broker.mic_state().borrow(), MicState::Pending);
}

#[tokio::test]
async fn mic_button_cycles_through_recording() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/voice"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"response_message":"Noted."}"#, "application/octet-stream"),
        )
        .mount(&gateway)
        .await;

    let ws_url = spawn_transcription_server("remember this").await;
    let broker = voice_broker(&gateway, ws_url).await;

    // First press: start recording.
    broker.handle_mic_button_click().await;
    assert_eq!(*broker.mic_state().borrow(), MicState::Active);

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second press: finish, send, and return to Pending.
    broker.handle_mic_button_click().await;
    assert_eq!(*broker.mic_state().borrow(), MicState::Pending);
    assert!(!*broker.waiting().borrow());

    let messages = broker.messages().expect("view").borrow().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].body, "Noted.");
}
