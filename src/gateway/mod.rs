//! Backend gateway: streaming chat/voice turns, feedback and TTS requests.
//!
//! Turn responses arrive as chunked bodies of concatenated JSON fragments
//! (see [`decode`]). Each streaming call returns a [`StreamingTurn`] handle:
//! a push-style observable ([`tokio::sync::watch`]) whose value grows until
//! the transport completes, plus a cancellation token that tears the
//! subscription down early. A time-to-first-fragment timeout races each
//! stream; the timer is disarmed by the first successfully decoded fragment
//! and, if it fires, the accumulator's status becomes
//! [`ResponseStatus::Timeout`] and the transport is dropped.

pub mod api;
pub mod decode;

use crate::config::GatewayConfig;
use crate::error::{BrokerError, Result};
use crate::types::{Feedback, Message, Profile};
use api::{
    to_api_profile, to_chat_history, to_feedback_request, ApiChatRequest, ApiQuery,
    ApiSpeechRequest, ApiStreamFragment, ApiVoiceRequest,
};
use decode::{parse_fragments, ChatTurn, FragmentSplitter, ResponseStatus, VoiceTurn};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle to one in-flight streaming turn.
///
/// Dropping the handle does not cancel the underlying request; call
/// [`StreamingTurn::cancel`] (idempotent) to tear it down early. When the
/// background task finishes for any reason the `watch` channel closes, which
/// subscribers observe as a terminal signal.
pub struct StreamingTurn<T> {
    rx: watch::Receiver<T>,
    cancel: CancellationToken,
}

impl<T: Clone> StreamingTurn<T> {
    /// Subscribe to accumulator updates.
    pub fn updates(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }

    /// Cancel the in-flight subscription. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled together with this turn.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Accumulator contract shared by voice and chat turns.
trait Accumulate: Clone + Default + Send + Sync + 'static {
    fn absorb(&mut self, fragment: &ApiStreamFragment);
    fn finish(&mut self, status: ResponseStatus);
}

impl Accumulate for VoiceTurn {
    fn absorb(&mut self, fragment: &ApiStreamFragment) {
        VoiceTurn::absorb(self, fragment);
    }
    fn finish(&mut self, status: ResponseStatus) {
        if self.status == ResponseStatus::Pending {
            self.status = status;
        }
    }
}

impl Accumulate for ChatTurn {
    fn absorb(&mut self, fragment: &ApiStreamFragment) {
        ChatTurn::absorb(self, fragment);
    }
    fn finish(&mut self, status: ResponseStatus) {
        if self.status == ResponseStatus::Pending {
            self.status = status;
        }
    }
}

/// HTTP client for the assistant backend.
pub struct GatewayClient {
    base_url: String,
    client: reqwest::Client,
    voice_timeout: Duration,
    chat_timeout: Duration,
}

impl GatewayClient {
    /// Create a new gateway client.
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
            voice_timeout: Duration::from_millis(config.voice_timeout_ms),
            chat_timeout: Duration::from_millis(config.chat_timeout_ms),
        }
    }

    /// Open a streaming voice-turn request seeded with a transcript.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the backend responds
    /// with a non-success status. Mid-stream failures are reported through
    /// the returned handle instead.
    pub async fn send_voice(
        &self,
        transcript: &str,
        profile: &Profile,
        history: &[Message],
        language: &str,
    ) -> Result<StreamingTurn<VoiceTurn>> {
        let body = ApiVoiceRequest {
            chat_history: to_chat_history(history),
            profile: to_api_profile(profile),
            query: ApiQuery {
                role: "user".into(),
                content: transcript.to_owned(),
            },
            language: language.to_owned(),
        };
        self.start_stream("/voice", &body, self.voice_timeout).await
    }

    /// Open a streaming chat-turn request.
    ///
    /// # Errors
    ///
    /// Same contract as [`GatewayClient::send_voice`].
    pub async fn send_chat(
        &self,
        text: &str,
        profile: &Profile,
        history: &[Message],
        language: &str,
    ) -> Result<StreamingTurn<ChatTurn>> {
        let body = ApiChatRequest {
            chat_history: to_chat_history(history),
            profile: to_api_profile(profile),
            query: ApiQuery {
                role: "user".into(),
                content: text.to_owned(),
            },
            language: language.to_owned(),
        };
        self.start_stream("/chat/stream", &body, self.chat_timeout)
            .await
    }

    /// Submit user feedback with its chat history snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure or non-success status.
    pub async fn send_feedback(&self, feedback: &Feedback, profile: &Profile) -> Result<()> {
        let body = to_feedback_request(feedback, profile);
        let url = format!("{}/feedback", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Gateway(format!("connection error: {e}")))?;

        if !response.status().is_success() {
            return Err(BrokerError::Gateway(format!(
                "feedback rejected: {}",
                response.status()
            )));
        }
        debug!("feedback submitted");
        Ok(())
    }

    /// Synthesize speech for previously generated text.
    ///
    /// Returns the raw audio payload for the playback sequencer.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure or non-success status.
    pub async fn text_to_speech(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{}/speech", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ApiSpeechRequest { text: text.into() })
            .send()
            .await
            .map_err(|e| BrokerError::Gateway(format!("connection error: {e}")))?;

        if !response.status().is_success() {
            return Err(BrokerError::Gateway(format!(
                "speech request rejected: {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BrokerError::Gateway(format!("failed to read audio body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn start_stream<T: Accumulate, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        first_fragment_timeout: Duration,
    ) -> Result<StreamingTurn<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, url = %url, "turn request failed");
                BrokerError::Gateway(format!("connection error: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read body".into());
            error!(status = %status, body = %text, "turn request returned error");
            return Err(BrokerError::Gateway(format!("{status}: {text}")));
        }

        info!(url = %url, "turn stream starting");

        let (tx, rx) = watch::channel(T::default());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let byte_stream = response.bytes_stream().boxed();
        tokio::spawn(pump_stream(
            byte_stream,
            tx,
            task_cancel,
            first_fragment_timeout,
        ));

        Ok(StreamingTurn { rx, cancel })
    }
}

/// Drive one response stream to completion, publishing accumulator updates.
///
/// Exits on: cancellation (accumulator untouched), timeout before the first
/// decoded fragment (status `Timeout`), transport error (left `Pending` —
/// the channel closing is the terminal signal), or natural end of stream
/// (status `Done`). Each exit path runs exactly once.
async fn pump_stream<T, B, E>(
    mut byte_stream: impl Stream<Item = std::result::Result<B, E>> + Unpin,
    tx: watch::Sender<T>,
    cancel: CancellationToken,
    first_fragment_timeout: Duration,
) where
    T: Accumulate,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut splitter = FragmentSplitter::new();
    let mut turn = T::default();
    let deadline = tokio::time::sleep(first_fragment_timeout);
    tokio::pin!(deadline);
    let mut decoded_any = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("turn stream cancelled");
                return;
            }
            _ = &mut deadline, if !decoded_any => {
                warn!("no fragment decoded within timeout window");
                turn.finish(ResponseStatus::Timeout);
                tx.send_replace(turn);
                return;
            }
            next = byte_stream.next() => match next {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(chunk.as_ref());
                    let fragments = parse_fragments(&splitter.push(&text));
                    if fragments.is_empty() {
                        continue;
                    }
                    decoded_any = true;
                    for fragment in &fragments {
                        turn.absorb(fragment);
                    }
                    tx.send_replace(turn.clone());
                }
                Some(Err(e)) => {
                    error!(error = %e, "turn stream transport error");
                    return;
                }
                None => {
                    turn.finish(ResponseStatus::Done);
                    tx.send_replace(turn);
                    debug!("turn stream complete");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    fn ok_chunk(s: &str) -> std::result::Result<Vec<u8>, Infallible> {
        Ok(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn stream_end_marks_done_with_concatenated_text() {
        let chunks = stream::iter(vec![
            ok_chunk(r#"{"response_message":"You should"}"#),
            ok_chunk(r#"{"response_message":" consult a doctor.","audio_base64":"QUJD"}"#),
        ]);
        let (tx, rx) = watch::channel(VoiceTurn::default());
        pump_stream(
            chunks,
            tx,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await;

        let turn = rx.borrow().clone();
        assert_eq!(turn.status, ResponseStatus::Done);
        assert_eq!(turn.assistant_text, "You should consult a doctor.");
        assert_eq!(turn.audio_clips, vec!["QUJD".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_when_no_fragment_arrives() {
        let forever = stream::pending::<std::result::Result<Vec<u8>, Infallible>>();
        let (tx, rx) = watch::channel(ChatTurn::default());
        pump_stream(
            forever,
            tx,
            CancellationToken::new(),
            Duration::from_millis(5_000),
        )
        .await;

        let turn = rx.borrow().clone();
        assert_eq!(turn.status, ResponseStatus::Timeout);
        assert!(!turn.has_content());
    }

    #[tokio::test]
    async fn transport_error_leaves_status_pending() {
        let failing = stream::iter(vec![
            Ok(br#"{"response_message":"partial"}"#.to_vec()),
            Err("connection reset"),
        ]);
        let (tx, rx) = watch::channel(ChatTurn::default());
        pump_stream(
            failing,
            tx,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await;

        let turn = rx.borrow().clone();
        assert_eq!(turn.status, ResponseStatus::Pending);
        assert_eq!(turn.text, "partial");
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump() {
        let forever = stream::pending::<std::result::Result<Vec<u8>, Infallible>>();
        let (tx, rx) = watch::channel(ChatTurn::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Idempotent: cancelling again is a no-op.
        cancel.cancel();
        pump_stream(forever, tx, cancel, Duration::from_secs(5)).await;

        assert_eq!(rx.borrow().status, ResponseStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn first_decoded_fragment_disarms_the_timeout() {
        // One fragment arrives immediately, then the stream stays open
        // longer than the timeout window. The turn must not time out.
        let chunks = stream::iter(vec![ok_chunk(r#"{"response_message":"hi"}"#)])
            .chain(stream::pending());
        let (tx, rx) = watch::channel(ChatTurn::default());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let pump = tokio::spawn(pump_stream(
            chunks.boxed(),
            tx,
            cancel,
            Duration::from_millis(1_000),
        ));

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        let turn = rx.borrow().clone();
        assert_eq!(turn.status, ResponseStatus::Pending);
        assert_eq!(turn.text, "hi");

        canceller.cancel();
        pump.await.expect("pump task");
    }
}
