//! Conversation broker: the single owner of mic, playback and turn state.
//!
//! The broker mediates every interaction of a conversation session. It holds
//! the authoritative [`MicState`], the waiting/timeout/error flags the UI
//! renders, and the cancellation token of the in-flight turn. All state is
//! published through [`tokio::sync::watch`] channels so observers see the
//! latest value on subscribe and every change after.
//!
//! A voice turn runs: record → final transcript → streaming voice request →
//! persist growing assistant message → queue newly arrived audio clips →
//! terminal status. Only one turn is in flight at a time; starting a new one
//! cancels its predecessor, and the waiting flag is cleared exactly once per
//! turn no matter how the turn ends.

use crate::config::ClientConfig;
use crate::error::{BrokerError, Result};
use crate::gateway::decode::{ResponseStatus, VoiceTurn};
use crate::gateway::GatewayClient;
use crate::playback::{AudioClip, AudioSink, CpalSink, PlaybackSequencer};
use crate::store::MessageStore;
use crate::transcribe::{AudioInput, CpalMic, Transcriber, Utterance};
use crate::types::{
    new_id, now_millis, ChatMode, Feedback, Message, MessageRole, MessageSource, MicState,
    Profile, SessionContext, VoiceActivity,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How many recent messages are sent as turn context.
const HISTORY_LIMIT: usize = 8;

struct BrokerInner {
    store: Arc<MessageStore>,
    gateway: GatewayClient,
    playback: PlaybackSequencer,
    transcriber: Transcriber,
    session: Mutex<SessionContext>,
    mic_state: watch::Sender<MicState>,
    /// True from the moment a turn request starts until it ends.
    waiting: watch::Sender<bool>,
    /// Latched when the last turn timed out before its first fragment.
    send_timeout: watch::Sender<bool>,
    /// Latched when the last turn failed at the transport or backend.
    server_error: watch::Sender<bool>,
    active_turn: Mutex<Option<ActiveTurn>>,
    turn_seq: AtomicU64,
    cues: Mutex<RecordingCues>,
}

/// The one turn currently owning the waiting flag. The id keys teardown:
/// a superseded or cancelled turn finds its id gone and leaves the
/// successor's state alone.
struct ActiveTurn {
    id: u64,
    /// Set once the gateway stream is open; a turn cancelled before that
    /// point is torn down at registration instead.
    token: Option<CancellationToken>,
}

/// Optional earcons played when recording starts and stops.
#[derive(Default)]
struct RecordingCues {
    start: Option<AudioClip>,
    stop: Option<AudioClip>,
}

/// Cheaply cloneable handle to one conversation session.
#[derive(Clone)]
pub struct ConvoBroker {
    inner: Arc<BrokerInner>,
}

impl ConvoBroker {
    /// Build a broker over explicit audio endpoints. Tests and headless
    /// runs pass [`crate::transcribe::ScriptedMic`] and
    /// [`crate::playback::NullSink`] here.
    pub fn new(
        config: &ClientConfig,
        store: Arc<MessageStore>,
        input: Box<dyn AudioInput>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        let mut session = SessionContext::new(Profile::general());
        session.language = config.preferences.language.clone();
        session.chat_mode = config.preferences.chat_mode;
        session.voice_detect_start = config.preferences.voice_detect_start;
        session.voice_detect_end = config.preferences.voice_detect_end;
        session.voice_detect_interrupt = config.preferences.voice_detect_interrupt;

        let transcriber =
            Transcriber::new(config.transcribe.clone(), Arc::clone(&store), input);
        Self {
            inner: Arc::new(BrokerInner {
                store,
                gateway: GatewayClient::new(&config.gateway),
                playback: PlaybackSequencer::new(sink),
                transcriber,
                session: Mutex::new(session),
                mic_state: watch::channel(MicState::Pending).0,
                waiting: watch::channel(false).0,
                send_timeout: watch::channel(false).0,
                server_error: watch::channel(false).0,
                active_turn: Mutex::new(None),
                turn_seq: AtomicU64::new(0),
                cues: Mutex::new(RecordingCues::default()),
            }),
        }
    }

    /// Build a broker over the system microphone and speakers.
    ///
    /// # Errors
    ///
    /// Returns an error if either audio device cannot be opened.
    pub fn with_default_devices(config: &ClientConfig, store: Arc<MessageStore>) -> Result<Self> {
        let mic = CpalMic::new(&config.audio)?;
        let sink = CpalSink::new(&config.audio)?;
        Ok(Self::new(config, store, Box::new(mic), Box::new(sink)))
    }

    // ---- observable state ----

    pub fn mic_state(&self) -> watch::Receiver<MicState> {
        self.inner.mic_state.subscribe()
    }

    pub fn waiting(&self) -> watch::Receiver<bool> {
        self.inner.waiting.subscribe()
    }

    pub fn send_timeout(&self) -> watch::Receiver<bool> {
        self.inner.send_timeout.subscribe()
    }

    pub fn server_error(&self) -> watch::Receiver<bool> {
        self.inner.server_error.subscribe()
    }

    pub fn playing(&self) -> watch::Receiver<bool> {
        self.inner.playback.playing()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.transcriber.is_recording()
    }

    /// Live message view for the active profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn messages(&self) -> Result<watch::Receiver<Vec<Message>>> {
        let profile_id = self.session_snapshot().0.id;
        self.inner.store.load(&profile_id)
    }

    // ---- session mutation ----

    /// Switch the active profile, falling back to the reserved general
    /// profile when `id` is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub fn set_active_profile_id(&self, id: &str) -> Result<()> {
        let profile = match self.inner.store.get_profile(id)? {
            Some(profile) => profile,
            None if id == Profile::general().id => Profile::general(),
            None => {
                warn!(profile = %id, "unknown profile, using general");
                Profile::general()
            }
        };
        self.set_session(|s| s.profile = profile);
        Ok(())
    }

    /// Replace the active profile, persisting it unless it is the
    /// non-persisted general profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be persisted.
    pub fn set_profile(&self, profile: Profile) -> Result<()> {
        if profile.id != Profile::general().id {
            self.inner.store.upsert_profile(&profile)?;
        }
        self.set_session(|s| s.profile = profile);
        Ok(())
    }

    pub fn set_language(&self, language: &str) {
        self.set_session(|s| s.language = language.to_owned());
    }

    pub fn set_chat_mode(&self, mode: ChatMode) {
        self.set_session(|s| s.chat_mode = mode);
    }

    /// Set the earcons played when recording starts and stops.
    pub fn set_recording_cues(&self, start: Option<AudioClip>, stop: Option<AudioClip>) {
        if let Ok(mut cues) = self.inner.cues.lock() {
            cues.start = start;
            cues.stop = stop;
        }
    }

    pub fn set_voice_detection(&self, start: bool, end: bool, interrupt: bool) {
        self.set_session(|s| {
            s.voice_detect_start = start;
            s.voice_detect_end = end;
            s.voice_detect_interrupt = interrupt;
        });
    }

    // ---- interaction entry points ----

    /// The mic button. Resolves to exactly one action depending on state:
    /// finish the recording, stop playback, or start recording.
    pub async fn handle_mic_button_click(&self) {
        if self.inner.transcriber.is_recording() {
            self.finish_and_send().await;
        } else if self.inner.playback.is_playing() {
            info!("mic button: stopping playback");
            self.inner.playback.stop_and_clear();
            self.cancel_active_turn();
            self.set_mic(MicState::Pending);
        } else if *self.inner.mic_state.borrow() == MicState::Pending
            && !*self.inner.waiting.borrow()
        {
            if let Err(e) = self.start_recording() {
                error!(error = %e, "failed to start recording");
            }
        } else {
            warn!("mic button ignored in unexpected state");
        }
    }

    /// Begin recording an utterance. Must be called while idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is not idle or the mic fails.
    pub fn start_recording(&self) -> Result<()> {
        if *self.inner.waiting.borrow() {
            return Err(BrokerError::Audio(
                "cannot record while a response is pending".into(),
            ));
        }
        if self.inner.playback.is_playing() {
            self.inner.playback.stop_and_clear();
        }
        let profile_id = self.session_snapshot().0.id;
        self.inner.transcriber.start_recording(&profile_id)?;
        self.set_mic(MicState::Active);
        self.play_cue(|cues| cues.start.clone());
        Ok(())
    }

    /// Finish the current recording and, if anything was said, run the
    /// voice turn to completion. Errors are folded into the published
    /// flags; the caller has nothing to handle.
    pub async fn finish_and_send(&self) {
        self.set_mic(MicState::Disabled);
        self.play_cue(|cues| cues.stop.clone());
        match self.inner.transcriber.stop_recording().await {
            Ok(utterance) => {
                if let Err(e) = self.send_voice(&utterance).await {
                    error!(error = %e, "voice turn failed");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to stop recording");
                self.set_mic(MicState::Pending);
            }
        }
    }

    /// Run one voice turn from a finished utterance: stream the response,
    /// persist the growing messages, and queue audio clips as they arrive.
    ///
    /// An empty transcript is a no-op. The waiting flag is set for the
    /// duration and cleared exactly once on any exit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the stream dies before
    /// reaching a terminal status. Timeouts are not errors: the timeout
    /// flag latches and `Ok` is returned.
    pub async fn send_voice(&self, utterance: &Utterance) -> Result<()> {
        if utterance.transcript.trim().is_empty() {
            debug!("empty transcript, skipping voice turn");
            self.set_mic(MicState::Pending);
            return Ok(());
        }
        let (profile, language) = self.session_snapshot();
        let history = self.recent_history(&profile.id, Some(&utterance.id))?;
        let turn_id = self.begin_turn();

        let turn = match self
            .inner
            .gateway
            .send_voice(&utterance.transcript, &profile, &history, &language)
            .await
        {
            Ok(turn) => turn,
            Err(e) => {
                self.inner.server_error.send_replace(true);
                self.end_turn(turn_id);
                return Err(e);
            }
        };
        let cancelled = turn.cancel_token();
        if !self.register_turn(turn_id, turn.cancel_token()) {
            // Cancelled or superseded while the request was connecting.
            debug!("voice turn was cancelled before its stream opened");
            turn.cancel();
            return Ok(());
        }

        let assistant_id = new_id();
        let assistant_ts = now_millis();
        let mut rx = turn.updates();
        let mut seen_clips = 0usize;
        let mut playback_started = false;

        loop {
            let snapshot: VoiceTurn = rx.borrow_and_update().clone();

            if snapshot.has_content() {
                if !snapshot.assistant_text.is_empty() || !snapshot.sources.is_empty() {
                    self.persist_assistant(
                        &profile.id,
                        &assistant_id,
                        assistant_ts,
                        &snapshot.assistant_text,
                        &snapshot.sources,
                    );
                }
                // The backend's echo of what it heard replaces the local
                // transcript under the same utterance id.
                if !snapshot.user_transcript.is_empty() {
                    self.persist_user_echo(&profile.id, utterance, &snapshot.user_transcript);
                }
            }

            // Queue only clips not yet seen; the accumulator de-duplicates,
            // so the seen prefix never replays.
            for encoded in &snapshot.audio_clips[seen_clips..] {
                match AudioClip::from_base64(encoded) {
                    Ok(clip) => {
                        self.inner.playback.play([clip]);
                        if !playback_started {
                            playback_started = true;
                            // Playback has begun; free the mic so the user
                            // can interrupt.
                            self.set_mic(MicState::Pending);
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable audio clip"),
                }
            }
            seen_clips = snapshot.audio_clips.len();

            match snapshot.status {
                ResponseStatus::Done => break,
                ResponseStatus::Timeout => {
                    warn!("voice turn timed out");
                    self.inner.send_timeout.send_replace(true);
                    break;
                }
                ResponseStatus::Pending => {}
            }
            if rx.changed().await.is_err() {
                // A user-initiated stop closes the channel too; that is a
                // normal end of the turn, not a transport failure.
                if cancelled.is_cancelled() {
                    debug!("voice turn cancelled");
                    break;
                }
                warn!("voice stream ended without completing");
                self.inner.server_error.send_replace(true);
                self.end_turn(turn_id);
                return Err(BrokerError::Gateway(
                    "voice stream ended unexpectedly".into(),
                ));
            }
        }

        self.end_turn(turn_id);
        Ok(())
    }

    /// Run one text chat turn: persist the user message, stream the reply,
    /// and persist the growing assistant message.
    ///
    /// # Errors
    ///
    /// Same contract as [`ConvoBroker::send_voice`].
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let (profile, language) = self.session_snapshot();
        // History is captured before the new user message is stored, so the
        // query is not duplicated into its own context.
        let history = self.recent_history(&profile.id, None)?;

        let user = Message {
            id: new_id(),
            profile_id: profile.id.clone(),
            role: MessageRole::User,
            body: text.to_owned(),
            timestamp: now_millis(),
            sources: Vec::new(),
        };
        self.inner.store.insert(&user)?;
        let turn_id = self.begin_turn();

        let turn = match self
            .inner
            .gateway
            .send_chat(text, &profile, &history, &language)
            .await
        {
            Ok(turn) => turn,
            Err(e) => {
                self.inner.server_error.send_replace(true);
                self.end_turn(turn_id);
                return Err(e);
            }
        };
        let cancelled = turn.cancel_token();
        if !self.register_turn(turn_id, turn.cancel_token()) {
            debug!("chat turn was cancelled before its stream opened");
            turn.cancel();
            return Ok(());
        }

        let assistant_id = new_id();
        let assistant_ts = now_millis();
        let mut rx = turn.updates();

        loop {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.has_content() {
                self.persist_assistant(
                    &profile.id,
                    &assistant_id,
                    assistant_ts,
                    &snapshot.text,
                    &snapshot.sources,
                );
            }
            match snapshot.status {
                ResponseStatus::Done => break,
                ResponseStatus::Timeout => {
                    warn!("chat turn timed out");
                    self.inner.send_timeout.send_replace(true);
                    break;
                }
                ResponseStatus::Pending => {}
            }
            if rx.changed().await.is_err() {
                if cancelled.is_cancelled() {
                    debug!("chat turn cancelled");
                    break;
                }
                warn!("chat stream ended without completing");
                self.inner.server_error.send_replace(true);
                self.end_turn(turn_id);
                return Err(BrokerError::Gateway(
                    "chat stream ended unexpectedly".into(),
                ));
            }
        }

        self.end_turn(turn_id);
        Ok(())
    }

    /// Submit feedback with a snapshot of the recent conversation.
    /// Fire-and-forget: failures are logged, never surfaced.
    pub fn submit_feedback(&self, label: &str, category: &str, remarks: &str) {
        let (profile, _) = self.session_snapshot();
        let history = match self.recent_history(&profile.id, None) {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "feedback history unavailable, sending without");
                Vec::new()
            }
        };
        let feedback = Feedback {
            label: label.to_owned(),
            category: category.to_owned(),
            remarks: remarks.to_owned(),
            chat_history: history,
            profile_id: profile.id.clone(),
            datetime: chrono::Utc::now().to_rfc3339(),
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.gateway.send_feedback(&feedback, &profile).await {
                error!(error = %e, "feedback submission failed");
            }
        });
    }

    /// Synthesize `text` and play it immediately, replacing any queued
    /// audio. Used to replay an assistant message aloud.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis or decoding fails.
    pub async fn speak_text(&self, text: &str) -> Result<()> {
        let bytes = self.inner.gateway.text_to_speech(text).await?;
        let clip = AudioClip::from_encoded(bytes)?;
        self.inner.playback.force_play_and_replace(clip);
        Ok(())
    }

    /// Consume voice-activity edges on a background task, mapping them to
    /// recording starts and stops subject to the session's gates.
    pub fn attach_vad(&self, mut events: mpsc::Receiver<VoiceActivity>) {
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(edge) = events.recv().await {
                broker.on_voice_activity(edge).await;
            }
            debug!("voice activity channel closed");
        });
    }

    /// Stop playback and cancel the in-flight turn, if any.
    pub fn stop_playing(&self) {
        self.inner.playback.stop_and_clear();
        self.cancel_active_turn();
    }

    // ---- internals ----

    async fn on_voice_activity(&self, edge: VoiceActivity) {
        let (chat_mode, detect_start, detect_end, detect_interrupt) = {
            match self.inner.session.lock() {
                Ok(s) => (
                    s.chat_mode,
                    s.voice_detect_start,
                    s.voice_detect_end,
                    s.voice_detect_interrupt,
                ),
                Err(_) => return,
            }
        };
        if chat_mode != ChatMode::Voice {
            return;
        }

        match edge {
            VoiceActivity::Start => {
                if !detect_start
                    || *self.inner.mic_state.borrow() != MicState::Pending
                    || *self.inner.waiting.borrow()
                {
                    return;
                }
                if self.inner.playback.is_playing() {
                    if !detect_interrupt {
                        return;
                    }
                    info!("speech interrupts playback");
                    self.inner.playback.stop_and_clear();
                    self.cancel_active_turn();
                }
                if let Err(e) = self.start_recording() {
                    error!(error = %e, "voice-activated recording failed");
                }
            }
            VoiceActivity::End => {
                if detect_end && self.inner.transcriber.is_recording() {
                    self.finish_and_send().await;
                }
            }
        }
    }

    /// Arm the turn flags, cancel any predecessor, and claim the active
    /// slot under a fresh turn id.
    fn begin_turn(&self) -> u64 {
        let id = self.inner.turn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut active) = self.inner.active_turn.lock() {
            if let Some(previous) = active.replace(ActiveTurn { id, token: None }) {
                debug!("cancelling superseded turn");
                if let Some(token) = previous.token {
                    token.cancel();
                }
            }
        }
        self.inner.send_timeout.send_replace(false);
        self.inner.server_error.send_replace(false);
        self.inner.waiting.send_replace(true);
        id
    }

    /// Attach the stream's token to the turn that opened it. Returns false
    /// when the turn no longer holds the active slot; the caller must tear
    /// the stream down itself.
    fn register_turn(&self, id: u64, token: CancellationToken) -> bool {
        match self.inner.active_turn.lock() {
            Ok(mut active) => match active.as_mut() {
                Some(turn) if turn.id == id => {
                    turn.token = Some(token);
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// Clear the waiting flag and release the mic, but only if turn `id`
    /// still owns the active slot. A superseded or cancelled turn must not
    /// tear down its successor's state.
    fn end_turn(&self, id: u64) {
        if let Ok(mut active) = self.inner.active_turn.lock() {
            match active.as_ref() {
                Some(turn) if turn.id == id => {
                    active.take();
                }
                _ => return,
            }
        } else {
            return;
        }
        self.inner.waiting.send_replace(false);
        if *self.inner.mic_state.borrow() == MicState::Disabled {
            self.set_mic(MicState::Pending);
        }
    }

    fn play_cue(&self, pick: impl FnOnce(&RecordingCues) -> Option<AudioClip>) {
        let clip = match self.inner.cues.lock() {
            Ok(cues) => pick(&cues),
            Err(_) => None,
        };
        if let Some(clip) = clip {
            self.inner.playback.play([clip]);
        }
    }

    fn cancel_active_turn(&self) {
        let turn = match self.inner.active_turn.lock() {
            Ok(mut active) => active.take(),
            Err(_) => None,
        };
        if let Some(turn) = turn {
            info!("cancelling in-flight turn");
            if let Some(token) = turn.token {
                token.cancel();
            }
            self.inner.waiting.send_replace(false);
            if *self.inner.mic_state.borrow() == MicState::Disabled {
                self.set_mic(MicState::Pending);
            }
        }
    }

    fn set_mic(&self, state: MicState) {
        let previous = self.inner.mic_state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "mic state changed");
        }
    }

    fn set_session(&self, mutate: impl FnOnce(&mut SessionContext)) {
        if let Ok(mut session) = self.inner.session.lock() {
            mutate(&mut session);
        }
    }

    fn session_snapshot(&self) -> (Profile, String) {
        match self.inner.session.lock() {
            Ok(s) => (s.profile.clone(), s.language.clone()),
            Err(_) => (Profile::general(), "en".into()),
        }
    }

    /// The most recent messages for turn context, oldest first, optionally
    /// excluding the in-progress utterance's own message.
    fn recent_history(&self, profile_id: &str, exclude_id: Option<&str>) -> Result<Vec<Message>> {
        let mut messages = self.inner.store.static_load(profile_id)?;
        if let Some(id) = exclude_id {
            messages.retain(|m| m.id != id);
        }
        let skip = messages.len().saturating_sub(HISTORY_LIMIT);
        Ok(messages.split_off(skip))
    }

    fn persist_assistant(
        &self,
        profile_id: &str,
        id: &str,
        timestamp: i64,
        body: &str,
        sources: &[MessageSource],
    ) {
        let message = Message {
            id: id.to_owned(),
            profile_id: profile_id.to_owned(),
            role: MessageRole::Assistant,
            body: body.to_owned(),
            timestamp,
            sources: sources.to_vec(),
        };
        if let Err(e) = self.inner.store.upsert(&message) {
            warn!(error = %e, "failed to persist assistant message");
        }
    }

    fn persist_user_echo(&self, profile_id: &str, utterance: &Utterance, body: &str) {
        let message = Message {
            id: utterance.id.clone(),
            profile_id: profile_id.to_owned(),
            role: MessageRole::User,
            body: body.to_owned(),
            timestamp: utterance.started_at,
            sources: Vec::new(),
        };
        if let Err(e) = self.inner.store.upsert(&message) {
            warn!(error = %e, "failed to persist user transcript echo");
        }
    }
}
