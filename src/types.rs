//! Domain types shared across the broker, gateway and store.

use serde::{Deserialize, Serialize};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "ASSISTANT")]
    Assistant,
}

impl MessageRole {
    /// Wire name used by the backend (`chat_history[].role`).
    pub fn api_name(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Citation metadata attached to an assistant message.
///
/// The field set mirrors what the backend emits in streamed `sources`
/// fragments; the whole value is also how de-duplication is keyed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSource {
    pub id: String,
    pub title: String,
    pub cover_image_url: String,
    pub full_url: String,
    pub content_category: String,
    pub chunks: String,
}

/// A single chat message, unique by `id` within a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub profile_id: String,
    pub role: MessageRole,
    pub body: String,
    /// Send/receive time in epoch milliseconds. Messages are ordered by this.
    pub timestamp: i64,
    #[serde(default)]
    pub sources: Vec<MessageSource>,
}

/// What kind of person a profile describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    General,
    Myself,
    Others,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileGender {
    Male,
    Female,
    Unspecified,
}

/// A conversation context ("patient" persona). All messages are scoped to
/// exactly one profile id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub profile_type: ProfileType,
    pub age: Option<u32>,
    pub gender: ProfileGender,
    pub existing_conditions: String,
}

impl Profile {
    /// The reserved "general" profile with no persisted identity.
    pub fn general() -> Self {
        Self {
            id: "general".into(),
            profile_type: ProfileType::General,
            age: None,
            gender: ProfileGender::Unspecified,
            existing_conditions: String::new(),
        }
    }
}

/// The broker's authoritative recording/playback-gating status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicState {
    /// Idle, listening for activation.
    Pending,
    /// Currently recording.
    Active,
    /// Awaiting a backend response; input suppressed.
    Disabled,
}

/// Transient start/end-of-speech signal from a voice activity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    Start,
    End,
}

/// Which input surface the user is conversing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Text,
    Voice,
}

/// Write-once user feedback, forwarded to the backend with a chat snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub label: String,
    pub category: String,
    pub remarks: String,
    #[serde(default)]
    pub chat_history: Vec<Message>,
    #[serde(default)]
    pub profile_id: String,
    pub datetime: String,
}

/// Per-session conversation context held by the broker.
///
/// Replaces the ambient subscribed globals of earlier designs: the active
/// profile, language preference and voice-detection switches all live here
/// and are mutated only through the broker's setters.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub profile: Profile,
    /// Spoken-language preference sent with every turn request.
    pub language: String,
    pub chat_mode: ChatMode,
    /// Allow VAD start-of-speech signals to begin recording.
    pub voice_detect_start: bool,
    /// Allow VAD end-of-speech signals to finish recording.
    pub voice_detect_end: bool,
    /// Allow speech to interrupt assistant audio playback (barge-in).
    pub voice_detect_interrupt: bool,
}

impl SessionContext {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            language: "en".into(),
            chat_mode: ChatMode::Voice,
            voice_detect_start: true,
            voice_detect_end: true,
            voice_detect_interrupt: false,
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(Profile::general())
    }
}

/// Generate a fresh message / utterance correlation id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
