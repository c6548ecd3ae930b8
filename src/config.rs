//! Configuration types for the conversation client.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the conversation client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Live transcription socket settings.
    pub transcribe: TranscribeConfig,
    /// Backend gateway settings.
    pub gateway: GatewayConfig,
    /// User preference defaults (language, chat mode, VAD switches).
    pub preferences: PreferenceConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| BrokerError::Config(format!("invalid config: {e}")))
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate the transcription backend expects, in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz, used when a clip does not declare one.
    pub output_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            input_device: None,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold above which a chunk counts as speech.
    pub threshold: f32,
    /// Silence duration that ends a speech segment, in milliseconds.
    pub min_silence_duration_ms: u32,
    /// Speech duration required before a start signal is emitted, in
    /// milliseconds. Filters out coughs and clicks.
    pub min_speech_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_silence_duration_ms: 600,
            min_speech_duration_ms: 200,
        }
    }
}

/// Live transcription socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscribeConfig {
    /// WebSocket endpoint for streaming transcription.
    pub url: String,
    /// How long to wait for the server's final transcript after the
    /// completion sentinel is sent, in milliseconds.
    pub finish_timeout_ms: u64,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/transcribe".into(),
            finish_timeout_ms: 10_000,
        }
    }
}

/// Backend gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the assistant backend.
    pub base_url: String,
    /// Voice-turn time-to-first-chunk timeout, in milliseconds.
    pub voice_timeout_ms: u64,
    /// Chat-turn time-to-first-chunk timeout, in milliseconds.
    pub chat_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            voice_timeout_ms: 30_000,
            chat_timeout_ms: 30_000,
        }
    }
}

/// User preference defaults applied to a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceConfig {
    /// Spoken-language preference sent with every turn request.
    pub language: String,
    /// Initial chat mode.
    pub chat_mode: crate::types::ChatMode,
    /// Allow VAD start-of-speech signals to begin recording.
    pub voice_detect_start: bool,
    /// Allow VAD end-of-speech signals to finish recording.
    pub voice_detect_end: bool,
    /// Allow speech to interrupt assistant audio playback.
    pub voice_detect_interrupt: bool,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        Self {
            language: "en".into(),
            chat_mode: crate::types::ChatMode::Voice,
            voice_detect_start: true,
            voice_detect_end: true,
            voice_detect_interrupt: false,
        }
    }
}
