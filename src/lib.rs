//! Careline Voice: conversation broker for a streaming health assistant.
//!
//! This crate mediates voice and text conversations with a remote
//! assistant backend:
//! Microphone → streaming transcription → backend turn → playback
//!
//! # Architecture
//!
//! The session is built from independent components owned by the broker:
//! - **Broker**: the single authority for mic state, turn lifecycle and
//!   the waiting/timeout/error flags observers render
//! - **Transcription**: streams 16kHz PCM over a WebSocket and folds live
//!   transcripts back into the message store
//! - **VAD**: detects speech boundaries using energy-based analysis to
//!   drive hands-free recording
//! - **Gateway**: streaming chat/voice turns against the backend, decoded
//!   from concatenated-JSON response bodies
//! - **Playback**: strictly-FIFO clip queue over `cpal` with barge-in
//! - **Store**: SQLite persistence with live per-profile message views

pub mod broker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod playback;
pub mod store;
pub mod transcribe;
pub mod types;
pub mod vad;

pub use broker::ConvoBroker;
pub use config::ClientConfig;
pub use error::{BrokerError, Result};
pub use gateway::decode::{ChatTurn, ResponseStatus, VoiceTurn};
pub use gateway::GatewayClient;
pub use playback::{AudioClip, AudioSink, PlaybackSequencer};
pub use store::MessageStore;
pub use transcribe::{MicSplitter, Transcriber, Utterance};
pub use types::{
    ChatMode, Message, MessageRole, MessageSource, MicState, Profile, SessionContext,
    VoiceActivity,
};
