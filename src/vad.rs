//! Voice activity monitoring using energy-based analysis.
//!
//! Uses RMS energy thresholding to detect speech boundaries and emits
//! [`VoiceActivity`] start/end edges. The broker consumes these signals
//! through a plain channel, so alternative detectors (model-based, remote)
//! can be plugged in by producing the same events.

use crate::config::VadConfig;
use crate::types::VoiceActivity;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Assumed duration of one audio chunk (512 samples at 16kHz).
const CHUNK_DURATION_MS: u32 = 32;

/// Voice activity detector using RMS energy thresholding.
///
/// Feed fixed-size audio chunks through [`EnergyVad::process_chunk`]; it
/// returns `Start` once enough consecutive speech chunks accumulate and
/// `End` after the configured silence hang time.
pub struct EnergyVad {
    /// Whether we are currently inside a speech segment.
    in_speech: bool,
    /// Consecutive speech chunks observed while not yet in speech.
    speech_count: u32,
    /// Consecutive silent chunks observed while in speech.
    silence_count: u32,
    /// Speech chunks required to emit a start edge.
    speech_threshold: u32,
    /// Silent chunks required to emit an end edge.
    silence_threshold: u32,
    /// RMS threshold for a chunk to count as speech.
    threshold: f32,
}

impl EnergyVad {
    pub fn new(config: &VadConfig) -> Self {
        let silence_threshold = (config.min_silence_duration_ms / CHUNK_DURATION_MS).max(1);
        let speech_threshold = (config.min_speech_duration_ms / CHUNK_DURATION_MS).max(1);

        info!(
            "VAD initialized: threshold={}, start after {} chunks, end after {} chunks",
            config.threshold, speech_threshold, silence_threshold
        );

        Self {
            in_speech: false,
            speech_count: 0,
            silence_count: 0,
            speech_threshold,
            silence_threshold,
            threshold: config.threshold,
        }
    }

    /// Process one audio chunk, returning a start/end edge if one occurred.
    pub fn process_chunk(&mut self, samples: &[f32]) -> Option<VoiceActivity> {
        let energy = compute_rms_energy(samples);
        let is_speech = energy > self.threshold * 0.01;

        if is_speech {
            self.silence_count = 0;
            if !self.in_speech {
                self.speech_count += 1;
                if self.speech_count >= self.speech_threshold {
                    self.in_speech = true;
                    self.speech_count = 0;
                    debug!("speech start detected");
                    return Some(VoiceActivity::Start);
                }
            }
        } else {
            self.speech_count = 0;
            if self.in_speech {
                self.silence_count += 1;
                if self.silence_count >= self.silence_threshold {
                    self.in_speech = false;
                    self.silence_count = 0;
                    debug!("speech end detected");
                    return Some(VoiceActivity::End);
                }
            }
        }

        None
    }

    /// Reset detector state.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.speech_count = 0;
        self.silence_count = 0;
    }
}

/// Drive a detector over an audio chunk channel, emitting edges until the
/// audio channel closes or the token is cancelled.
pub async fn run_monitor(
    config: &VadConfig,
    mut audio_rx: mpsc::Receiver<Vec<f32>>,
    events_tx: mpsc::Sender<VoiceActivity>,
    cancel: CancellationToken,
) {
    let mut vad = EnergyVad::new(config);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = audio_rx.recv() => match chunk {
                Some(samples) => {
                    if let Some(edge) = vad.process_chunk(&samples) {
                        if events_tx.send(edge).await.is_err() {
                            return;
                        }
                    }
                }
                None => return,
            }
        }
    }
}

/// Compute RMS energy of audio samples.
fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
