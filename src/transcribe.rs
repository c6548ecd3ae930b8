//! Microphone capture and live streaming transcription.
//!
//! A recording is one utterance: the mic streams 16kHz mono PCM over a
//! WebSocket to the transcription service, which answers with progressively
//! better transcripts as JSON `{text, is_final}` frames. Each new transcript
//! replaces the previous one, and the in-progress text is upserted into the
//! message store under a stable utterance id so live views update while the
//! user is still speaking.
//!
//! Audio frames produced before the socket finishes connecting are queued,
//! not dropped. Stopping a recording sends a completion sentinel and waits
//! (bounded) for the final transcript; a closed socket is terminal for the
//! utterance, and whatever transcript arrived last stands.

use crate::config::{AudioConfig, TranscribeConfig};
use crate::error::{BrokerError, Result};
use crate::store::MessageStore;
use crate::types::{new_id, now_millis, Message, MessageRole};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The text frame that tells the transcription service the utterance is
/// complete and the final transcript should be produced.
const COMPLETION_SENTINEL: &str = "completed";

/// The text frame that abandons the utterance without asking for a final
/// transcript.
const ABORT_SENTINEL: &str = "close";

/// One finished user utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Correlation id; doubles as the persisted user message id.
    pub id: String,
    pub transcript: String,
    /// Recording start time in epoch milliseconds.
    pub started_at: i64,
}

/// Transcript progress for the current utterance.
#[derive(Debug, Clone, Default)]
struct TranscriptState {
    text: String,
    is_final: bool,
    /// The socket has closed; no further updates will arrive.
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct TranscriptFrame {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
    /// Server-side recognition error; the frame carries no transcript.
    #[serde(default)]
    error: Option<String>,
}

enum OutboundFrame {
    Pcm(Vec<u8>),
    Finish,
    Abort,
}

/// Microphone seam. Implementations block in `run`, delivering mono chunks
/// at the configured input rate until the token is cancelled.
pub trait AudioInput: Send + 'static {
    /// Stream chunks into `tx` until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the input stream cannot be created or started.
    fn run(&mut self, tx: mpsc::Sender<Vec<f32>>, cancel: CancellationToken) -> Result<()>;
}

struct ActiveRecording {
    utterance_id: String,
    profile_id: String,
    started_at: i64,
    mic_cancel: CancellationToken,
    ws_tx: mpsc::UnboundedSender<OutboundFrame>,
    transcript_rx: watch::Receiver<TranscriptState>,
}

/// Streaming transcription client bound to a microphone and the message
/// store. One recording may be active at a time.
pub struct Transcriber {
    config: TranscribeConfig,
    store: Arc<MessageStore>,
    input: Arc<Mutex<Box<dyn AudioInput>>>,
    active: Mutex<Option<ActiveRecording>>,
}

impl Transcriber {
    pub fn new(
        config: TranscribeConfig,
        store: Arc<MessageStore>,
        input: Box<dyn AudioInput>,
    ) -> Self {
        Self {
            config,
            store,
            input: Arc::new(Mutex::new(input)),
            active: Mutex::new(None),
        }
    }

    /// Whether a recording is in progress.
    pub fn is_recording(&self) -> bool {
        self.active
            .lock()
            .map(|a| a.is_some())
            .unwrap_or(false)
    }

    /// Begin a new utterance: connect the transcription socket, start the
    /// microphone, and stream PCM. The in-progress transcript is written to
    /// the store as a user message under `profile_id`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a recording is already active.
    pub fn start_recording(&self, profile_id: &str) -> Result<Utterance> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| BrokerError::Transcribe(format!("recording lock poisoned: {e}")))?;
        if active.is_some() {
            return Err(BrokerError::Transcribe("recording already active".into()));
        }

        let utterance_id = new_id();
        let started_at = now_millis();
        info!(utterance = %utterance_id, "recording started");

        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let (transcript_tx, transcript_rx) = watch::channel(TranscriptState::default());
        let mic_cancel = CancellationToken::new();

        // Socket task: drains outbound frames (queued from the moment the
        // mic starts, even while the connection is still being established)
        // and applies inbound transcript updates.
        let url = self.config.url.clone();
        let store = Arc::clone(&self.store);
        let live = Message {
            id: utterance_id.clone(),
            profile_id: profile_id.to_owned(),
            role: MessageRole::User,
            body: String::new(),
            timestamp: started_at,
            sources: Vec::new(),
        };
        tokio::spawn(run_socket(url, ws_rx, transcript_tx, store, live));

        // Pump task: PCM-encodes mic chunks into the outbound queue. Ends
        // when the mic thread stops and the chunk channel closes.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<f32>>(64);
        let pump_tx = ws_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                if pump_tx.send(OutboundFrame::Pcm(to_pcm16(&chunk))).is_err() {
                    break;
                }
            }
        });

        // Mic thread: cpal streams are not Send, so capture runs on its own
        // blocking thread for the duration of the recording.
        let input = Arc::clone(&self.input);
        let cancel = mic_cancel.clone();
        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let mut input = match input.lock() {
                    Ok(input) => input,
                    Err(e) => {
                        error!("microphone lock poisoned: {e}");
                        return;
                    }
                };
                if let Err(e) = input.run(chunk_tx, cancel) {
                    error!(error = %e, "microphone capture failed");
                }
            })
            .map_err(|e| BrokerError::Audio(format!("failed to spawn capture thread: {e}")))?;

        *active = Some(ActiveRecording {
            utterance_id: utterance_id.clone(),
            profile_id: profile_id.to_owned(),
            started_at,
            mic_cancel,
            ws_tx,
            transcript_rx,
        });
        Ok(Utterance {
            id: utterance_id,
            transcript: String::new(),
            started_at,
        })
    }

    /// Finish the current utterance: stop the mic, send the completion
    /// sentinel, and wait (bounded) for the final transcript.
    ///
    /// Returns the utterance with whatever transcript is last known, which
    /// may be empty if the user said nothing intelligible.
    ///
    /// # Errors
    ///
    /// Returns an error if no recording is active.
    pub async fn stop_recording(&self) -> Result<Utterance> {
        let recording = self
            .active
            .lock()
            .map_err(|e| BrokerError::Transcribe(format!("recording lock poisoned: {e}")))?
            .take()
            .ok_or_else(|| BrokerError::Transcribe("no active recording".into()))?;

        recording.mic_cancel.cancel();
        if recording.ws_tx.send(OutboundFrame::Finish).is_err() {
            debug!("transcription socket already closed at stop");
        }

        let mut rx = recording.transcript_rx;
        let wait = Duration::from_millis(self.config.finish_timeout_ms);
        let transcript = match tokio::time::timeout(wait, await_final(&mut rx)).await {
            Ok(text) => text,
            Err(_) => {
                warn!(
                    utterance = %recording.utterance_id,
                    "final transcript did not arrive in time, using partial"
                );
                rx.borrow().text.clone()
            }
        };

        // Dropping the last outbound sender makes the socket task close
        // the connection.
        drop(recording.ws_tx);

        // A partial hypothesis may have been persisted even though the
        // final transcript came back empty; discard the placeholder.
        if transcript.trim().is_empty() {
            match self
                .store
                .delete(&recording.profile_id, &recording.utterance_id)
            {
                Ok(true) => debug!("discarded empty utterance placeholder"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "failed to discard empty utterance"),
            }
        }

        info!(utterance = %recording.utterance_id, chars = transcript.len(), "recording finished");
        Ok(Utterance {
            id: recording.utterance_id,
            transcript,
            started_at: recording.started_at,
        })
    }

    /// Abort the current utterance without waiting for a final transcript.
    /// No-op when idle.
    pub fn cancel_recording(&self) {
        let recording = match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(_) => None,
        };
        if let Some(recording) = recording {
            info!(utterance = %recording.utterance_id, "recording cancelled");
            recording.mic_cancel.cancel();
            let _ = recording.ws_tx.send(OutboundFrame::Abort);
        }
    }
}

/// Wait until the transcript is final or the socket closes.
async fn await_final(rx: &mut watch::Receiver<TranscriptState>) -> String {
    loop {
        {
            let state = rx.borrow_and_update();
            if state.is_final || state.closed {
                return state.text.clone();
            }
        }
        if rx.changed().await.is_err() {
            return rx.borrow().text.clone();
        }
    }
}

/// Own the WebSocket connection for one utterance: send queued PCM frames
/// out, fold transcript frames into the watch channel and the store.
async fn run_socket(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    transcript_tx: watch::Sender<TranscriptState>,
    store: Arc<MessageStore>,
    mut live: Message,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            error!(error = %e, "transcription socket connect failed");
            transcript_tx.send_modify(|s| s.closed = true);
            return;
        }
    };
    debug!("transcription socket connected");
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(OutboundFrame::Pcm(bytes)) => {
                    if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
                        warn!(error = %e, "transcription socket send failed");
                        break;
                    }
                }
                Some(OutboundFrame::Finish) => {
                    if let Err(e) = sink.send(WsMessage::Text(COMPLETION_SENTINEL.into())).await {
                        warn!(error = %e, "failed to send completion sentinel");
                        break;
                    }
                }
                Some(OutboundFrame::Abort) => {
                    let _ = sink.send(WsMessage::Text(ABORT_SENTINEL.into())).await;
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                // All senders dropped: the utterance is done with the socket.
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<TranscriptFrame>(&text) {
                        Ok(frame) => {
                            apply_transcript(&transcript_tx, &store, &mut live, frame);
                        }
                        Err(e) => warn!(error = %e, "unparseable transcript frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!("transcription socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "transcription socket read failed");
                    break;
                }
            },
        }
    }

    transcript_tx.send_modify(|s| s.closed = true);
}

/// Replace the running transcript with the newest hypothesis and keep the
/// persisted user message in step so live views show words as they land.
fn apply_transcript(
    transcript_tx: &watch::Sender<TranscriptState>,
    store: &MessageStore,
    live: &mut Message,
    frame: TranscriptFrame,
) {
    if let Some(error) = frame.error {
        warn!(%error, "transcription service reported an error");
        return;
    }
    debug!(chars = frame.text.len(), is_final = frame.is_final, "transcript update");
    transcript_tx.send_modify(|s| {
        s.text = frame.text.clone();
        s.is_final = frame.is_final;
    });

    if frame.text.trim().is_empty() {
        return;
    }
    live.body = frame.text;
    if let Err(e) = store.upsert(live) {
        warn!(error = %e, "failed to persist live transcript");
    }
}

/// Convert f32 samples to 16-bit little-endian PCM.
fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Microphone capture via cpal.
///
/// Opens the device at its native configuration for compatibility, then
/// mixes to mono and resamples to the configured input rate in software.
pub struct CpalMic {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
}

impl CpalMic {
    /// Create a capture instance bound to the configured (or default)
    /// input device.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| BrokerError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| BrokerError::Audio(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| BrokerError::Audio("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| BrokerError::Audio(format!("no default input config: {e}")))?;
        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            "native input config: {}Hz, {} channels; target {}Hz mono",
            stream_config.sample_rate,
            stream_config.channels,
            config.input_sample_rate
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.input_sample_rate,
        })
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| BrokerError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

impl AudioInput for CpalMic {
    fn run(&mut self, tx: mpsc::Sender<Vec<f32>>, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        mix_to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        resample_linear(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    // try_send: never block the audio callback.
                    if tx.try_send(samples).is_err() {
                        debug!("audio channel full, dropping chunk");
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| BrokerError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| BrokerError::Audio(format!("failed to start input stream: {e}")))?;
        debug!("microphone capture running");

        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(20));
        }
        drop(stream);
        debug!("microphone capture stopped");
        Ok(())
    }
}

type RecordingSlot = Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>;

/// Fan-out over a single capture device.
///
/// The microphone is opened exactly once, on a dedicated thread. Chunks
/// always flow to the monitor channel (voice-activity detection keeps
/// hearing the room), and additionally to the active recording while one is
/// attached through the [`AudioInput`] handle from [`MicSplitter::input`].
pub struct MicSplitter {
    recording: RecordingSlot,
    cancel: CancellationToken,
}

impl MicSplitter {
    /// Start capturing from `input` and return the monitor chunk stream
    /// alongside the splitter.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture threads cannot be spawned.
    pub fn start(mut input: Box<dyn AudioInput>) -> Result<(Self, mpsc::Receiver<Vec<f32>>)> {
        let recording: RecordingSlot = Arc::new(Mutex::new(None));
        let (monitor_tx, monitor_rx) = mpsc::channel(64);
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<f32>>(64);
        let cancel = CancellationToken::new();

        let capture_cancel = cancel.clone();
        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                if let Err(e) = input.run(chunk_tx, capture_cancel) {
                    error!(error = %e, "shared microphone capture failed");
                }
            })
            .map_err(|e| BrokerError::Audio(format!("failed to spawn capture thread: {e}")))?;

        let slot = Arc::clone(&recording);
        std::thread::Builder::new()
            .name("mic-fanout".into())
            .spawn(move || {
                while let Some(chunk) = chunk_rx.blocking_recv() {
                    if let Ok(guard) = slot.lock() {
                        if let Some(tx) = guard.as_ref() {
                            // try_send: a stalled consumer drops chunks
                            // rather than backing the capture up.
                            let _ = tx.try_send(chunk.clone());
                        }
                    }
                    let _ = monitor_tx.try_send(chunk);
                }
                debug!("microphone fan-out stopped");
            })
            .map_err(|e| BrokerError::Audio(format!("failed to spawn fan-out thread: {e}")))?;

        Ok((
            Self { recording, cancel },
            monitor_rx,
        ))
    }

    /// A recording input backed by the shared device. While a recording
    /// runs it taps the same stream the monitor hears.
    pub fn input(&self) -> Box<dyn AudioInput> {
        Box::new(TapInput {
            recording: Arc::clone(&self.recording),
        })
    }

    /// Stop the underlying capture. All consumers see their channels close.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MicSplitter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TapInput {
    recording: RecordingSlot,
}

impl AudioInput for TapInput {
    fn run(&mut self, tx: mpsc::Sender<Vec<f32>>, cancel: CancellationToken) -> Result<()> {
        let mine = tx.clone();
        if let Ok(mut slot) = self.recording.lock() {
            *slot = Some(tx);
        }
        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(10));
        }
        // Only detach our own sender; the next recording may already have
        // installed its tap.
        if let Ok(mut slot) = self.recording.lock() {
            if slot.as_ref().is_some_and(|current| current.same_channel(&mine)) {
                slot.take();
            }
        }
        Ok(())
    }
}

/// Scripted microphone: emits a fixed chunk sequence, then idles until
/// cancelled. For tests and headless runs where no input device exists.
pub struct ScriptedMic {
    pub chunks: Vec<Vec<f32>>,
}

impl AudioInput for ScriptedMic {
    fn run(&mut self, tx: mpsc::Sender<Vec<f32>>, cancel: CancellationToken) -> Result<()> {
        for chunk in self.chunks.drain(..) {
            if tx.blocking_send(chunk).is_err() {
                return Ok(());
            }
        }
        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Average interleaved channels down to mono.
fn mix_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech, where the energy
/// of interest sits well below the 8kHz Nyquist bound of a 16kHz target.
fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };
        output.push(sample as f32);
    }
    output
}
