//! Serialized playback of assistant audio clips.
//!
//! At most one clip plays at a time; the rest wait in a strictly-FIFO
//! queue. The queue is driven by a dedicated worker thread that owns the
//! output device through an [`AudioSink`], so the broker never touches
//! audio hardware directly. Barge-in is supported via
//! [`PlaybackSequencer::stop_and_clear`] and
//! [`PlaybackSequencer::force_play_and_replace`], both of which halt the
//! current clip immediately.

use crate::config::AudioConfig;
use crate::error::{BrokerError, Result};
use base64::Engine;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A decoded audio clip ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    /// Decode a compressed clip (mp3/wav) into f32 mono samples.
    ///
    /// # Errors
    ///
    /// Returns an error if the container or codec is unrecognized.
    pub fn from_encoded(bytes: Vec<u8>) -> Result<Self> {
        decode_clip(bytes)
    }

    /// Decode a base64-encoded compressed clip, as delivered in voice-turn
    /// `audio_base64` fragments.
    ///
    /// # Errors
    ///
    /// Returns an error if the base64 or audio payload is invalid.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BrokerError::Playback(format!("invalid base64 audio: {e}")))?;
        decode_clip(bytes)
    }

    /// Clip duration.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Output device seam. Implementations block until the clip finishes or
/// `halt` becomes true.
pub trait AudioSink: Send + 'static {
    /// Play a clip to completion or until halted.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stream cannot be created or started.
    fn play(&mut self, clip: &AudioClip, halt: &AtomicBool) -> Result<()>;
}

enum Command {
    Enqueue(AudioClip),
    Replace(AudioClip),
    Clear,
}

/// FIFO playback queue over an [`AudioSink`].
pub struct PlaybackSequencer {
    cmd_tx: mpsc::Sender<Command>,
    halt: Arc<AtomicBool>,
    playing_rx: watch::Receiver<bool>,
}

impl PlaybackSequencer {
    /// Spawn the worker thread that owns the sink.
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let halt = Arc::new(AtomicBool::new(false));
        let (playing_tx, playing_rx) = watch::channel(false);

        let worker_halt = Arc::clone(&halt);
        std::thread::Builder::new()
            .name("playback".into())
            .spawn(move || run_queue(sink, cmd_rx, worker_halt, playing_tx))
            .map_err(|e| error!(error = %e, "failed to spawn playback worker"))
            .ok();

        Self {
            cmd_tx,
            halt,
            playing_rx,
        }
    }

    /// Append clips to the queue. Playback starts immediately if idle.
    pub fn play(&self, clips: impl IntoIterator<Item = AudioClip>) {
        for clip in clips {
            if self.cmd_tx.send(Command::Enqueue(clip)).is_err() {
                warn!("playback worker gone, dropping clip");
                return;
            }
        }
    }

    /// Halt the current clip, discard the queue, and play `clip` alone.
    pub fn force_play_and_replace(&self, clip: AudioClip) {
        self.halt.store(true, Ordering::SeqCst);
        if self.cmd_tx.send(Command::Replace(clip)).is_err() {
            warn!("playback worker gone, dropping replacement clip");
        }
    }

    /// Halt the current clip and discard the queue.
    pub fn stop_and_clear(&self) {
        self.halt.store(true, Ordering::SeqCst);
        if self.cmd_tx.send(Command::Clear).is_err() {
            warn!("playback worker gone");
        }
    }

    /// Subscribe to the playing/idle signal.
    pub fn playing(&self) -> watch::Receiver<bool> {
        self.playing_rx.clone()
    }

    /// Whether a clip is currently playing or queued.
    pub fn is_playing(&self) -> bool {
        *self.playing_rx.borrow()
    }
}

/// Worker loop: strictly-FIFO, one clip at a time. The playing flag only
/// drops to false once the queue is empty and nothing is mid-play.
fn run_queue(
    mut sink: Box<dyn AudioSink>,
    cmd_rx: mpsc::Receiver<Command>,
    halt: Arc<AtomicBool>,
    playing_tx: watch::Sender<bool>,
) {
    let mut queue: VecDeque<AudioClip> = VecDeque::new();
    // Notify only on real transitions so observers never see the flag
    // flicker between back-to-back clips.
    let set_playing = |value: bool| {
        playing_tx.send_if_modified(|current| {
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        });
    };

    loop {
        if queue.is_empty() {
            set_playing(false);
            match cmd_rx.recv() {
                Ok(cmd) => apply(&mut queue, &halt, cmd),
                Err(_) => break,
            }
        }
        while let Ok(cmd) = cmd_rx.try_recv() {
            apply(&mut queue, &halt, cmd);
        }

        if let Some(clip) = queue.pop_front() {
            set_playing(true);
            if let Err(e) = sink.play(&clip, &halt) {
                error!(error = %e, "clip playback failed");
            }
        }
    }
    debug!("playback worker stopped");
}

fn apply(queue: &mut VecDeque<AudioClip>, halt: &AtomicBool, cmd: Command) {
    match cmd {
        Command::Enqueue(clip) => queue.push_back(clip),
        Command::Replace(clip) => {
            queue.clear();
            queue.push_front(clip);
            halt.store(false, Ordering::SeqCst);
        }
        Command::Clear => {
            queue.clear();
            halt.store(false, Ordering::SeqCst);
        }
    }
}

/// Audio playback to system speakers via cpal.
pub struct CpalSink {
    device: cpal::Device,
    fallback_sample_rate: u32,
    level_tx: Arc<watch::Sender<f32>>,
}

impl CpalSink {
    /// Create a new playback sink.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| BrokerError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| BrokerError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| BrokerError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        Ok(Self {
            device,
            fallback_sample_rate: config.output_sample_rate,
            level_tx: Arc::new(watch::channel(0.0).0),
        })
    }

    /// Live output level (RMS per buffer) for waveform visualization.
    pub fn level_updates(&self) -> watch::Receiver<f32> {
        self.level_tx.subscribe()
    }
}

impl AudioSink for CpalSink {
    fn play(&mut self, clip: &AudioClip, halt: &AtomicBool) -> Result<()> {
        let sample_rate = if clip.sample_rate > 0 {
            clip.sample_rate
        } else {
            self.fallback_sample_rate
        };
        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples: clip.samples.clone(),
            position: 0,
            finished: false,
        }));
        let buffer_clone = Arc::clone(&buffer);
        let level_tx = Arc::clone(&self.level_tx);

        let stream = self
            .device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match buffer_clone.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };

                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position];
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }

                    let sum_sq: f32 = data.iter().map(|s| s * s).sum();
                    level_tx.send_replace((sum_sq / data.len().max(1) as f32).sqrt());
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| BrokerError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| BrokerError::Audio(format!("failed to start output stream: {e}")))?;

        // Wait for natural end or a halt request.
        loop {
            std::thread::sleep(Duration::from_millis(10));
            if halt.load(Ordering::SeqCst) {
                break;
            }
            let buf = buffer
                .lock()
                .map_err(|e| BrokerError::Audio(format!("playback buffer lock poisoned: {e}")))?;
            if buf.finished {
                break;
            }
        }

        drop(stream);
        self.level_tx.send_replace(0.0);
        Ok(())
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

/// Sink that discards samples while simulating clip timing.
///
/// Useful for headless operation and for exercising queue behavior in
/// tests without an output device.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&mut self, clip: &AudioClip, halt: &AtomicBool) -> Result<()> {
        let deadline = std::time::Instant::now() + clip.duration();
        while std::time::Instant::now() < deadline {
            if halt.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }
}

/// Decode a compressed audio payload into f32 mono samples.
fn decode_clip(bytes: Vec<u8>) -> Result<AudioClip> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let mss = MediaSourceStream::new(Box::new(std::io::Cursor::new(bytes)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| BrokerError::Playback(format!("unrecognized audio clip: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| BrokerError::Playback("audio clip has no default track".into()))?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(24_000);
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| BrokerError::Playback(format!("unsupported audio codec: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                debug!(error = %e, "stopping clip decode");
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                buf.copy_interleaved_ref(decoded);
                if channels > 1 {
                    samples.extend(
                        buf.samples()
                            .chunks_exact(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                    );
                } else {
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(error = %e, "skipping undecodable packet");
            }
            Err(e) => {
                debug!(error = %e, "stopping clip decode");
                break;
            }
        }
    }

    if samples.is_empty() {
        return Err(BrokerError::Playback("audio clip decoded to silence".into()));
    }
    Ok(AudioClip {
        samples,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn clip(millis: u64) -> AudioClip {
        let samples = vec![0.1; (16 * millis) as usize]; // 16kHz
        AudioClip {
            samples,
            sample_rate: 16_000,
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<bool>, value: bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow() != value {
                rx.changed().await.expect("playing channel open");
            }
        })
        .await
        .expect("playing flag should settle");
    }

    #[tokio::test]
    async fn queue_is_fifo_and_never_overlaps() {
        let sequencer = PlaybackSequencer::new(Box::new(NullSink));
        let mut playing = sequencer.playing();

        let start = Instant::now();
        sequencer.play([clip(30), clip(30), clip(30)]);

        wait_for(&mut playing, true).await;
        wait_for(&mut playing, false).await;

        // Three 30ms clips played serially take at least 90ms.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn playing_signal_does_not_drop_between_queued_clips() {
        let sequencer = PlaybackSequencer::new(Box::new(NullSink));
        let mut playing = sequencer.playing();

        sequencer.play([clip(20)]);
        wait_for(&mut playing, true).await;
        // B and C queued while A is playing.
        sequencer.play([clip(20), clip(20)]);

        // Observe every transition until idle: there must be exactly one
        // drop to false, at the very end.
        let mut transitions = Vec::new();
        loop {
            playing.changed().await.expect("playing channel open");
            let value = *playing.borrow();
            transitions.push(value);
            if !value {
                break;
            }
        }
        assert_eq!(transitions, vec![false]);
    }

    #[tokio::test]
    async fn stop_and_clear_halts_immediately() {
        let sequencer = PlaybackSequencer::new(Box::new(NullSink));
        let mut playing = sequencer.playing();

        sequencer.play([clip(5_000), clip(5_000)]);
        wait_for(&mut playing, true).await;

        let start = Instant::now();
        sequencer.stop_and_clear();
        wait_for(&mut playing, false).await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn force_play_and_replace_discards_queue() {
        let sequencer = PlaybackSequencer::new(Box::new(NullSink));
        let mut playing = sequencer.playing();

        sequencer.play([clip(5_000), clip(5_000)]);
        wait_for(&mut playing, true).await;

        let start = Instant::now();
        sequencer.force_play_and_replace(clip(30));
        wait_for(&mut playing, false).await;
        // The replacement clip plays alone; the 5s clips are gone.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn clip_duration_is_samples_over_rate() {
        assert_eq!(clip(250).duration(), Duration::from_millis(250));
    }

    #[test]
    fn invalid_base64_is_a_playback_error() {
        let err = AudioClip::from_base64("not base64!!!").expect_err("should fail");
        assert!(matches!(err, BrokerError::Playback(_)));
    }
}
