//! Careline Voice command-line client.

use careline_voice::broker::ConvoBroker;
use careline_voice::playback::{CpalSink, NullSink};
use careline_voice::store::MessageStore;
use careline_voice::transcribe::{CpalMic, MicSplitter, ScriptedMic};
use careline_voice::types::{ChatMode, MessageRole};
use careline_voice::{vad, ClientConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Careline Voice: conversation client for a streaming health assistant.
#[derive(Parser)]
#[command(name = "careline-voice", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the message database (defaults to in-memory).
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available audio input devices.
    Devices,
    /// Text conversation on stdin/stdout. Needs no audio hardware.
    Chat,
    /// Hands-free voice conversation until Ctrl-C.
    Talk,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to our own info logs; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("careline_voice=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(ref path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    let store = Arc::new(match cli.db {
        Some(ref path) => MessageStore::open(path)?,
        None => MessageStore::open_in_memory()?,
    });

    match cli.command {
        Command::Devices => {
            for name in CpalMic::list_input_devices()? {
                println!("{name}");
            }
        }
        Command::Chat => run_chat(&config, store).await?,
        Command::Talk => run_talk(&config, store).await?,
    }
    Ok(())
}

async fn run_chat(config: &ClientConfig, store: Arc<MessageStore>) -> anyhow::Result<()> {
    let broker = ConvoBroker::new(
        config,
        store,
        Box::new(ScriptedMic { chunks: Vec::new() }),
        Box::new(NullSink),
    );
    broker.set_chat_mode(ChatMode::Text);
    let mut view = broker.messages()?;

    println!("Type a message, or /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_owned();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        if let Err(e) = broker.send_chat(&line).await {
            eprintln!("turn failed: {e}");
            continue;
        }
        if *broker.send_timeout().borrow() {
            eprintln!("the assistant took too long to answer");
            continue;
        }

        let messages = view.borrow_and_update().clone();
        if let Some(reply) = messages.iter().rev().find(|m| m.role == MessageRole::Assistant) {
            println!("assistant: {}", reply.body);
            for source in &reply.sources {
                println!("  source: {}", source.title);
            }
        }
    }
    Ok(())
}

async fn run_talk(config: &ClientConfig, store: Arc<MessageStore>) -> anyhow::Result<()> {
    // The microphone is opened once and fanned out: the voice activity
    // monitor keeps hearing the room while the recorder is idle, and the
    // recorder taps the same stream while an utterance is captured.
    let mic = CpalMic::new(&config.audio)?;
    let (splitter, chunk_rx) = MicSplitter::start(Box::new(mic))?;
    let sink = CpalSink::new(&config.audio)?;
    let broker = ConvoBroker::new(config, store, splitter.input(), Box::new(sink));

    let (event_tx, event_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let vad_config = config.vad.clone();
    let monitor_cancel = cancel.clone();
    tokio::spawn(async move {
        vad::run_monitor(&vad_config, chunk_rx, event_tx, monitor_cancel).await;
    });
    broker.attach_vad(event_rx);

    info!("listening, speak to start a turn, Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    splitter.stop();
    broker.stop_playing();
    Ok(())
}
