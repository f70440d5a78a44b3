//! CLI binary for parley.

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use parley::audio::capture::CpalInputSource;
use parley::audio::playback::CpalOutput;
use parley::pipeline::capture::VadFactory;
use parley::stt::Transcriber;
use parley::vad::EnergyVad;
use parley::{ConversationEngine, EngineConfig, EngineDevices, EngineError, StreamEvent, Utterance};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

/// Parley: client-side streaming conversation engine.
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a typed conversation with streamed spoken replies.
    Chat,

    /// List available audio devices.
    Devices,
}

/// Hands-free needs an external speech-to-text engine wired in; the CLI
/// runs typed chat only, so utterances are dropped if capture ever runs.
struct UnconfiguredTranscriber;

#[async_trait::async_trait]
impl Transcriber for UnconfiguredTranscriber {
    async fn transcribe(&self, _utterance: &Utterance) -> parley::Result<String> {
        Err(EngineError::Transcription(
            "no transcriber configured".into(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Suppress noisy dependency logs by default; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => EngineConfig::load_from_file(path)?,
        None => match EngineConfig::default_path() {
            Some(path) if path.exists() => EngineConfig::load_from_file(&path)?,
            _ => EngineConfig::default(),
        },
    };

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config).await,
        Command::Devices => list_devices(),
    }
}

async fn run_chat(config: EngineConfig) -> anyhow::Result<()> {
    println!("Parley v{}", env!("CARGO_PKG_VERSION"));
    println!("Connected to {}", config.stream.base_url);

    let vad_config = config.vad.clone();
    let vad: VadFactory = Arc::new(move || Box::new(EnergyVad::new(&vad_config)));
    let devices = EngineDevices {
        output: Box::new(CpalOutput::new(&config.audio)?),
        input: Arc::new(CpalInputSource::new(&config.audio)),
        vad,
        transcriber: Arc::new(UnconfiguredTranscriber),
    };
    let engine = ConversationEngine::new(config, devices)?;

    println!("\nType a message and press Enter. Ctrl+C or empty line to quit.\n");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        let mut stream = engine.send_turn(line);
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta(delta) => {
                    print!("{delta}");
                    std::io::stdout().flush()?;
                }
                StreamEvent::TextComplete => println!(),
                StreamEvent::Done(_) => {}
                StreamEvent::Error { message, status } => match status {
                    Some(status) => eprintln!("\nerror ({status}): {message}"),
                    None => eprintln!("\nerror: {message}"),
                },
                StreamEvent::AudioChunk(_) => {
                    // Played through the engine's sequencer.
                }
            }
        }
        println!();
    }

    engine.shutdown();
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalInputSource::list_input_devices()? {
        println!("  {name}");
    }
    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}
