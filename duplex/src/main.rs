use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use anyhow::anyhow;

use waav_duplex::core::capture::{CaptureEncoder, CaptureError};
use waav_duplex::core::playback::{CpalOutput, PlaybackScheduler};
use waav_duplex::core::probe;
use waav_duplex::{
    CpalCaptureSource, EngineConfig, EngineContext, SessionAction, SessionCoordinator,
    SessionProtocolClient, TranscriptUpdate,
};

/// WaaV Duplex - Full-duplex realtime voice conversation
#[derive(Parser, Debug)]
#[command(name = "waav-duplex")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Default)]
enum Commands {
    /// Start a conversation (default)
    #[default]
    Run,

    /// Print the audio capability probe as JSON
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // Parse CLI arguments
    let cli = Cli::parse();

    if let Commands::Devices = cli.command.unwrap_or_default() {
        let capabilities = probe::probe()?;
        println!("{}", serde_json::to_string_pretty(&capabilities)?);
        if !capabilities.supports_duplex() {
            anyhow::bail!("host has no usable input/output device pair");
        }
        return Ok(());
    }

    // Load configuration from file or environment
    let config = if let Some(config_path) = cli.config {
        println!("Loading configuration from {}", config_path.display());
        EngineConfig::from_file(&config_path)?
    } else {
        EngineConfig::from_env()?
    };
    if config.connection.api_key.is_empty() {
        tracing::warn!("no API key configured; set OPENAI_API_KEY or connection.api_key");
    }

    run(config).await
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let context = EngineContext::new(config);
    let config = context.config.clone();

    // Output device; the stream must stay alive on this task
    let (output, completions) = CpalOutput::open(config.playback.device.as_deref())?;
    info!(device = output.device_name(), "using output device");
    let scheduler = Arc::new(PlaybackScheduler::new(
        Arc::new(output.handle()),
        config.playback.lead_seconds(),
    ));
    let _completions = scheduler.attach_completions(completions);

    let client = SessionProtocolClient::new(config.connection.clone());
    let coordinator = SessionCoordinator::new(context.clone(), client, scheduler)?;

    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<String>();
    coordinator.on_transcript(Arc::new(|update: TranscriptUpdate| {
        if update.is_final {
            println!("[{}] {}", update.role, update.text);
        }
    }));
    let action_failed = failed_tx.clone();
    coordinator.on_action(Arc::new(move |action: SessionAction| match action {
        SessionAction::Failed { error } => {
            let _ = action_failed.send(error);
        }
        SessionAction::Reconnecting { attempt } => info!(attempt, "reconnecting"),
        other => tracing::debug!(action = ?other, "session action"),
    }));

    // Microphone
    let mut capture = CaptureEncoder::new(
        Box::new(CpalCaptureSource::new(config.capture.device.clone())),
        config.capture.clone(),
    );
    capture.on_error(Arc::new(move |e: CaptureError| {
        let _ = failed_tx.send(e.to_string());
    }));
    capture.initialize()?;

    coordinator.start().await?;
    capture.start(coordinator.frame_callback())?;
    println!("Listening. Press Ctrl-C to end the conversation.");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.map_err(|e| anyhow!("Failed to listen for Ctrl-C: {e}")),
        Some(error) = failed_rx.recv() => Err(anyhow!("Session failed: {error}")),
    };

    capture.stop();
    coordinator.finish().await?;
    capture.dispose();

    let stats = coordinator.stats();
    info!(
        frames_sent = stats.engine.frames_sent,
        chunks_scheduled = stats.engine.chunks_scheduled,
        barge_ins = stats.engine.barge_ins,
        underruns = stats.playback.underruns,
        "session ended"
    );
    outcome
}
