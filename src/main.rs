//! rtsp-audio-client - streams audio from an RTSP/RTP server
//!
//! Line-oriented front-end: commands are read from stdin, client events are
//! printed to stdout.

mod audio;
mod cache;
mod client;
mod config;
mod rtp;
mod rtsp;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use audio::{PlaybackEngine, output_device_names, spawn_audio_thread};
use cache::DiskStore;
use client::{ClientEvent, ClientEventReceiver, ClientSnapshot, spawn_client};
use config::Settings;
use rtsp::SessionState;

/// How long `quit` waits for the server to confirm teardown
const QUIT_TEARDOWN_WAIT: Duration = Duration::from_secs(3);

/// Stream audio from an RTSP server over RTP
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Control server host
    server_host: String,

    /// Control server port
    server_port: u16,

    /// Local port for the RTP data channel
    rtp_port: u16,

    /// Resource to stream (e.g. movie.mp3)
    resource: String,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for cached segments
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Bytes per cached segment
    #[arg(long)]
    segment_bytes: Option<usize>,

    /// Datagram receive timeout in milliseconds
    #[arg(long)]
    receive_timeout_ms: Option<u64>,

    /// Audio output device name
    #[arg(long)]
    device: Option<String>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_config: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        settings.server_host = self.server_host.clone();
        settings.server_port = self.server_port;
        settings.rtp_port = self.rtp_port;
        settings.resource = self.resource.clone();
        if let Some(dir) = &self.cache_dir {
            settings.cache_dir = Some(dir.clone());
        }
        if let Some(bytes) = self.segment_bytes {
            settings.segment_threshold_bytes = bytes;
        }
        if let Some(ms) = self.receive_timeout_ms {
            settings.receive_timeout_ms = ms;
        }
        if let Some(device) = &self.device {
            settings.audio_output_device = Some(device.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from_file(path)
            .with_context(|| format!("Failed to load settings from {:?}", path))?,
        None => Settings::load(),
    };
    cli.apply(&mut settings);

    if cli.save_config {
        match &cli.config {
            Some(path) => settings.save_to_file(path),
            None => settings.save(),
        }
        .context("Failed to save settings")?;
    }

    if let Some(device) = &settings.audio_output_device {
        let available = output_device_names();
        if !available.contains(device) {
            warn!("Output device {:?} not found; available: {:?}", device, available);
        }
    }

    let store = DiskStore::open(settings.segments_dir()).context("Failed to open segment cache")?;
    info!("Caching segments in {:?}", store.dir());

    let mut audio = spawn_audio_thread(settings.audio_output_device.as_deref(), settings.volume)
        .map_err(anyhow::Error::msg)?;
    let audio_events = audio
        .take_event_rx()
        .context("Audio event receiver already taken")?;
    let engine: Arc<dyn PlaybackEngine> = Arc::new(audio.handle.clone());

    let mut client = spawn_client(settings, engine, audio_events, Arc::new(store));
    let mut events = client
        .take_event_rx()
        .context("Client event receiver already taken")?;
    let handle = client.handle.clone();

    println!("Commands: setup, play, pause, teardown, status, volume <0-1>, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let mut words = line.split_whitespace();
                match words.next() {
                    Some("setup") => handle.setup(),
                    Some("play") => handle.play(),
                    Some("pause") => handle.pause(),
                    Some("teardown") => handle.teardown(),
                    Some("status") => {
                        print_snapshot(&handle.snapshot());
                        let playback = audio.handle.state();
                        println!(
                            "audio={:?} track={:?} queued={} volume={:.2}",
                            playback.status(),
                            audio.handle.current_path(),
                            playback.queued(),
                            playback.volume()
                        );
                    }
                    Some("volume") => match words.next().and_then(|v| v.parse::<f32>().ok()) {
                        Some(volume) => audio.handle.set_volume(volume),
                        None => println!("Usage: volume <0-1>"),
                    },
                    Some("quit") | Some("exit") => break,
                    Some(other) => println!("Unknown command: {}", other),
                    None => {}
                }
            }
            Some(event) = events.recv() => print_event(&event),
        }
    }

    // Same as closing the player window: pause, then tear down
    if handle.snapshot().state != SessionState::Init {
        handle.pause();
        handle.teardown();
        wait_for_teardown(&mut events).await;
    }
    client.join().await;
    Ok(())
}

async fn wait_for_teardown(events: &mut ClientEventReceiver) {
    let waited = tokio::time::timeout(QUIT_TEARDOWN_WAIT, async {
        while let Some(event) = events.recv().await {
            print_event(&event);
            if matches!(event, ClientEvent::TornDown { .. }) {
                return;
            }
        }
    })
    .await;
    if waited.is_err() {
        warn!("Server did not confirm teardown; cleaning up locally");
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected { peer } => println!("Connected to {}", peer),
        ClientEvent::StateChanged { old, new } => println!("State: {} -> {}", old, new),
        ClientEvent::SegmentReady { index, bytes } => {
            println!("Segment {} ready ({} bytes)", index, bytes)
        }
        ClientEvent::ReceiverStopped { reason } => println!("Receiver stopped: {}", reason),
        ClientEvent::TornDown { deleted, failed } => {
            println!("Torn down: {} segments deleted, {} left behind", deleted, failed)
        }
        ClientEvent::Error { message } => println!("Error: {}", message),
        ClientEvent::Status(status) => println!("{}", status),
    }
}

fn print_snapshot(snapshot: &ClientSnapshot) {
    println!(
        "state={} session={} connected={} data_port={} highest_seq={} segments={} buffered={}",
        snapshot.state,
        snapshot.session_id,
        snapshot.connected,
        snapshot
            .data_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
        snapshot.highest_sequence,
        snapshot.segments_ready,
        snapshot.buffered_bytes
    );
}
