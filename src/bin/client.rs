//! Audio Streamer Client
//!
//! Finds a server through discovery (or takes one on the command line),
//! plays its stream and optionally sends the microphone back.
//!
//! Usage: `streamer-client [ip:port[:multicast]]`

use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wifi_audio_streamer::{
    audio::{list_devices, AudioDeviceInfo, CpalProvider},
    config::AppConfig,
    network::PeerRegistry,
    protocol::{PeerDescriptor, TransportMode},
    session::{ClientOptions, SessionManager, SessionState},
    status::JsonLinesSink,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting WiFi Audio Streamer client");

    let config = AppConfig::load().context("Failed to load configuration")?;

    eprintln!("\n=== Available Output Devices ===");
    let devices = list_devices();
    for device in devices.iter().filter(|d| d.is_output) {
        print_device(device);
    }
    eprintln!();

    let manager = SessionManager::new(
        Arc::new(CpalProvider),
        Arc::new(JsonLinesSink),
        config.network.clone(),
    );

    let peer = match std::env::args().nth(1) {
        Some(arg) => parse_peer(&arg)?,
        None => discover(&manager).await?,
    };

    let mut opts = ClientOptions::from_config(&config, peer);
    if opts.playback_device.is_none() {
        opts.playback_device = devices
            .iter()
            .find(|d| d.is_output && d.is_default)
            .map(|d| d.id.clone());
    }
    if opts.send_mic && opts.mic_capture_device.is_none() {
        opts.mic_capture_device = devices
            .iter()
            .find(|d| d.is_input && d.is_default)
            .map(|d| d.id.clone());
    }

    let mut state = manager.subscribe_state();
    manager.start_client(opts).await?;
    tracing::info!("Client running - press Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Ctrl+C received");
        }
        _ = state.wait_for(|s| *s == SessionState::Idle) => {
            tracing::info!("Session ended");
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Listen until the first server is heard
async fn discover(manager: &SessionManager) -> Result<PeerDescriptor> {
    let registry = Arc::new(PeerRegistry::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    {
        let registry = registry.clone();
        manager.start_discovery(move |hostname, peer| {
            if registry.upsert(hostname.clone(), peer).is_none() {
                let _ = tx.send((hostname, peer));
            }
        });
    }
    tracing::info!("Looking for servers - press Ctrl+C to give up");

    let found = tokio::select! {
        found = rx.recv() => found,
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            None
        }
    };

    manager.stop_discovery().await;
    let Some((hostname, peer)) = found else {
        bail!("No server selected");
    };

    for (name, known) in registry.snapshot() {
        eprintln!("  {} at {}:{} ({})", name, known.addr, known.port, known.mode);
    }
    tracing::info!("Connecting to {} at {}:{}", hostname, peer.addr, peer.port);
    Ok(peer)
}

/// Parse `ip:port[:multicast]`
fn parse_peer(arg: &str) -> Result<PeerDescriptor> {
    let mut parts = arg.splitn(3, ':');
    let addr: IpAddr = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("Invalid server address: {}", arg))?;
    let port: u16 = match parts.next() {
        Some(port) => port
            .parse()
            .with_context(|| format!("Invalid server port: {}", arg))?,
        None => bail!("Expected ip:port[:multicast], got {}", arg),
    };
    let mode = parts
        .next()
        .map(TransportMode::parse)
        .unwrap_or(TransportMode::Unicast);

    Ok(PeerDescriptor::new(addr, mode, port))
}

fn print_device(device: &AudioDeviceInfo) {
    let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
    eprintln!("  {}{}:", device.name, default_marker);
    eprintln!("    ID: {}", device.id);
    eprintln!("    Sample rates: {:?}", device.sample_rates);
    eprintln!("    Channels: {:?}", device.channels);
}
