//! Audio Streamer Server
//!
//! Captures an input device and streams it to one client or to the
//! multicast group. Status events are printed to stdout as JSON lines.
//!
//! Usage: `streamer-server [capture-device-id]`

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wifi_audio_streamer::{
    audio::{list_devices, preferred_mic_output, AudioDeviceInfo, CpalProvider},
    config::AppConfig,
    session::{ServerOptions, SessionManager, SessionState},
    status::JsonLinesSink,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine readable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting WiFi Audio Streamer server");

    let config = AppConfig::load().context("Failed to load configuration")?;

    eprintln!("\n=== Available Audio Devices ===");
    let devices = list_devices();
    for device in &devices {
        print_device(device);
    }
    eprintln!();

    let mut opts = ServerOptions::from_config(&config);
    if let Some(id) = std::env::args().nth(1) {
        opts.capture_device = Some(id);
    }
    if opts.capture_device.is_none() {
        opts.capture_device = devices
            .iter()
            .find(|d| d.is_input && d.is_default)
            .map(|d| d.id.clone());
    }
    if opts.mic_playback_device.is_none() {
        opts.mic_playback_device = preferred_mic_output(&devices).map(|d| d.id.clone());
    }

    tracing::info!(
        "Capture: {}, mic output: {}",
        opts.capture_device.as_deref().unwrap_or("<none>"),
        opts.mic_playback_device.as_deref().unwrap_or("<none>")
    );

    let manager = SessionManager::new(
        Arc::new(CpalProvider),
        Arc::new(JsonLinesSink),
        config.network.clone(),
    );
    let mut state = manager.subscribe_state();

    manager.start_server(opts).await?;
    tracing::info!("Server running - press Ctrl+C to stop");

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

fn print_device(device: &AudioDeviceInfo) {
    let device_type = match (device.is_input, device.is_output) {
        (true, true) => "Input/Output",
        (true, false) => "Input",
        (false, true) => "Output",
        _ => "Unknown",
    };
    let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
    eprintln!("  {} ({}){}:", device.name, device_type, default_marker);
    eprintln!("    ID: {}", device.id);
    eprintln!("    Sample rates: {:?}", device.sample_rates);
    eprintln!("    Channels: {:?}", device.channels);
}
