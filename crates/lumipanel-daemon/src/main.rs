//! Lumipanel Daemon
//!
//! Background service driving the panel's serial-attached display:
//! bring-up, event logging and on-demand GUI updates from the manager.

mod config;
mod payload;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lumipanel_link::{
    DisplayLink, LinkEvent, ProtocolVariant, SerialEvent, SerialTransport, UpdateEngine,
    UpdateStatus, DEFAULT_BAUD_RATE,
};

use config::Config;
use payload::HttpPayloadSource;

/// Exit code asking the service manager to restart us. Used after a
/// display update, when only a fresh bring-up returns the link to
/// service.
const EXIT_RESTART: i32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = Config::load(&config_path).context("Failed to load configuration")?;
    info!("Loaded configuration from: {}", config_path);

    // Write side of the link. The byte pump below opens a second
    // handle on the same device for reading.
    let mut transport = SerialTransport::open_default(&config.serial.device)
        .context("Failed to open display serial port")?;
    if let Some(gpio) = &config.serial.power_gpio {
        transport = transport.with_power_gpio(gpio);
    }

    let (serial_tx, serial_rx) = mpsc::channel(16);
    tokio::spawn(byte_pump(config.serial.device.clone(), serial_tx));

    let link = DisplayLink::new(transport);
    link.start(serial_rx);

    let log_events = link.subscribe();
    tokio::spawn(event_log_loop(log_events));

    link.bring_up().await.context("Display bring-up failed")?;

    if config.update.on_start {
        run_update(&config, link.clone()).await?;
        info!("Display updated, restarting to re-establish the link");
        std::process::exit(EXIT_RESTART);
    }

    // Setup Unix signal handlers
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    Ok(())
}

/// Fetches the GUI file from the manager and transfers it to the
/// display.
async fn run_update(config: &Config, link: Arc<DisplayLink<SerialTransport>>) -> Result<()> {
    let variant: ProtocolVariant = config
        .update
        .protocol
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let url = config.manager.tft_url();
    info!("Updating display GUI from {}", url);

    let engine = UpdateEngine::new(link, HttpPayloadSource::new(url), config.update.baud_rate)
        .with_variant(variant);
    tokio::spawn(status_log_loop(engine.subscribe_status()));

    engine.run().await.context("Display update failed")?;
    Ok(())
}

/// Reads raw bytes off the display serial port and feeds them to the
/// link's reader task.
async fn byte_pump(device: String, tx: mpsc::Sender<SerialEvent>) {
    let mut port = match tokio_serial::new(&device, DEFAULT_BAUD_RATE).open_native_async() {
        Ok(mut port) => {
            if let Err(e) = port.set_exclusive(false) {
                error!("Failed to share display serial port: {}", e);
                return;
            }
            port
        }
        Err(e) => {
            error!("Failed to open display serial port for reading: {}", e);
            return;
        }
    };

    let mut buf = [0u8; 256];
    loop {
        match port.read(&mut buf).await {
            Ok(0) => tokio::time::sleep(Duration::from_millis(10)).await,
            Ok(n) => {
                if tx.send(SerialEvent::Data(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Display serial read error: {}", e);
                if tx.send(SerialEvent::Overflow).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Byte pump exiting");
}

/// Logs display events for the journal.
async fn event_log_loop(mut events: broadcast::Receiver<LinkEvent>) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::TouchEvent {
                page,
                component,
                pressed,
            }) => {
                info!(
                    "Touch {} on page {}, component {}",
                    if pressed { "press" } else { "release" },
                    page,
                    component
                );
            }
            Ok(LinkEvent::SleepRequested) => info!("Display entering sleep"),
            Ok(LinkEvent::WakeRequested) => info!("Display woke from sleep"),
            Ok(LinkEvent::Unknown(frame)) => {
                debug!("Unhandled display frame: {:02X?}", frame);
            }
            Ok(event) => debug!("Display event: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event log fell behind, {} events missed", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Logs update progress for the journal.
async fn status_log_loop(mut status: broadcast::Receiver<UpdateStatus>) {
    loop {
        match status.recv().await {
            Ok(UpdateStatus::Started { total_size }) => {
                info!("Display update started, {} bytes", total_size);
            }
            Ok(UpdateStatus::Progress { offset, total_size }) => {
                info!(
                    "Display update progress: {}/{} bytes ({}%)",
                    offset,
                    total_size,
                    offset * 100 / total_size
                );
            }
            Ok(UpdateStatus::Finished) => info!("Display update transfer complete"),
            Ok(UpdateStatus::Failed) => error!("Display update failed"),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
