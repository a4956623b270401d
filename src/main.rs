use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use ble_image_rx::ble::BtleplugTransport;
use ble_image_rx::config::{ReceiverConfig, StallPolicy};
use ble_image_rx::emitter::{FrameEmitter, PngFileSink};
use ble_image_rx::session::SessionController;
use ble_image_rx::sim::{SimConfig, SimulatedTransport};
use ble_image_rx::transport::Transport;
use ble_image_rx::types::ReceiverEvent;

/// Receive RGB565 still frames from a BLE camera and save them as PNG files.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON config file; flags below override its values.
    #[arg(long, env = "BLE_IMAGE_RX_CONFIG")]
    config: Option<PathBuf>,

    /// Connect to peripherals whose advertised name contains this string.
    #[arg(long, env = "BLE_IMAGE_RX_NAME")]
    name: Option<String>,

    /// Match the name filter case-insensitively.
    #[arg(long)]
    ignore_case: bool,

    #[arg(long, env = "BLE_IMAGE_RX_WIDTH")]
    width: Option<u32>,

    #[arg(long, env = "BLE_IMAGE_RX_HEIGHT")]
    height: Option<u32>,

    #[arg(long, env = "BLE_IMAGE_RX_MAX_PACKET_BYTES")]
    max_packet_bytes: Option<usize>,

    /// Idle time after which a partial frame is discarded.
    #[arg(long, env = "BLE_IMAGE_RX_FRAME_TIMEOUT_MS")]
    frame_timeout_ms: Option<u64>,

    /// Stay connected after a stalled frame instead of reconnecting.
    #[arg(long)]
    restart_stalled_frames: bool,

    /// Subscribe only to this characteristic instead of every notify one.
    #[arg(long, env = "BLE_IMAGE_RX_CHARACTERISTIC")]
    characteristic: Option<Uuid>,

    #[arg(long, env = "BLE_IMAGE_RX_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    #[arg(long, env = "BLE_IMAGE_RX_PREFIX")]
    prefix: Option<String>,

    /// Use the built-in simulated camera instead of Bluetooth.
    #[arg(long)]
    simulate: bool,
}

impl Args {
    fn into_config(self) -> Result<ReceiverConfig> {
        let mut config = match &self.config {
            Some(path) => ReceiverConfig::from_file(path)?,
            None => ReceiverConfig::default(),
        };
        if let Some(name) = self.name {
            config.device_name_filter = name;
        }
        if self.ignore_case {
            config.case_sensitive = false;
        }
        if let Some(w) = self.width {
            config.image_width = w;
        }
        if let Some(h) = self.height {
            config.image_height = h;
        }
        if let Some(n) = self.max_packet_bytes {
            config.max_packet_bytes = n;
        }
        if let Some(ms) = self.frame_timeout_ms {
            config.frame_timeout_ms = ms;
        }
        if self.restart_stalled_frames {
            config.stall_policy = StallPolicy::RestartFrame;
        }
        if self.characteristic.is_some() {
            config.target_characteristic = self.characteristic;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(prefix) = self.prefix {
            config.file_prefix = prefix;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=ble_image_rx=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let simulate = args.simulate;
    let config = args.into_config()?;

    if simulate {
        info!("Using the simulated camera.");
        let sim = SimConfig {
            name: config.device_name_filter.clone(),
            width: config.image_width,
            height: config.image_height,
            packet_bytes: config.max_packet_bytes,
            ..Default::default()
        };
        run(Arc::new(SimulatedTransport::new(sim)), config).await
    } else {
        let transport = BtleplugTransport::new()
            .await
            .context("could not open a Bluetooth adapter")?;
        run(Arc::new(transport), config).await
    }
}

async fn run<T: Transport>(transport: Arc<T>, config: ReceiverConfig) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<ReceiverEvent>(256);
    let sink = PngFileSink::new(&config.output_dir, &config.file_prefix);
    let emitter = FrameEmitter::spawn(sink, Some(tx.clone()));
    let controller = SessionController::new(transport, config, emitter).with_events(tx);

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    let stop = controller.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping …");
        }
        stop.cancel();
    });

    // ── Event printer ─────────────────────────────────────────────────────────
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ReceiverEvent::DeviceFound(d) => {
                    println!("[FOUND]    {}  address={}", d.label(), d.address)
                }
                ReceiverEvent::Subscribed(uuid) => println!("[SUBSCRIBE] {uuid}"),
                ReceiverEvent::FrameCompleted { packets } => {
                    println!("[FRAME]    complete after {packets} packets")
                }
                ReceiverEvent::FrameSaved { sequence, location } => {
                    println!("[SAVED]    #{sequence} → {}", location.display())
                }
                ReceiverEvent::EmitFailed { sequence, reason } => {
                    error!("frame #{sequence} not saved: {reason}")
                }
                ReceiverEvent::FrameDiscarded { received, reason } => {
                    warn!("frame discarded after {received} bytes: {reason}")
                }
                // Transitions and errors are already logged by the controller.
                ReceiverEvent::StateChanged { .. }
                | ReceiverEvent::FrameEmitted { .. }
                | ReceiverEvent::Error { .. } => {}
            }
        }
    });

    controller.run().await;
    printer.abort();
    info!("Receiver finished – exiting.");
    Ok(())
}
