//! # ble-image-rx
//!
//! Async Rust library and CLI for receiving still images from a Bluetooth Low
//! Energy camera peripheral.
//!
//! The peripheral pushes each frame as a gapless run of GATT notifications of
//! raw big-endian RGB565 pixels.  The receiver finds the peripheral by name,
//! subscribes to its notify characteristics, reassembles the frame, converts
//! it to RGB888 on the tokio worker pool, and saves it as a PNG, then waits
//! for the next frame.  Disconnects, stalled frames, and conversion faults
//! are recovered from automatically; the receiver only stops when told to.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ble_image_rx::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ReceiverConfig::default();
//!     config.validate()?;
//!
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let sink = PngFileSink::new(&config.output_dir, &config.file_prefix);
//!     let emitter = FrameEmitter::spawn(sink, None);
//!
//!     let controller = SessionController::new(transport, config, emitter);
//!     let stop = controller.stop_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         stop.cancel();
//!     });
//!     controller.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | The receiver state machine ([`session::SessionController`]) |
//! | [`locator`] | Repeated, backed-off scanning for the target peripheral |
//! | [`assembler`] | Raw frame buffer and write cursor |
//! | [`converter`] | RGB565 → RGB888 conversion and the per-frame barrier |
//! | [`emitter`] | Frame numbering and background persistence |
//! | [`transport`] | The BLE seam: [`transport::Transport`] and [`transport::Link`] |
//! | [`ble`] | btleplug implementation of the transport |
//! | [`sim`] | Simulated camera peripheral |
//! | [`config`] | [`config::ReceiverConfig`] |
//! | [`protocol`] | Frame geometry and pixel-format constants |
//! | [`types`] | Events and data types |
//! | [`error`] | Error taxonomy |

pub mod assembler;
pub mod ble;
pub mod config;
pub mod converter;
pub mod emitter;
pub mod error;
pub mod locator;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Receiver ──────────────────────────────────────────────────────────────
    pub use crate::config::{ReceiverConfig, StallPolicy};
    pub use crate::emitter::{FrameEmitter, FrameSink, MemorySink, PngFileSink};
    pub use crate::session::{SessionController, SessionEnd};

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::ble::BtleplugTransport;
    pub use crate::sim::{SimConfig, SimulatedTransport};
    pub use crate::transport::{Link, Transport};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::error::SessionError;
    pub use crate::types::{DeviceDescriptor, EmittedFrame, ReceiverEvent, SessionState};
}
