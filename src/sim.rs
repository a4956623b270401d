//! In-process stand-in for the camera peripheral.
//!
//! Streams synthetic RGB565 frames in notification-sized packets at a
//! configurable pace.  Used by the binary's `--simulate` flag so the whole
//! pipeline can be exercised without Bluetooth hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::encode_rgb565;
use crate::transport::{Link, Transport};
use crate::types::{CharProps, CharacteristicInfo, DeviceDescriptor, LinkEvent, ServiceInfo};

/// Service exposed by the simulated camera.
pub const SIM_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Notify characteristic carrying frame packets.
pub const SIM_IMAGE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
/// Write-only control characteristic.  Never subscribed.
pub const SIM_CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Build one RGB565 test frame: a diagonal gradient that shifts with `frame`.
pub fn test_pattern(width: u32, height: u32, frame: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(width as usize * height as usize * 2);
    for y in 0..height {
        for x in 0..width {
            let r = ((x as u64 * 255 / width.max(1) as u64) + frame * 16) as u8;
            let g = (y as u64 * 255 / height.max(1) as u64) as u8;
            let b = ((x + y) as u64 + frame * 32) as u8;
            raw.extend_from_slice(&encode_rgb565(r, g, b));
        }
    }
    raw
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub address: String,
    pub width: u32,
    pub height: u32,
    pub packet_bytes: usize,
    /// Pause between packets.
    pub packet_interval: Duration,
    /// Pause between frames.
    pub frame_interval: Duration,
    /// Drop the link after this many frames; `None` streams forever.
    pub frames_per_connection: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: crate::protocol::DEFAULT_DEVICE_NAME.into(),
            address: "SI:MU:LA:TE:D0:01".into(),
            width: crate::protocol::DEFAULT_WIDTH,
            height: crate::protocol::DEFAULT_HEIGHT,
            packet_bytes: crate::protocol::DEFAULT_MAX_PACKET_BYTES,
            packet_interval: Duration::from_millis(2),
            frame_interval: Duration::from_secs(1),
            frames_per_connection: None,
        }
    }
}

/// A [`Transport`] whose only peripheral is a simulated camera.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    config: SimConfig,
}

impl SimulatedTransport {
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    type Link = SimulatedLink;

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        // A real scan takes the whole window; keep the pacing but cap it.
        tokio::time::sleep(window.min(Duration::from_millis(200))).await;
        Ok(vec![DeviceDescriptor::new(
            self.config.address.clone(),
            Some(&self.config.name),
        )])
    }

    async fn connect(&self, address: &str) -> Result<SimulatedLink, TransportError> {
        if address != self.config.address {
            return Err(TransportError::UnknownPeripheral(address.to_owned()));
        }
        info!("simulator: connected to {}", self.config.name);
        Ok(SimulatedLink {
            config: self.config.clone(),
            subscribed: false,
            active: Arc::new(AtomicBool::new(true)),
            producer: None,
        })
    }
}

pub struct SimulatedLink {
    config: SimConfig,
    subscribed: bool,
    active: Arc<AtomicBool>,
    producer: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Link for SimulatedLink {
    async fn services(&mut self) -> Result<Vec<ServiceInfo>, TransportError> {
        Ok(vec![ServiceInfo {
            uuid: SIM_SERVICE_UUID,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: SIM_CONTROL_CHARACTERISTIC,
                    props: CharProps {
                        write: true,
                        ..Default::default()
                    },
                },
                CharacteristicInfo {
                    uuid: SIM_IMAGE_CHARACTERISTIC,
                    props: CharProps {
                        notify: true,
                        read: true,
                        ..Default::default()
                    },
                },
            ],
        }])
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        if characteristic != SIM_IMAGE_CHARACTERISTIC {
            return Err(TransportError::Subscribe {
                characteristic,
                reason: "characteristic does not support notify".into(),
            });
        }
        self.subscribed = true;
        Ok(())
    }

    async fn events(&mut self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        if !self.subscribed {
            // Nothing subscribed: the channel stays open but silent.
            self.producer = Some(tokio::spawn(async move {
                tx.closed().await;
            }));
            return Ok(rx);
        }
        let config = self.config.clone();
        let active = Arc::clone(&self.active);
        self.producer = Some(tokio::spawn(async move {
            let mut frame = 0u64;
            loop {
                if config.frames_per_connection.is_some_and(|n| frame >= n) {
                    info!("simulator: dropping link after {frame} frame(s)");
                    active.store(false, Ordering::SeqCst);
                    let _ = tx.send(LinkEvent::Dropped).await;
                    return;
                }
                let raw = test_pattern(config.width, config.height, frame);
                for chunk in raw.chunks(config.packet_bytes.max(1)) {
                    let event = LinkEvent::Notification {
                        characteristic: SIM_IMAGE_CHARACTERISTIC,
                        value: chunk.to_vec(),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    if !config.packet_interval.is_zero() {
                        tokio::time::sleep(config.packet_interval).await;
                    }
                }
                debug!("simulator: frame {frame} sent");
                frame += 1;
                tokio::time::sleep(config.frame_interval).await;
            }
        }));
        Ok(rx)
    }

    async fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        Ok(())
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}
