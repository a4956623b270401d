//! [`Transport`] implementation over the platform Bluetooth stack (btleplug).
//!
//! Works with BlueZ on Linux, CoreBluetooth on macOS, and WinRT on Windows.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{Link, Transport};
use crate::types::{CharProps, CharacteristicInfo, DeviceDescriptor, LinkEvent, ServiceInfo};

/// Notifications buffered between the BLE stack and the session loop.
const EVENT_QUEUE: usize = 1024;

/// Upper bound on GATT discovery after the link is up.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::DeviceNotFound => TransportError::UnknownPeripheral(String::new()),
            btleplug::Error::TimedOut(after) => TransportError::Timeout {
                operation: "btleplug",
                after,
            },
            other => TransportError::Backend(other.to_string()),
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// A BLE central bound to the first Bluetooth adapter of the host.
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Open the first adapter.
    ///
    /// On macOS, `CBCentralManager` needs a moment to reach the *poweredOn*
    /// state after initialisation; we wait up to 3 s for that before the
    /// first scan, because scanning earlier is a silent no-op.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                            break;
                        }
                        debug!("macOS: adapter state = {state:?}, waiting…");
                    }
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        if let Ok(info) = adapter.adapter_info().await {
            info!("using Bluetooth adapter {info}");
        }
        Ok(Self { adapter })
    }

    async fn find(&self, address: &str) -> Result<Peripheral, TransportError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| TransportError::UnknownPeripheral(address.to_owned()))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;
        tokio::time::sleep(window).await;
        self.adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in self.adapter.peripherals().await? {
            let name = match p.properties().await {
                Ok(Some(props)) => props.local_name,
                _ => None,
            };
            found.push(DeviceDescriptor {
                address: p.id().to_string(),
                advertised_name: name,
            });
        }
        debug!("scan: {} peripheral(s) visible", found.len());
        Ok(found)
    }

    async fn connect(&self, address: &str) -> Result<BtleplugLink, TransportError> {
        let peripheral = self.find(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_owned(),
                reason: e.to_string(),
            })?;

        // On Linux (bluez-async / D-Bus) the BLE stack signals connection
        // completion before the remote GATT service cache is populated.
        // Calling discover_services() too quickly can return an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVERY_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "discover_services",
                after: DISCOVERY_TIMEOUT,
            })??;
        info!("connected and services discovered: {address}");

        Ok(BtleplugLink {
            peripheral,
            adapter: self.adapter.clone(),
            tasks: Vec::new(),
        })
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

pub struct BtleplugLink {
    peripheral: Peripheral,
    adapter: Adapter,
    tasks: Vec<JoinHandle<()>>,
}

fn char_props(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn service_info(service: &Service) -> ServiceInfo {
    ServiceInfo {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                props: char_props(c.properties),
            })
            .collect(),
    }
}

#[async_trait]
impl Link for BtleplugLink {
    async fn services(&mut self) -> Result<Vec<ServiceInfo>, TransportError> {
        let services: BTreeSet<Service> = self.peripheral.services();
        Ok(services.iter().map(service_info).collect())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        let ch = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| TransportError::Subscribe {
                characteristic,
                reason: "characteristic not found".into(),
            })?;
        self.peripheral
            .subscribe(&ch)
            .await
            .map_err(|e| TransportError::Subscribe {
                characteristic,
                reason: e.to_string(),
            })
    }

    async fn events(&mut self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let mut notifications = self.peripheral.notifications().await?;

        // ── Disconnect watcher ────────────────────────────────────────────────
        // The adapter's DeviceDisconnected event usually fires well before the
        // notification stream closes.
        let disconnect_tx = tx.clone();
        let adapter = self.adapter.clone();
        let peripheral_id = self.peripheral.id();
        self.tasks.push(tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("disconnect watcher: device {id:?} disconnected");
                                let _ = disconnect_tx.send(LinkEvent::Dropped).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("disconnect watcher: could not subscribe to adapter events: {e}");
                }
            }
        }));

        // ── Notification forwarder ────────────────────────────────────────────
        self.tasks.push(tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(notif) = notifications.next().await {
                count += 1;
                if count <= 3 || count % 500 == 0 {
                    debug!(
                        "notif #{count} uuid={} len={}",
                        notif.uuid,
                        notif.value.len()
                    );
                }
                let event = LinkEvent::Notification {
                    characteristic: notif.uuid,
                    value: notif.value,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            info!("notification stream ended after {count} packet(s)");
            let _ = tx.send(LinkEvent::Dropped).await;
        }));

        Ok(rx)
    }

    async fn is_active(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
