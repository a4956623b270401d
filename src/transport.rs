//! The seam between the receive pipeline and a BLE stack.
//!
//! [`crate::ble::BtleplugTransport`] implements these traits over the
//! platform Bluetooth stack; [`crate::sim::SimulatedTransport`] implements them
//! in-process for `--simulate` and tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::types::{DeviceDescriptor, LinkEvent, ServiceInfo};

/// A BLE central able to find and connect to peripherals.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    /// Scan for `window` and return every peripheral currently visible.
    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open a connection.  The returned link is owned by exactly one session.
    async fn connect(&self, address: &str) -> Result<Self::Link, TransportError>;
}

/// An established connection to one peripheral.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Discovered GATT services and their characteristics.
    async fn services(&mut self) -> Result<Vec<ServiceInfo>, TransportError>;

    /// Enable notifications on `characteristic`.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Notifications from every subscribed characteristic, in arrival order.
    ///
    /// The stream ends (or yields [`LinkEvent::Dropped`]) when the connection
    /// goes away.  Call once per link.
    async fn events(&mut self) -> Result<mpsc::Receiver<LinkEvent>, TransportError>;

    async fn is_active(&self) -> bool;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
