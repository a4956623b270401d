//! Repeated scanning for the target peripheral.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::ReceiverConfig;
use crate::error::SessionError;
use crate::transport::Transport;
use crate::types::{DeviceDescriptor, ReceiverEvent};

/// Exponential retry delay: `initial`, `2 × initial`, … capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait now; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Produces an unbounded, lazy stream of peripherals whose advertised name
/// matches the configured filter.
///
/// Every scan cycle asks the transport for the currently visible devices.
/// Failed scans and scans without a match are retried after a
/// [`Backoff`] delay, so a missing peripheral never turns into a hot loop.
/// Dropping the stream stops scanning; calling [`DeviceLocator::discover`]
/// again starts over.
pub struct DeviceLocator<T: Transport> {
    transport: Arc<T>,
    config: ReceiverConfig,
    events: Option<mpsc::Sender<ReceiverEvent>>,
}

struct ScanState<T: Transport> {
    transport: Arc<T>,
    config: ReceiverConfig,
    events: Option<mpsc::Sender<ReceiverEvent>>,
    queue: VecDeque<DeviceDescriptor>,
    backoff: Backoff,
    cycle: u64,
}

impl<T: Transport> DeviceLocator<T> {
    pub fn new(transport: Arc<T>, config: ReceiverConfig) -> Self {
        Self {
            transport,
            config,
            events: None,
        }
    }

    /// Publish scan errors as [`ReceiverEvent::Error`].
    pub fn with_events(mut self, events: mpsc::Sender<ReceiverEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn discover(&self) -> impl Stream<Item = DeviceDescriptor> + Send + 'static {
        let state = ScanState {
            transport: Arc::clone(&self.transport),
            backoff: Backoff::new(
                Duration::from_millis(self.config.backoff_initial_ms),
                Duration::from_millis(self.config.backoff_max_ms),
            ),
            config: self.config.clone(),
            events: self.events.clone(),
            queue: VecDeque::new(),
            cycle: 0,
        };
        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(device) = state.queue.pop_front() {
                    return Some((device, state));
                }
                state.scan_cycle().await;
            }
        })
    }
}

impl<T: Transport> ScanState<T> {
    async fn scan_cycle(&mut self) {
        self.cycle += 1;
        debug!(
            "scan cycle #{}: scanning for {:?} …",
            self.cycle,
            self.config.scan_window()
        );
        match self.transport.scan(self.config.scan_window()).await {
            Ok(devices) => {
                for d in devices {
                    debug!("device found: {:?}  address={}", d.advertised_name, d.address);
                    let matched = d
                        .advertised_name
                        .as_deref()
                        .is_some_and(|name| self.config.matches_name(name));
                    if matched {
                        info!("matched {} ({})", d.label(), d.address);
                        self.queue.push_back(d);
                    }
                }
                if !self.queue.is_empty() {
                    self.backoff.reset();
                    return;
                }
                let delay = self.backoff.next_delay();
                debug!(
                    "no device matching {:?}; retrying in {delay:?}",
                    self.config.device_name_filter
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let err = SessionError::Scan(e);
                let delay = self.backoff.next_delay();
                warn!("{err}; retrying in {delay:?}");
                if let Some(tx) = &self.events {
                    let event = ReceiverEvent::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                    };
                    if tx.try_send(event).is_err() {
                        debug!("event channel full or closed; scan error event dropped");
                    }
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
