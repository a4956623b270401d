//! Scripted transport shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use ble_image_rx::config::ReceiverConfig;
use ble_image_rx::converter::ConvertFn;
use ble_image_rx::emitter::{FrameEmitter, MemorySink};
use ble_image_rx::error::TransportError;
use ble_image_rx::protocol::encode_rgb565;
use ble_image_rx::session::SessionController;
use ble_image_rx::transport::{Link, Transport};
use ble_image_rx::types::{
    CharProps, CharacteristicInfo, DeviceDescriptor, EmittedFrame, LinkEvent, ReceiverEvent,
    ServiceInfo,
};

pub const SERVICE: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
pub const IMAGE: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);
pub const IMAGE_ALT: Uuid = Uuid::from_u128(0x0000_ffe2_0000_1000_8000_00805f9b34fb);
pub const CONTROL: Uuid = Uuid::from_u128(0x0000_ffe3_0000_1000_8000_00805f9b34fb);

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;
pub const FRAME_BYTES: usize = (WIDTH * HEIGHT * 2) as usize;

pub fn config() -> ReceiverConfig {
    ReceiverConfig {
        device_name_filter: "cam".into(),
        image_width: WIDTH,
        image_height: HEIGHT,
        max_packet_bytes: 5,
        frame_timeout_ms: 150,
        scan_window_ms: 5,
        connect_timeout_ms: 1_000,
        backoff_initial_ms: 10,
        backoff_max_ms: 40,
        ..Default::default()
    }
}

pub fn camera() -> DeviceDescriptor {
    DeviceDescriptor::new("AA:BB:CC:DD:EE:01", Some("cam (2)"))
}

/// A raw RGB565 frame cycling through primary colours, shifted by `seed`.
pub fn frame(seed: usize) -> Vec<u8> {
    const PALETTE: [(u8, u8, u8); 5] = [
        (255, 0, 0),
        (0, 255, 0),
        (0, 0, 255),
        (255, 255, 255),
        (0, 0, 0),
    ];
    (0..(WIDTH * HEIGHT) as usize)
        .flat_map(|i| {
            let (r, g, b) = PALETTE[(i + seed) % PALETTE.len()];
            encode_rgb565(r, g, b)
        })
        .collect()
}

/// Steps a scripted link plays back once `events()` is called.
#[derive(Debug, Clone)]
pub enum Step {
    Packet(Uuid, Vec<u8>),
    Pause(Duration),
    /// Send `LinkEvent::Dropped` and stop.
    Drop,
    /// The link dies without telling anyone: no event, channel left open.
    GoInactive,
}

/// Split `raw` into notifications of at most `size` bytes on `characteristic`.
pub fn packets(characteristic: Uuid, raw: &[u8], size: usize) -> Vec<Step> {
    raw.chunks(size)
        .map(|c| Step::Packet(characteristic, c.to_vec()))
        .collect()
}

pub fn notify(uuid: Uuid) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        props: CharProps {
            notify: true,
            ..Default::default()
        },
    }
}

pub fn write_only(uuid: Uuid) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        props: CharProps {
            write: true,
            ..Default::default()
        },
    }
}

#[derive(Debug, Clone)]
pub struct LinkScript {
    pub characteristics: Vec<CharacteristicInfo>,
    /// Characteristics whose subscription fails.
    pub refuse: Vec<Uuid>,
    pub steps: Vec<Step>,
}

impl LinkScript {
    /// One notify characteristic ([`IMAGE`]) and the given steps.
    pub fn image(steps: Vec<Step>) -> Self {
        Self {
            characteristics: vec![notify(IMAGE)],
            refuse: vec![],
            steps,
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct MockTransport {
    scans: Mutex<VecDeque<Result<Vec<DeviceDescriptor>, TransportError>>>,
    fallback: Vec<DeviceDescriptor>,
    links: Mutex<VecDeque<Result<LinkScript, TransportError>>>,
    pub scan_calls: AtomicUsize,
    pub connect_calls: AtomicUsize,
    /// Every subscribe attempt, successful or not, in order.
    pub subscribe_attempts: Arc<Mutex<Vec<Uuid>>>,
    pub disconnect_calls: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Every scan returns `visible` unless a scripted result is queued.
    pub fn new(visible: Vec<DeviceDescriptor>) -> Self {
        Self {
            scans: Mutex::new(VecDeque::new()),
            fallback: visible,
            links: Mutex::new(VecDeque::new()),
            scan_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            subscribe_attempts: Arc::new(Mutex::new(Vec::new())),
            disconnect_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_scans(self, scans: Vec<Result<Vec<DeviceDescriptor>, TransportError>>) -> Self {
        *self.scans.lock().unwrap() = scans.into();
        self
    }

    pub fn with_links(self, links: Vec<Result<LinkScript, TransportError>>) -> Self {
        *self.links.lock().unwrap() = links.into();
        self
    }

    pub fn scans(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<Uuid> {
        self.subscribe_attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(window).await;
        let scripted = self.scans.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn connect(&self, address: &str) -> Result<MockLink, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.links.lock().unwrap().pop_front();
        let script = match next {
            Some(result) => result?,
            None => {
                return Err(TransportError::Connect {
                    address: address.to_owned(),
                    reason: "no scripted link left".into(),
                })
            }
        };
        Ok(MockLink {
            script,
            attempts: Arc::clone(&self.subscribe_attempts),
            disconnects: Arc::clone(&self.disconnect_calls),
            active: Arc::new(AtomicBool::new(true)),
            producer: None,
        })
    }
}

// ── Link ─────────────────────────────────────────────────────────────────────

pub struct MockLink {
    script: LinkScript,
    attempts: Arc<Mutex<Vec<Uuid>>>,
    disconnects: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

#[async_trait]
impl Link for MockLink {
    async fn services(&mut self) -> Result<Vec<ServiceInfo>, TransportError> {
        Ok(vec![ServiceInfo {
            uuid: SERVICE,
            characteristics: self.script.characteristics.clone(),
        }])
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        self.attempts.lock().unwrap().push(characteristic);
        if self.script.refuse.contains(&characteristic) {
            return Err(TransportError::Subscribe {
                characteristic,
                reason: "refused by peripheral".into(),
            });
        }
        Ok(())
    }

    async fn events(&mut self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        let steps = std::mem::take(&mut self.script.steps);
        let active = Arc::clone(&self.active);
        self.producer = Some(tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Packet(characteristic, value) => {
                        let event = LinkEvent::Notification {
                            characteristic,
                            value,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Step::Pause(d) => tokio::time::sleep(d).await,
                    Step::Drop => {
                        active.store(false, Ordering::SeqCst);
                        let _ = tx.send(LinkEvent::Dropped).await;
                        return;
                    }
                    Step::GoInactive => {
                        active.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            // Script exhausted: stay connected and silent.
            tx.closed().await;
        }));
        Ok(rx)
    }

    async fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        if let Some(p) = self.producer.take() {
            p.abort();
        }
        Ok(())
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        if let Some(p) = self.producer.take() {
            p.abort();
        }
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

/// A controller over `transport` writing into a fresh [`MemorySink`].
pub fn controller<T: Transport>(
    transport: Arc<T>,
    config: ReceiverConfig,
) -> (SessionController<T>, MemorySink) {
    let sink = MemorySink::new();
    let emitter = FrameEmitter::spawn(sink.clone(), None);
    (SessionController::new(transport, config, emitter), sink)
}

/// Run a controller until `done` accepts the events seen so far, then stop it
/// and return every event plus every frame that reached the sink.
pub async fn run_until<T, F>(
    transport: Arc<T>,
    config: ReceiverConfig,
    convert: Option<ConvertFn>,
    mut done: F,
) -> (Vec<ReceiverEvent>, Vec<EmittedFrame>)
where
    T: Transport,
    F: FnMut(&[ReceiverEvent]) -> bool,
{
    let sink = MemorySink::new();
    let (tx, mut rx) = mpsc::channel(4096);
    let emitter = FrameEmitter::spawn(sink.clone(), Some(tx.clone()));
    let mut controller = SessionController::new(transport, config, emitter).with_events(tx);
    if let Some(f) = convert {
        controller = controller.with_converter(f);
    }
    let stop = controller.stop_token();
    let handle = tokio::spawn(controller.run());

    let mut events = Vec::new();
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(ev) = rx.recv().await {
            events.push(ev);
            if done(&events) {
                return true;
            }
        }
        false
    })
    .await;

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller did not stop")
        .expect("controller panicked");
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert!(
        matches!(reached, Ok(true)),
        "condition never reached; events: {events:#?}"
    );
    (events, sink.frames())
}

pub fn saved(events: &[ReceiverEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ReceiverEvent::FrameSaved { .. }))
        .count()
}

pub fn error_kinds(events: &[ReceiverEvent]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|e| match e {
            ReceiverEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

pub fn discarded(events: &[ReceiverEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            ReceiverEvent::FrameDiscarded { received, .. } => Some(*received),
            _ => None,
        })
        .collect()
}
