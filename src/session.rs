//! The receiver state machine.
//!
//! ```text
//!            match               connected            subscribed
//! Scanning ─────────▶ Connecting ─────────▶ Subscribing ─────────▶ Receiving ◀─┐
//!    ▲                    │ failed                                  │    │     │
//!    │                    ▼                               complete  │    │     │
//!    ├──────────────── (rescan)                                     ▼    │     │
//!    │                                                      Converting   │     │
//!    │                                                           │       │     │
//!    │                                                           ▼       │     │
//!    │                                                       Emitting ───┼─────┘
//!    │                                    dropped / stalled              │
//!    └──────────────── Disconnected ◀────────────────────────────────────┘
//! ```
//!
//! [`SessionController::run`] owns the loop.  All per-connection state (link,
//! buffers, cursor, pending conversions) lives in a private `Session` value
//! that is created on connect and dropped on teardown, so nothing carries
//! over from one connection to the next.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assembler::FrameAssembler;
use crate::config::{ReceiverConfig, StallPolicy};
use crate::converter::{write_segments, ConversionBarrier, ConvertFn};
use crate::emitter::FrameEmitter;
use crate::error::{SessionError, TransportError};
use crate::locator::DeviceLocator;
use crate::transport::{Link, Transport};
use crate::types::{DeviceDescriptor, LinkEvent, ReceiverEvent, SessionState};

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// How a single session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The stop token was cancelled.
    Stopped,
    /// The link went away between frames.
    Disconnected,
    /// The session was torn down because of `SessionError`.
    Failed(SessionError),
}

/// Everything owned by one connection.
struct Session<L: Link> {
    device: DeviceDescriptor,
    link: L,
    subscribed: BTreeSet<Uuid>,
    assembler: FrameAssembler,
    barrier: ConversionBarrier,
    converted: Vec<u8>,
    frames: u64,
    oversize_warned: bool,
}

impl<L: Link> Session<L> {
    fn new(
        device: DeviceDescriptor,
        link: L,
        config: &ReceiverConfig,
        convert: Option<ConvertFn>,
    ) -> Self {
        let raw_len = config.raw_frame_len();
        let barrier = match convert {
            Some(f) => ConversionBarrier::with_converter(raw_len, f),
            None => ConversionBarrier::new(raw_len),
        };
        Self {
            device,
            link,
            subscribed: BTreeSet::new(),
            assembler: FrameAssembler::new(raw_len),
            barrier,
            converted: vec![0; config.converted_frame_len()],
            frames: 0,
            oversize_warned: false,
        }
    }

    /// Drop the partial frame: abort conversions and rewind the cursor.
    fn discard_frame(&mut self) -> usize {
        let received = self.assembler.cursor();
        self.barrier.cancel();
        self.assembler.reset();
        received
    }

    async fn teardown(&mut self) {
        self.discard_frame();
        if let Err(e) = self.link.disconnect().await {
            debug!("{}: disconnect: {e}", self.device.label());
        }
    }
}

/// Drives locate → connect → subscribe → receive → convert → emit, forever.
///
/// No single failure ends [`SessionController::run`]; it returns only after
/// the [`CancellationToken`] from [`SessionController::stop_token`] is
/// cancelled.
pub struct SessionController<T: Transport> {
    transport: Arc<T>,
    config: ReceiverConfig,
    emitter: FrameEmitter,
    events: Option<mpsc::Sender<ReceiverEvent>>,
    stop: CancellationToken,
    state: SessionState,
    convert: Option<ConvertFn>,
    sessions: u64,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: Arc<T>, config: ReceiverConfig, emitter: FrameEmitter) -> Self {
        Self {
            transport,
            config,
            emitter,
            events: None,
            stop: CancellationToken::new(),
            state: SessionState::Scanning,
            convert: None,
            sessions: 0,
        }
    }

    /// Publish a [`ReceiverEvent`] for every transition and error.
    ///
    /// Events are sent with `try_send`; a consumer that falls behind loses
    /// events but never stalls packet reception.
    pub fn with_events(mut self, events: mpsc::Sender<ReceiverEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Replace the pixel conversion used by every session's barrier.
    pub fn with_converter(mut self, convert: ConvertFn) -> Self {
        self.convert = Some(convert);
        self
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    // ── Public: run ──────────────────────────────────────────────────────────

    /// Run until stopped, then flush queued frames to the sink.
    pub async fn run(mut self) {
        let mut locator = DeviceLocator::new(Arc::clone(&self.transport), self.config.clone());
        if let Some(tx) = &self.events {
            locator = locator.with_events(tx.clone());
        }
        info!(
            "looking for a peripheral named like {:?} ({}x{}, {} bytes per frame)",
            self.config.device_name_filter,
            self.config.image_width,
            self.config.image_height,
            self.config.raw_frame_len()
        );
        self.transition(SessionState::Scanning);

        'outer: loop {
            let mut devices = Box::pin(locator.discover());
            let device = tokio::select! {
                _ = self.stop.cancelled() => break 'outer,
                next = devices.next() => match next {
                    Some(d) => d,
                    None => break 'outer,
                },
            };
            // A fresh scan follows every session; stale matches are dropped.
            drop(devices);
            self.publish(ReceiverEvent::DeviceFound(device.clone()));

            match self.run_session(device).await {
                SessionEnd::Stopped => break 'outer,
                SessionEnd::Disconnected | SessionEnd::Failed(_) => {}
            }

            self.transition(SessionState::Scanning);
            // Give the peripheral a moment to start advertising again.
            let settle = Duration::from_millis(self.config.backoff_initial_ms);
            tokio::select! {
                _ = self.stop.cancelled() => break 'outer,
                _ = tokio::time::sleep(settle) => {}
            }
        }

        info!("receiver stopped; flushing frame writer");
        self.emitter.close().await;
    }

    // ── Public: run_session ──────────────────────────────────────────────────

    /// Connect to `device` and receive frames until the link is lost, a fatal
    /// error occurs, or the controller is stopped.  The link is always
    /// disconnected and partial buffers discarded before this returns.
    pub async fn run_session(&mut self, device: DeviceDescriptor) -> SessionEnd {
        self.transition(SessionState::Connecting);
        info!("connecting to {} ({}) …", device.label(), device.address);

        let timeout = self.config.connect_timeout();
        let connect = tokio::time::timeout(timeout, self.transport.connect(&device.address));
        let connected = tokio::select! {
            _ = self.stop.cancelled() => return SessionEnd::Stopped,
            result = connect => match result {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    operation: "connect",
                    after: timeout,
                }),
            },
        };
        // A failed connect goes straight back to scanning.
        let link = match connected {
            Ok(link) => link,
            Err(e) => return self.report(SessionError::Connect(e)),
        };

        self.sessions += 1;
        self.emitter
            .begin_session(format!("{}-{}", now_ms(), self.sessions));
        let mut session = Session::new(device, link, &self.config, self.convert.clone());

        let end = self.drive(&mut session).await;
        session.teardown().await;
        info!(
            "{}: session ended after {} frame(s): {end:?}",
            session.device.label(),
            session.frames
        );

        match &end {
            SessionEnd::Stopped => {}
            SessionEnd::Disconnected => self.transition(SessionState::Disconnected),
            SessionEnd::Failed(
                SessionError::DisconnectedMidFrame { .. } | SessionError::FrameTimeout { .. },
            ) => self.transition(SessionState::Disconnected),
            SessionEnd::Failed(_) => self.transition(SessionState::Error),
        }
        end
    }

    // ── Private: per-session loop ────────────────────────────────────────────

    async fn drive(&mut self, session: &mut Session<T::Link>) -> SessionEnd {
        self.transition(SessionState::Subscribing);
        if let Err(err) = self.subscribe_all(session).await {
            return self.report(err);
        }

        let mut rx = match session.link.events().await {
            Ok(rx) => rx,
            Err(e) => return self.report(SessionError::Transport(e)),
        };
        self.transition(SessionState::Receiving);

        let idle = self.config.frame_timeout();
        // Only accepted packets move the deadline; ignored notifications don't.
        let mut deadline = Instant::now() + idle;
        loop {
            let next = tokio::select! {
                _ = self.stop.cancelled() => return SessionEnd::Stopped,
                next = tokio::time::timeout_at(deadline, rx.recv()) => next,
            };

            match next {
                Err(_) if session.assembler.cursor() == 0 => {
                    if !session.link.is_active().await {
                        info!("{}: link no longer active", session.device.label());
                        return SessionEnd::Disconnected;
                    }
                    debug!("{}: idle, waiting for the next frame", session.device.label());
                    deadline = Instant::now() + idle;
                }
                Err(_) => {
                    let err = SessionError::FrameTimeout {
                        received: session.assembler.cursor(),
                        capacity: session.assembler.capacity(),
                        idle,
                    };
                    self.discard(session, &err);
                    match self.config.stall_policy {
                        StallPolicy::RestartFrame => deadline = Instant::now() + idle,
                        StallPolicy::Reconnect => return SessionEnd::Failed(err),
                    }
                }
                Ok(None) | Ok(Some(LinkEvent::Dropped)) => {
                    info!("{}: peripheral disconnected", session.device.label());
                    if session.assembler.cursor() == 0 {
                        return SessionEnd::Disconnected;
                    }
                    let err = SessionError::DisconnectedMidFrame {
                        received: session.assembler.cursor(),
                        capacity: session.assembler.capacity(),
                    };
                    self.discard(session, &err);
                    return SessionEnd::Failed(err);
                }
                Ok(Some(LinkEvent::Notification {
                    characteristic,
                    value,
                })) => {
                    if !session.subscribed.contains(&characteristic) {
                        debug!("ignoring notification from unsubscribed {characteristic}");
                        continue;
                    }
                    if value.is_empty() {
                        continue;
                    }
                    deadline = Instant::now() + idle;
                    if let Err(err) = self.on_packet(session, &value).await {
                        self.discard(session, &err);
                        if !err.is_frame_local() {
                            return SessionEnd::Failed(err);
                        }
                        self.transition(SessionState::Receiving);
                    }
                }
            }
        }
    }

    /// Subscribe every notify-capable characteristic (or only the configured
    /// target).  Individual failures are reported and skipped.
    async fn subscribe_all(&mut self, session: &mut Session<T::Link>) -> Result<(), SessionError> {
        let services = session
            .link
            .services()
            .await
            .map_err(SessionError::Transport)?;
        let target = self.config.target_characteristic;

        for service in &services {
            debug!("service {}", service.uuid);
            for ch in &service.characteristics {
                debug!("  characteristic {} {:?}", ch.uuid, ch.props);
                if !ch.props.notify || target.is_some_and(|t| t != ch.uuid) {
                    continue;
                }
                match session.link.subscribe(ch.uuid).await {
                    Ok(()) => {
                        info!("{}: subscribed to {}", session.device.label(), ch.uuid);
                        session.subscribed.insert(ch.uuid);
                        self.publish(ReceiverEvent::Subscribed(ch.uuid));
                    }
                    Err(e) => {
                        let err = SessionError::Subscription(e);
                        warn!("{}: {err}", session.device.label());
                        self.publish_error(&err);
                    }
                }
            }
        }

        if session.subscribed.is_empty() {
            return Err(SessionError::NoNotifyCharacteristics);
        }
        Ok(())
    }

    /// Feed one packet through the assembler; on completion convert and emit.
    async fn on_packet(
        &mut self,
        session: &mut Session<T::Link>,
        value: &[u8],
    ) -> Result<(), SessionError> {
        if value.len() > self.config.max_packet_bytes && !session.oversize_warned {
            warn!(
                "{}: {}-byte packet exceeds max_packet_bytes ({})",
                session.device.label(),
                value.len(),
                self.config.max_packet_bytes
            );
            session.oversize_warned = true;
        }

        let complete = session.assembler.append(value)?;
        while let Some(segment) = session.assembler.take_ready() {
            session.barrier.dispatch(segment)?;
        }
        if !complete {
            return Ok(());
        }

        let packets = session.assembler.packets();
        info!(
            "{}: frame complete ({packets} packets, {} bytes)",
            session.device.label(),
            session.assembler.capacity()
        );
        self.publish(ReceiverEvent::FrameCompleted { packets });

        self.transition(SessionState::Converting);
        let segments = session.barrier.wait_all().await?;
        write_segments(&mut session.converted, &segments)?;

        self.transition(SessionState::Emitting);
        let fresh = vec![0; session.converted.len()];
        let rgb = std::mem::replace(&mut session.converted, fresh);
        match self
            .emitter
            .emit(rgb, self.config.image_width, self.config.image_height)
        {
            Ok(sequence) => {
                session.frames += 1;
                self.publish(ReceiverEvent::FrameEmitted {
                    session: self.emitter.session().to_owned(),
                    sequence,
                });
            }
            Err(e) => {
                warn!("{}: {e:#}", session.device.label());
                self.publish(ReceiverEvent::Error {
                    kind: "emit",
                    message: format!("{e:#}"),
                });
            }
        }

        session.assembler.reset();
        self.transition(SessionState::Receiving);
        Ok(())
    }

    // ── Private: bookkeeping ─────────────────────────────────────────────────

    fn discard(&mut self, session: &mut Session<T::Link>, err: &SessionError) {
        let received = session.discard_frame();
        warn!(
            "{}: discarding frame after {received} bytes: {err}",
            session.device.label()
        );
        self.publish(ReceiverEvent::FrameDiscarded {
            received,
            reason: err.to_string(),
        });
        self.publish_error(err);
    }

    fn report(&mut self, err: SessionError) -> SessionEnd {
        warn!("{err}");
        self.publish_error(&err);
        SessionEnd::Failed(err)
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!("state: {from} → {to}");
        self.publish(ReceiverEvent::StateChanged { from, to });
    }

    fn publish_error(&self, err: &SessionError) {
        self.publish(ReceiverEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn publish(&self, event: ReceiverEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                debug!("event channel full or closed; event dropped");
            }
        }
    }
}
