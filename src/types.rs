use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

/// A peripheral seen during one scan cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Platform BLE identifier.
    /// macOS / Windows: a UUID string.
    /// Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`).
    pub address: String,
    /// Advertised local name, if the peripheral sent one.
    pub advertised_name: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(address: impl Into<String>, advertised_name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            advertised_name: advertised_name.map(str::to_owned),
        }
    }

    /// Name for log lines; falls back to the address.
    pub fn label(&self) -> &str {
        self.advertised_name.as_deref().unwrap_or(&self.address)
    }
}

/// GATT characteristic properties relevant to the receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// One characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub props: CharProps,
}

/// One primary service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// A notification pushed by the peripheral, or the link going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// The transport observed the connection drop.
    Dropped,
}

/// Lifecycle state of the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Scanning,
    Connecting,
    Subscribing,
    Receiving,
    Converting,
    Emitting,
    Disconnected,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Scanning => "scanning",
            SessionState::Connecting => "connecting",
            SessionState::Subscribing => "subscribing",
            SessionState::Receiving => "receiving",
            SessionState::Converting => "converting",
            SessionState::Emitting => "emitting",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A fully converted frame handed to a [`crate::emitter::FrameSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFrame {
    /// Tag of the session that produced the frame; unique per connection.
    pub session: String,
    /// Per-session sequence number, starting at 0.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// `width × height × 3` bytes, row-major, `R G B` order.
    pub rgb: Vec<u8>,
}

/// Structured events published by [`crate::session::SessionController`].
///
/// Consumers receive these through the channel passed to
/// [`crate::session::SessionController::with_events`].  Every state change
/// and every error produces exactly one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// The locator matched a peripheral.
    DeviceFound(DeviceDescriptor),
    /// Notifications enabled on one characteristic.
    Subscribed(Uuid),
    /// All bytes of a frame arrived.
    FrameCompleted { packets: usize },
    /// A converted frame was queued for persistence.
    FrameEmitted { session: String, sequence: u64 },
    /// The sink finished writing a frame.
    FrameSaved { sequence: u64, location: PathBuf },
    /// The sink failed to write a frame.
    EmitFailed { sequence: u64, reason: String },
    /// A partial or faulted frame was thrown away.
    FrameDiscarded { received: usize, reason: String },
    /// A recoverable or session-ending error; `kind` is
    /// [`crate::error::SessionError::kind`].
    Error { kind: &'static str, message: String },
}
