//! Error types for the receive pipeline.
//!
//! Each layer has its own error enum; [`SessionError`] is the taxonomy the
//! [`crate::session::SessionController`] uses to decide between recovering in
//! place and tearing the session down.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a [`crate::transport::Transport`] or
/// [`crate::transport::Link`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("peripheral {0} not found")]
    UnknownPeripheral(String),

    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("subscribe to {characteristic} failed: {reason}")]
    Subscribe { characteristic: Uuid, reason: String },

    #[error("link is not connected")]
    NotConnected,

    #[error("BLE backend error: {0}")]
    Backend(String),
}

/// Violations of the frame-assembly invariants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet of {len} bytes at offset {cursor} overflows frame capacity {capacity}")]
    Overflow {
        cursor: usize,
        len: usize,
        capacity: usize,
    },

    #[error("frame already complete; reset before appending")]
    AlreadyComplete,
}

/// A single conversion unit failed. Fatal to the current frame only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionFault {
    #[error("segment at offset {offset} has odd length {len}")]
    OddLength { offset: usize, len: usize },

    #[error("segment at offset {offset} ({len} bytes) lies outside the frame")]
    OutOfBounds { offset: usize, len: usize },

    #[error("conversion unit at offset {offset} failed: {reason}")]
    Unit { offset: usize, reason: String },

    #[error("conversion unit panicked: {0}")]
    Panicked(String),

    #[error("too many pending conversion units (limit {limit})")]
    TooManyUnits { limit: usize },
}

/// Invalid [`crate::config::ReceiverConfig`] values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("device name filter must not be empty")]
    EmptyFilter,

    #[error("backoff_initial_ms ({initial}) exceeds backoff_max_ms ({max})")]
    Backoff { initial: u64, max: u64 },

    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything that can end or disturb a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("scan failed: {0}")]
    Scan(#[source] TransportError),

    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    #[error("subscription failed: {0}")]
    Subscription(#[source] TransportError),

    #[error("peripheral exposes no notify-capable characteristic")]
    NoNotifyCharacteristics,

    #[error("frame stalled: {received} of {capacity} bytes after {idle:?} idle")]
    FrameTimeout {
        received: usize,
        capacity: usize,
        idle: Duration,
    },

    #[error("frame conversion failed: {0}")]
    Conversion(#[from] ConversionFault),

    #[error("disconnected with {received} of {capacity} bytes received")]
    DisconnectedMidFrame { received: usize, capacity: usize },

    #[error("frame assembly error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
}

impl SessionError {
    /// `true` when the session can stay connected and continue with the next
    /// frame; `false` when the link has to be torn down and rescanned.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, SessionError::Conversion(_) | SessionError::Frame(_))
    }

    /// Short stable label used in logs and [`crate::types::ReceiverEvent`]s.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Scan(_) => "scan",
            SessionError::Connect(_) => "connect",
            SessionError::Subscription(_) => "subscription",
            SessionError::NoNotifyCharacteristics => "no-notify-characteristics",
            SessionError::FrameTimeout { .. } => "frame-timeout",
            SessionError::Conversion(_) => "conversion",
            SessionError::DisconnectedMidFrame { .. } => "disconnected-mid-frame",
            SessionError::Frame(_) => "frame",
            SessionError::Transport(_) => "transport",
        }
    }
}
