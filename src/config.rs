//! Receiver configuration.
//!
//! [`ReceiverConfig`] can be built in code, deserialised from a JSON file with
//! [`ReceiverConfig::from_file`], or assembled by the binary from CLI flags.
//! Missing JSON fields fall back to [`Default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::protocol::{
    converted_frame_len, raw_frame_len, DEFAULT_DEVICE_NAME, DEFAULT_HEIGHT,
    DEFAULT_MAX_PACKET_BYTES, DEFAULT_WIDTH,
};

/// What to do when a frame stops making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StallPolicy {
    /// Discard the partial frame, disconnect, and rescan.
    #[default]
    Reconnect,
    /// Discard the partial frame but stay connected and wait for the next one.
    RestartFrame,
}

/// Configuration for [`crate::session::SessionController`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Connect to peripherals whose advertised name contains this string.
    /// Default: `"haolanzhan (2)"`.
    pub device_name_filter: String,
    /// Match `device_name_filter` case-sensitively. Default: `true`.
    pub case_sensitive: bool,
    /// Frame width in pixels. Default: `320`.
    pub image_width: u32,
    /// Frame height in pixels. Default: `240`.
    pub image_height: u32,
    /// Expected maximum notification payload. Larger packets are accepted but
    /// logged. Default: `128`.
    pub max_packet_bytes: usize,
    /// Longest gap between notifications before a partial frame is declared
    /// stalled. Default: `5000`.
    pub frame_timeout_ms: u64,
    /// Reaction to a stalled frame. Default: [`StallPolicy::Reconnect`].
    pub stall_policy: StallPolicy,
    /// Restrict subscription to this characteristic.  When unset, every
    /// notify-capable characteristic is subscribed.  Default: unset.
    pub target_characteristic: Option<Uuid>,
    /// Duration of one scan cycle. Default: `5000`.
    pub scan_window_ms: u64,
    /// Hard limit on a single connect attempt. Default: `10000`.
    pub connect_timeout_ms: u64,
    /// First retry delay after a failed or empty scan. Default: `500`.
    pub backoff_initial_ms: u64,
    /// Retry delay ceiling. Default: `30000`.
    pub backoff_max_ms: u64,
    /// Directory receiving PNG files. Default: `"frames"`.
    pub output_dir: PathBuf,
    /// File name prefix for saved frames. Default: `"frame"`.
    pub file_prefix: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            device_name_filter: DEFAULT_DEVICE_NAME.into(),
            case_sensitive: true,
            image_width: DEFAULT_WIDTH,
            image_height: DEFAULT_HEIGHT,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            frame_timeout_ms: 5_000,
            stall_policy: StallPolicy::default(),
            target_characteristic: None,
            scan_window_ms: 5_000,
            connect_timeout_ms: 10_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            output_dir: PathBuf::from("frames"),
            file_prefix: "frame".into(),
        }
    }
}

impl ReceiverConfig {
    /// Load a JSON config file; absent fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Reject values the receive loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name_filter.is_empty() {
            return Err(ConfigError::EmptyFilter);
        }
        let positive = [
            ("image_width", self.image_width as u64),
            ("image_height", self.image_height as u64),
            ("max_packet_bytes", self.max_packet_bytes as u64),
            ("frame_timeout_ms", self.frame_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::Backoff {
                initial: self.backoff_initial_ms,
                max: self.backoff_max_ms,
            });
        }
        Ok(())
    }

    pub fn raw_frame_len(&self) -> usize {
        raw_frame_len(self.image_width, self.image_height)
    }

    pub fn converted_frame_len(&self) -> usize {
        converted_frame_len(self.image_width, self.image_height)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Does an advertised name satisfy the device filter?
    pub fn matches_name(&self, name: &str) -> bool {
        if self.case_sensitive {
            name.contains(&self.device_name_filter)
        } else {
            name.to_lowercase()
                .contains(&self.device_name_filter.to_lowercase())
        }
    }
}
