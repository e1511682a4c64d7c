use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_FRAME_QUEUE_DEPTH, DEFAULT_ISO_BATCH_PACKETS, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_REPLY_POLL_INTERVAL, DEFAULT_REPLY_READ_SIZE,
};
use crate::error::CamError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime tuning of the command channel and the capture pipelines.
///
/// Missing fields in a JSON file take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Reply deadline of one command
    pub command_timeout_ms: u64,
    /// Delay between reply poll reads
    pub reply_poll_interval_ms: u64,
    /// Bytes requested per reply read
    pub reply_read_size: u16,
    /// Packets per isochronous transfer
    pub iso_batch_packets: usize,
    /// Isochronous transfers in flight per endpoint
    pub max_in_flight: usize,
    /// Completed frames buffered per endpoint
    pub frame_queue_depth: usize,
    /// Alternate setting selected on the camera interface after claiming it
    pub alt_setting: Option<u8>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            reply_poll_interval_ms: DEFAULT_REPLY_POLL_INTERVAL.as_millis() as u64,
            reply_read_size: DEFAULT_REPLY_READ_SIZE,
            iso_batch_packets: DEFAULT_ISO_BATCH_PACKETS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            frame_queue_depth: DEFAULT_FRAME_QUEUE_DEPTH,
            alt_setting: None,
        }
    }
}

impl CameraConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reply_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reply_poll_interval_ms)
    }

    /// Load and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CamError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CamError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CamError> {
        let zero = [
            ("command_timeout_ms", self.command_timeout_ms == 0),
            ("reply_poll_interval_ms", self.reply_poll_interval_ms == 0),
            ("reply_read_size", self.reply_read_size == 0),
            ("iso_batch_packets", self.iso_batch_packets == 0),
            ("max_in_flight", self.max_in_flight == 0),
            ("frame_queue_depth", self.frame_queue_depth == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(CamError::Config(format!("{field} must be greater than zero"))),
            None => Ok(()),
        }
    }
}
