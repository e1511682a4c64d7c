use crate::command::Opcode;
use crate::register::Register;
use thiserror::Error;

/// Malformed wire data. Always fatal to the one message or packet it was
/// found in, never to the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Bad magic: expected {expected:#06x}, got {actual:#06x}")]
    BadMagic { expected: u16, actual: u16 },

    #[error("Header too short: {len} bytes")]
    ShortHeader { len: usize },

    #[error("Body length mismatch: header declares {declared} words, {available} available")]
    BodyLengthMismatch { declared: usize, available: usize },

    #[error("Truncated packet: declares {declared} bytes, only {available} received")]
    TruncatedPacket { declared: usize, available: usize },

    #[error("Unknown frame position {0:#03x}")]
    UnknownFramePosition(u8),
}

/// The primary error type for the `nuicam-lib` library.
#[derive(Error, Debug)]
pub enum CamError {
    #[error("USB device not found. Is the Kinect camera connected and powered?")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("Timeout during USB operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No reply to {opcode:?} with tag {tag}")]
    CommandTimeout { tag: u8, opcode: Opcode },

    #[error("Too many pending commands, tag space exhausted")]
    TooManyPending,

    #[error("Command channel closed")]
    ChannelClosed,

    #[error("Register write {register} failed, reply body {body:?}")]
    RegisterWrite { register: Register, body: Vec<u16> },

    #[error("Register read {register} failed, reply body {body:?}")]
    RegisterRead { register: Register, body: Vec<u16> },

    #[error("Value {value} out of range for register {register}")]
    ValueOutOfRange { register: Register, value: u16 },

    #[error("Camera is closed")]
    Closed,

    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CamError {
    /// Whether the error ends the stream it occurred on.
    ///
    /// `TooManyPending` fails every outstanding command but the channel keeps
    /// accepting new ones with fresh tags, so it is not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CamError::DeviceNotFound
                | CamError::Usb(_)
                | CamError::Transfer(_)
                | CamError::Timeout(_)
                | CamError::Transport(_)
                | CamError::ChannelClosed
                | CamError::Closed
        )
    }
}
