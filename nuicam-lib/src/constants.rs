// Protocol constants for the Kinect NUI camera

use std::time::Duration;

/// Microsoft vendor id
pub const VID: u16 = 0x045E;

/// NUI camera product id
pub const PID_CAMERA: u16 = 0x02AE;

/// NUI motor product id (tilt and LED, not driven by this crate)
pub const PID_MOTOR: u16 = 0x02B0;

/// NUI audio product id (not driven by this crate)
pub const PID_AUDIO: u16 = 0x02AD;

/// Interface carrying both isochronous camera endpoints
pub const CAMERA_INTERFACE: u8 = 0;

/// Vendor control request used for every camera command, both directions
pub const CAMERA_CONTROL_REQUEST: u8 = 0x00;

/// Size of a command message header (4 × u16)
pub const COMMAND_HEADER_SIZE: usize = 8;

/// Magic of host-to-device command messages ("GM" little-endian)
pub const COMMAND_MAGIC_OUT: u16 = 0x4D47;

/// Magic of device-to-host command replies ("RB" little-endian)
pub const COMMAND_MAGIC_IN: u16 = 0x4252;

/// Size of the isochronous packet header
pub const ISO_HEADER_SIZE: usize = 12;

/// Magic at the start of every isochronous packet (big-endian)
pub const ISO_MAGIC: u16 = 0x5242;

/// Video endpoint packet size including header. The endpoint reports a
/// larger maximum but always sends this.
pub const VIDEO_PACKET_SIZE: usize = 1920;

/// Depth endpoint packet size including header
pub const DEPTH_PACKET_SIZE: usize = 1760;

/// Video isochronous IN endpoint address
pub const VIDEO_ENDPOINT: u8 = 0x81;

/// Depth isochronous IN endpoint address
pub const DEPTH_ENDPOINT: u8 = 0x82;

/// Stream nibble carried by video packets
pub const VIDEO_STREAM_FLAG: u8 = 0b1000;

/// Stream nibble carried by depth packets
pub const DEPTH_STREAM_FLAG: u8 = 0b0111;

/// Default reply deadline for a single command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(300);

/// Default delay between reply poll reads
pub const DEFAULT_REPLY_POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Bytes requested by one reply poll read
pub const DEFAULT_REPLY_READ_SIZE: u16 = 512;

/// Packets per isochronous transfer
pub const DEFAULT_ISO_BATCH_PACKETS: usize = 256;

/// More than 2 adds latency and memory, fewer than 2 drops frames
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

/// Completed frames buffered per endpoint
pub const DEFAULT_FRAME_QUEUE_DEPTH: usize = 4;

/// Valid range of the infrared brightness register
pub const INFRARED_BRIGHTNESS_RANGE: std::ops::RangeInclusive<u16> = 1..=50;

/// Upper bound on a single control transfer
pub const CONTROL_TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);
