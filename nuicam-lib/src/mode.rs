//! Camera modes.
//!
//! A mode is one of four stream kinds, each with its own format type, so a
//! depth format can never be paired with the visible stream. Resolution and
//! format together fix the wire frame size; the pixel dimensions come from a
//! per-kind table because the infrared sensor sends 488 rows at VGA.

use crate::constants::{
    DEPTH_ENDPOINT, DEPTH_PACKET_SIZE, DEPTH_STREAM_FLAG, VIDEO_ENDPOINT, VIDEO_PACKET_SIZE, VIDEO_STREAM_FLAG,
};
use crate::error::CamError;
use crate::register::Register;
use num_enum::IntoPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;

/// Value written to `VideoType` / `DepthType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum StreamKind {
    Off = 0,
    Visible = 1,
    Depth = 2,
    Infrared = 3,
}

/// The two isochronous endpoints of the camera interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// Carries depth frames
    Depth,
    /// Carries visible or infrared frames
    Video,
}

impl Endpoint {
    pub fn address(self) -> u8 {
        match self {
            Endpoint::Depth => DEPTH_ENDPOINT,
            Endpoint::Video => VIDEO_ENDPOINT,
        }
    }

    pub fn stream_flag(self) -> u8 {
        match self {
            Endpoint::Depth => DEPTH_STREAM_FLAG,
            Endpoint::Video => VIDEO_STREAM_FLAG,
        }
    }

    /// Full packet size, header included
    pub fn packet_size(self) -> usize {
        match self {
            Endpoint::Depth => DEPTH_PACKET_SIZE,
            Endpoint::Video => VIDEO_PACKET_SIZE,
        }
    }

    fn type_register(self) -> Register {
        match self {
            Endpoint::Depth => Register::DepthType,
            Endpoint::Video => Register::VideoType,
        }
    }

    /// Whether a stream kind may run on this endpoint
    pub fn accepts(self, kind: StreamKind) -> bool {
        matches!(
            (self, kind),
            (_, StreamKind::Off)
                | (Endpoint::Depth, StreamKind::Depth)
                | (Endpoint::Video, StreamKind::Visible | StreamKind::Infrared)
        )
    }
}

/// Common behaviour of the per-kind format enums
pub trait PixelFormat: Copy + fmt::Debug + PartialEq + Eq + FromStr<Err = CamError> {
    /// Register value
    fn code(self) -> u16;
    /// Bits per pixel on the wire
    fn bits_per_pixel(self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum VisibleFormat {
    /// 8-bit GRBG Bayer mosaic
    Bayer = 0x00,
    /// 16-bit UYVY
    Yuv = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, Serialize, Deserialize)]
#[repr(u16)]
pub enum DepthFormat {
    #[strum(serialize = "10bit")]
    #[serde(rename = "10bit")]
    Bits10 = 0b10,
    #[strum(serialize = "11bit")]
    #[serde(rename = "11bit")]
    Bits11 = 0b11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, Serialize, Deserialize)]
#[repr(u16)]
pub enum InfraredFormat {
    #[strum(serialize = "10bit")]
    #[serde(rename = "10bit")]
    Bits10 = 0x00,
}

impl PixelFormat for VisibleFormat {
    fn code(self) -> u16 {
        self.into()
    }

    fn bits_per_pixel(self) -> usize {
        match self {
            VisibleFormat::Bayer => 8,
            VisibleFormat::Yuv => 16,
        }
    }
}

impl PixelFormat for DepthFormat {
    fn code(self) -> u16 {
        self.into()
    }

    fn bits_per_pixel(self) -> usize {
        match self {
            DepthFormat::Bits10 => 10,
            DepthFormat::Bits11 => 11,
        }
    }
}

impl PixelFormat for InfraredFormat {
    fn code(self) -> u16 {
        self.into()
    }

    fn bits_per_pixel(self) -> usize {
        10
    }
}

impl FromStr for VisibleFormat {
    type Err = CamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bayer" => Ok(VisibleFormat::Bayer),
            "yuv" | "uyvy" => Ok(VisibleFormat::Yuv),
            other => Err(CamError::InvalidMode(format!("unknown visible format '{other}'"))),
        }
    }
}

impl FromStr for DepthFormat {
    type Err = CamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "10bit" | "10" => Ok(DepthFormat::Bits10),
            "11bit" | "11" => Ok(DepthFormat::Bits11),
            other => Err(CamError::InvalidMode(format!("unknown depth format '{other}'"))),
        }
    }
}

impl FromStr for InfraredFormat {
    type Err = CamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "10bit" | "10" => Ok(InfraredFormat::Bits10),
            other => Err(CamError::InvalidMode(format!("unknown infrared format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Resolution {
    /// 320x240
    Qvga = 0,
    /// 640x480 (640x488 infrared)
    Vga = 1,
    /// 1280x1024
    Sxga = 2,
}

impl Resolution {
    /// Pixel dimensions `(width, height)` for a stream kind
    pub fn dimensions(self, kind: StreamKind) -> (usize, usize) {
        match (self, kind) {
            (Resolution::Qvga, _) => (320, 240),
            (Resolution::Vga, StreamKind::Infrared) => (640, 488),
            (Resolution::Vga, _) => (640, 480),
            (Resolution::Sxga, _) => (1280, 1024),
        }
    }
}

impl FromStr for Resolution {
    type Err = CamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qvga" | "low" => Ok(Resolution::Qvga),
            "vga" | "medium" => Ok(Resolution::Vga),
            "sxga" | "high" => Ok(Resolution::Sxga),
            other => Err(CamError::InvalidMode(format!("unknown resolution '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum FrameRate {
    Fps15 = 15,
    Fps30 = 30,
}

impl TryFrom<u16> for FrameRate {
    type Error = CamError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            15 => Ok(FrameRate::Fps15),
            30 => Ok(FrameRate::Fps30),
            other => Err(CamError::InvalidMode(format!("unsupported frame rate {other}"))),
        }
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Format, resolution, frame rate and flip of one active stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings<F> {
    pub format: F,
    pub resolution: Resolution,
    pub fps: FrameRate,
    #[serde(default)]
    pub flip: bool,
}

impl<F> StreamSettings<F> {
    pub const fn new(format: F, resolution: Resolution, fps: FrameRate) -> Self {
        Self {
            format,
            resolution,
            fps,
            flip: false,
        }
    }

    pub const fn flipped(mut self, flip: bool) -> Self {
        self.flip = flip;
        self
    }
}

/// Configuration of one capture endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CamMode {
    #[default]
    Off,
    Visible(StreamSettings<VisibleFormat>),
    Depth(StreamSettings<DepthFormat>),
    Infrared(StreamSettings<InfraredFormat>),
}

pub const MODE_DEPTH: CamMode =
    CamMode::Depth(StreamSettings::new(DepthFormat::Bits11, Resolution::Vga, FrameRate::Fps30));

pub const MODE_VISIBLE_BAYER: CamMode =
    CamMode::Visible(StreamSettings::new(VisibleFormat::Bayer, Resolution::Vga, FrameRate::Fps30));

pub const MODE_VISIBLE_YUV: CamMode =
    CamMode::Visible(StreamSettings::new(VisibleFormat::Yuv, Resolution::Vga, FrameRate::Fps15));

pub const MODE_INFRARED: CamMode =
    CamMode::Infrared(StreamSettings::new(InfraredFormat::Bits10, Resolution::Vga, FrameRate::Fps30));

impl CamMode {
    pub fn kind(&self) -> StreamKind {
        match self {
            CamMode::Off => StreamKind::Off,
            CamMode::Visible(_) => StreamKind::Visible,
            CamMode::Depth(_) => StreamKind::Depth,
            CamMode::Infrared(_) => StreamKind::Infrared,
        }
    }

    pub fn is_off(&self) -> bool {
        matches!(self, CamMode::Off)
    }

    pub fn bits_per_pixel(&self) -> Option<usize> {
        match self {
            CamMode::Off => None,
            CamMode::Visible(s) => Some(s.format.bits_per_pixel()),
            CamMode::Depth(s) => Some(s.format.bits_per_pixel()),
            CamMode::Infrared(s) => Some(s.format.bits_per_pixel()),
        }
    }

    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            CamMode::Off => None,
            CamMode::Visible(s) => Some(s.resolution),
            CamMode::Depth(s) => Some(s.resolution),
            CamMode::Infrared(s) => Some(s.resolution),
        }
    }

    /// Pixel dimensions `(width, height)`, `None` when off
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        self.resolution().map(|r| r.dimensions(self.kind()))
    }

    /// Bytes of one raw frame on the wire. 0 when off.
    pub fn frame_size(&self) -> usize {
        match (self.dimensions(), self.bits_per_pixel()) {
            (Some((w, h)), Some(bpp)) => w * h * bpp / 8,
            _ => 0,
        }
    }

    /// The endpoint this mode streams on, `None` when off
    pub fn endpoint(&self) -> Option<Endpoint> {
        match self.kind() {
            StreamKind::Off => None,
            StreamKind::Depth => Some(Endpoint::Depth),
            StreamKind::Visible | StreamKind::Infrared => Some(Endpoint::Video),
        }
    }

    /// Register writes that switch `endpoint` into this mode, in the order
    /// the hardware needs: stream type off, then the stream parameters, then
    /// the stream type.
    pub fn register_writes(&self, endpoint: Endpoint) -> Result<Vec<(Register, u16)>, CamError> {
        if !endpoint.accepts(self.kind()) {
            return Err(CamError::InvalidMode(format!(
                "{} stream cannot run on the {} endpoint",
                self.kind(),
                endpoint
            )));
        }

        let type_register = endpoint.type_register();
        let mut writes = vec![(type_register, StreamKind::Off.into())];
        match self {
            CamMode::Off => return Ok(writes),
            CamMode::Depth(s) => {
                writes.push((Register::ProjectorCycle, 0));
                writes.push((Register::DepthFmt, s.format.code()));
                writes.push((Register::DepthRes, s.resolution.into()));
                writes.push((Register::DepthFps, s.fps.into()));
                writes.push((Register::DepthFlip, s.flip.into()));
            }
            CamMode::Visible(s) => {
                writes.push((Register::VisibleFmt, s.format.code()));
                writes.push((Register::VisibleRes, s.resolution.into()));
                writes.push((Register::VisibleFps, s.fps.into()));
                writes.push((Register::VisibleFlip, s.flip.into()));
            }
            CamMode::Infrared(s) => {
                writes.push((Register::ProjectorCycle, 0));
                writes.push((Register::InfraredFmt, s.format.code()));
                writes.push((Register::InfraredRes, s.resolution.into()));
                writes.push((Register::InfraredFps, s.fps.into()));
                writes.push((Register::InfraredFlip, s.flip.into()));
            }
        }
        writes.push((type_register, self.kind().into()));
        Ok(writes)
    }
}

impl fmt::Display for CamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_settings<F: fmt::Display>(
            f: &mut fmt::Formatter<'_>,
            kind: StreamKind,
            s: &StreamSettings<F>,
        ) -> fmt::Result {
            write!(f, "{}:{}:{}:{}", kind, s.format, s.resolution, s.fps)?;
            if s.flip {
                write!(f, ":flip")?;
            }
            Ok(())
        }

        match self {
            CamMode::Off => write!(f, "off"),
            CamMode::Visible(s) => write_settings(f, StreamKind::Visible, s),
            CamMode::Depth(s) => write_settings(f, StreamKind::Depth, s),
            CamMode::Infrared(s) => write_settings(f, StreamKind::Infrared, s),
        }
    }
}

fn parse_settings<F: PixelFormat>(fields: &[&str]) -> Result<StreamSettings<F>, CamError> {
    let [format, resolution, fps, rest @ ..] = fields else {
        return Err(CamError::InvalidMode(
            "expected kind:format:resolution:fps[:flip]".to_string(),
        ));
    };
    let flip = match rest {
        [] => false,
        ["flip" | "1" | "true"] => true,
        ["noflip" | "0" | "false"] => false,
        _ => {
            return Err(CamError::InvalidMode(format!("unexpected trailing fields {rest:?}")));
        }
    };
    let fps: u16 = fps
        .parse()
        .map_err(|_| CamError::InvalidMode(format!("frame rate '{fps}' is not a number")))?;

    Ok(StreamSettings {
        format: format.parse()?,
        resolution: resolution.parse()?,
        fps: FrameRate::try_from(fps)?,
        flip,
    })
}

impl FromStr for CamMode {
    type Err = CamError;

    /// Parse `off`, a preset name (`depth`, `visible`, `visible-yuv`,
    /// `infrared`) or a full `kind:format:resolution:fps[:flip]` description.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let fields: Vec<&str> = lowered.split(':').collect();
        match fields.as_slice() {
            ["off"] => Ok(CamMode::Off),
            ["depth"] => Ok(MODE_DEPTH),
            ["visible"] => Ok(MODE_VISIBLE_BAYER),
            ["visible-yuv"] => Ok(MODE_VISIBLE_YUV),
            ["infrared" | "ir"] => Ok(MODE_INFRARED),
            ["depth", rest @ ..] => Ok(CamMode::Depth(parse_settings(rest)?)),
            ["visible", rest @ ..] => Ok(CamMode::Visible(parse_settings(rest)?)),
            ["infrared" | "ir", rest @ ..] => Ok(CamMode::Infrared(parse_settings(rest)?)),
            _ => Err(CamError::InvalidMode(format!("unrecognised mode '{s}'"))),
        }
    }
}
