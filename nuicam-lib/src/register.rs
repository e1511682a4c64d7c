//! Camera register map.
//!
//! Addresses are hardware constants. Values written to the `*_TYPE` registers
//! are [`StreamKind`](crate::mode::StreamKind) codes, `*_FMT`, `*_RES` and
//! `*_FPS` take the codes from [`crate::mode`], and the flip/cycle registers
//! take 0 or 1.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[repr(u16)]
pub enum Register {
    /// Video stream type: off, visible or infrared
    VideoType = 0x05,
    /// Depth stream type: off or depth
    DepthType = 0x06,

    VisibleFmt = 0x0C,
    VisibleRes = 0x0D,
    VisibleFps = 0x0E,

    DepthFmt = 0x12,
    DepthRes = 0x13,
    DepthFps = 0x14,

    /// 1 to 50
    InfraredBrightness = 0x15,

    DepthFlip = 0x17,

    InfraredFmt = 0x19,
    InfraredRes = 0x1A,
    InfraredFps = 0x1B,

    VisibleFlip = 0x47,
    InfraredFlip = 0x48,

    ProjectorCycle = 0x105,
}

impl Register {
    pub const ALL: [Register; 16] = [
        Register::VideoType,
        Register::DepthType,
        Register::VisibleFmt,
        Register::VisibleRes,
        Register::VisibleFps,
        Register::DepthFmt,
        Register::DepthRes,
        Register::DepthFps,
        Register::InfraredBrightness,
        Register::DepthFlip,
        Register::InfraredFmt,
        Register::InfraredRes,
        Register::InfraredFps,
        Register::VisibleFlip,
        Register::InfraredFlip,
        Register::ProjectorCycle,
    ];

    pub fn address(self) -> u16 {
        self.into()
    }

    /// Look a register up by its kebab-case name, e.g. `depth-type`
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = name.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|r| r.to_string() == wanted)
    }
}
