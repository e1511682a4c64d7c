//! Isochronous packet parsing.
//!
//! Every isochronous packet starts with a 12-byte big-endian header:
//!
//! | offset | field                                             |
//! |--------|---------------------------------------------------|
//! | 0      | magic `0x5242`                                    |
//! | 2      | reserved                                          |
//! | 3      | flags: high nibble stream, low nibble position    |
//! | 4      | reserved                                          |
//! | 5      | sequence, wrapping at 256                         |
//! | 6      | packet size including the header                  |
//! | 8      | timestamp                                         |
//!
//! The wire carries no byte offsets, so lost packets can only be estimated
//! from sequence gaps. Each missing packet is assumed to have carried as
//! many body bytes as the packet that reveals the gap.

use crate::constants::{ISO_HEADER_SIZE, ISO_MAGIC};
use crate::error::ProtocolError;
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, trace};
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IsoHeaderRaw {
    pub magic: U16,
    pub reserved0: u8,
    pub flags: u8,
    pub reserved1: u8,
    pub sequence: u8,
    pub size: U16,
    pub timestamp: U32,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsoFlags {
    pub position: B4,
    pub stream: B4,
}

/// Where a packet falls within its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FramePosition {
    Start = 0b0001,
    Mid = 0b0010,
    End = 0b0101,
}

/// A validated packet. `body` borrows the transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub stream: u8,
    pub position: FramePosition,
    pub sequence: u8,
    pub timestamp: u32,
    /// Estimated bytes lost between the previous packet and this one
    pub loss: usize,
    pub body: &'a [u8],
}

impl ParsedPacket<'_> {
    pub fn is_start(&self) -> bool {
        self.position == FramePosition::Start
    }

    pub fn is_end(&self) -> bool {
        self.position == FramePosition::End
    }
}

/// Per-endpoint packet parser, tracking the last sequence number seen.
#[derive(Debug, Clone)]
pub struct IsoParser {
    stream_flag: u8,
    last_sequence: Option<u8>,
}

impl IsoParser {
    pub fn new(stream_flag: u8) -> Self {
        Self {
            stream_flag,
            last_sequence: None,
        }
    }

    /// Forget sequence history
    pub fn reset(&mut self) {
        self.last_sequence = None;
    }

    /// Parse one packet.
    ///
    /// Returns `Ok(None)` for packets that are not ours: shorter than the
    /// header, wrong magic, or another stream's nibble. These never touch the
    /// sequence state.
    pub fn parse<'a>(&mut self, packet: &'a [u8]) -> Result<Option<ParsedPacket<'a>>, ProtocolError> {
        let Ok((header, _)) = IsoHeaderRaw::ref_from_prefix(packet) else {
            trace!(len = packet.len(), "Dropping runt packet");
            return Ok(None);
        };

        if header.magic.get() != ISO_MAGIC {
            debug!(magic = header.magic.get(), "Dropping packet with foreign magic");
            return Ok(None);
        }

        let flags = IsoFlags::from_bytes([header.flags]);
        if flags.stream() != self.stream_flag {
            trace!(stream = flags.stream(), expected = self.stream_flag, "Dropping packet for other stream");
            return Ok(None);
        }

        let declared = header.size.get() as usize;
        if declared > packet.len() {
            return Err(ProtocolError::TruncatedPacket {
                declared,
                available: packet.len(),
            });
        }

        let position = FramePosition::try_from(flags.position())
            .map_err(|_| ProtocolError::UnknownFramePosition(flags.position()))?;

        let sequence = header.sequence;
        let loss = match (position, self.last_sequence) {
            (FramePosition::Start, _) | (_, None) => 0,
            (_, Some(last)) => {
                let delta = sequence.wrapping_sub(last);
                if delta == 1 {
                    0
                } else {
                    // delta 0 wraps to 255 missing packets
                    delta.wrapping_sub(1) as usize * declared.saturating_sub(ISO_HEADER_SIZE)
                }
            }
        };
        self.last_sequence = Some(sequence);

        let end = declared.max(ISO_HEADER_SIZE);
        Ok(Some(ParsedPacket {
            stream: flags.stream(),
            position,
            sequence,
            timestamp: header.timestamp.get(),
            loss,
            body: &packet[ISO_HEADER_SIZE..end],
        }))
    }
}
