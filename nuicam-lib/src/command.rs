//! # Camera command protocol
//!
//! Register access goes through vendor control transfers carrying a fixed
//! 8-byte header followed by a body of 16-bit words. Every multi-byte field is
//! little-endian.
//!
//! | offset | field     | value                                         |
//! |--------|-----------|-----------------------------------------------|
//! | 0      | magic     | `0x4D47` host-to-device, `0x4252` device-to-host |
//! | 2      | body size | number of u16 words in the body               |
//! | 4      | opcode    | [`Opcode`]                                    |
//! | 6      | tag       | request/reply correlation id, 0 to 255        |
//! | 8      | body      | body size × u16                               |
//!
//! | opcode           | request body     | reply body        |
//! |------------------|------------------|-------------------|
//! | `ReadRegister`   | `[addr]`         | `[status, value]` |
//! | `WriteRegister`  | `[addr, value]`  | `[status]`        |
//!
//! Replies may arrive back-to-back in a single control read, so the inbound
//! side is decoded as a batch.

use crate::constants::{COMMAND_HEADER_SIZE, COMMAND_MAGIC_IN, COMMAND_MAGIC_OUT};
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    ReadRegister = 0x02,
    WriteRegister = 0x03,
    ZeroPlane = 0x04,
    Registration = 0x16,
    Cmos = 0x95,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// Represents the direction of a command message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl Direction {
    pub fn magic(self) -> u16 {
        match self {
            Direction::HostToDevice => COMMAND_MAGIC_OUT,
            Direction::DeviceToHost => COMMAND_MAGIC_IN,
        }
    }
}

/// Wire layout of the command header
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CommandHeaderRaw {
    pub magic: U16,
    pub body_words: U16,
    pub opcode: U16,
    pub tag: U16,
}

/// A decoded command request or reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub direction: Direction,
    pub opcode: Opcode,
    pub tag: u16,
    pub body: Vec<u16>,
}

impl CommandMessage {
    pub fn request(opcode: Opcode, tag: u8, body: &[u16]) -> Self {
        Self {
            direction: Direction::HostToDevice,
            opcode,
            tag: tag.into(),
            body: body.to_vec(),
        }
    }

    pub fn reply(opcode: Opcode, tag: u8, body: &[u16]) -> Self {
        Self {
            direction: Direction::DeviceToHost,
            opcode,
            tag: tag.into(),
            body: body.to_vec(),
        }
    }

    /// Size of the message on the wire
    pub fn wire_len(&self) -> usize {
        COMMAND_HEADER_SIZE + self.body.len() * 2
    }

    pub fn to_bytes(&self) -> Bytes {
        let header = CommandHeaderRaw {
            magic: U16::new(self.direction.magic()),
            body_words: U16::new(self.body.len() as u16),
            opcode: U16::new(self.opcode.into()),
            tag: U16::new(self.tag),
        };
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_slice(header.as_bytes());
        for word in &self.body {
            buf.put_u16_le(*word);
        }
        buf.freeze()
    }

    /// Parse one message from the front of `bytes`, returning it together
    /// with the number of bytes it occupied.
    pub fn from_prefix(bytes: &[u8], direction: Direction) -> Result<(Self, usize), ProtocolError> {
        let (header, rest) =
            CommandHeaderRaw::ref_from_prefix(bytes).map_err(|_| ProtocolError::ShortHeader { len: bytes.len() })?;

        let magic = header.magic.get();
        if magic != direction.magic() {
            return Err(ProtocolError::BadMagic {
                expected: direction.magic(),
                actual: magic,
            });
        }

        let declared = header.body_words.get() as usize;
        if rest.len() < declared * 2 {
            return Err(ProtocolError::BodyLengthMismatch {
                declared,
                available: rest.len() / 2,
            });
        }

        let body = rest[..declared * 2]
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();

        let message = Self {
            direction,
            opcode: Opcode::from_primitive(header.opcode.get()),
            tag: header.tag.get(),
            body,
        };
        Ok((message, COMMAND_HEADER_SIZE + declared * 2))
    }
}

/// Encode a host-to-device command. The header's body size is the word count
/// of `body`.
pub fn encode(opcode: Opcode, tag: u8, body: &[u16]) -> Bytes {
    CommandMessage::request(opcode, tag, body).to_bytes()
}

/// Result of decoding one reply read. Messages decoded before a failure stay
/// usable; the failure ends the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBatch {
    pub messages: Vec<CommandMessage>,
    pub error: Option<ProtocolError>,
}

impl DecodedBatch {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Decode back-to-back device-to-host replies until the input is exhausted
/// or a message fails to decode.
pub fn decode_batch(bytes: &[u8]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    let mut offset = 0;
    while offset < bytes.len() {
        match CommandMessage::from_prefix(&bytes[offset..], Direction::DeviceToHost) {
            Ok((message, consumed)) => {
                batch.messages.push(message);
                offset += consumed;
            }
            Err(e) => {
                batch.error = Some(e);
                break;
            }
        }
    }
    batch
}
