//! Frame reassembly.
//!
//! Consumes parsed packets for one endpoint and emits raw frames of exactly
//! the configured size. The assembler is either synced (trusting its cursor)
//! or not; only a start packet syncs it.
//!
//! ```rust,ignore
//! let mut assembler = FrameAssembler::new(mode.frame_size());
//! if let Assembled::Frame(frame) = assembler.push(&packet) {
//!     consumer.send(frame);
//! }
//! ```

use crate::iso::ParsedPacket;
use bytes::Bytes;
use tracing::debug;

/// Why a partial frame was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncReason {
    /// A start packet arrived before the previous frame's end
    Interrupted { cursor: usize },
    /// Loss padding or packet body would run past the frame
    Overflow { cursor: usize, incoming: usize },
    /// The end packet arrived with the frame short
    ShortFrame { cursor: usize },
    /// The frame size changed
    Reconfigured,
}

/// Result of pushing one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// Packet consumed, frame not complete yet
    Accumulating,
    /// Complete frame, exactly `frame_size` bytes
    Frame(Bytes),
    /// Partial frame dropped, now unsynced
    Desync(DesyncReason),
    /// Not synced (or idle), packet ignored
    Skipped,
}

#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    buffer: Vec<u8>,
    cursor: usize,
    synced: bool,
    desyncs: u64,
}

impl FrameAssembler {
    /// A `frame_size` of 0 is an idle assembler that skips everything.
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            buffer: vec![0; frame_size],
            cursor: 0,
            synced: false,
            desyncs: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Number of desync events since creation
    pub fn desync_count(&self) -> u64 {
        self.desyncs
    }

    /// Switch to a new frame size. Any partial frame is discarded, even when
    /// the size is unchanged.
    pub fn reconfigure(&mut self, frame_size: usize) -> Assembled {
        self.frame_size = frame_size;
        if self.synced {
            return self.desync(DesyncReason::Reconfigured);
        }
        // nothing was in progress, so no frame is lost
        self.reset_buffer();
        Assembled::Desync(DesyncReason::Reconfigured)
    }

    pub fn push(&mut self, packet: &ParsedPacket<'_>) -> Assembled {
        if self.frame_size == 0 {
            return Assembled::Skipped;
        }

        if packet.is_start() {
            let interrupted = self.synced && self.cursor > 0;
            if interrupted {
                let cursor = self.cursor;
                self.desync(DesyncReason::Interrupted { cursor });
            }
            self.synced = true;
            self.cursor = 0;
            return match self.append(packet.body) {
                Ok(()) if packet.is_end() => self.finish(),
                Ok(()) => Assembled::Accumulating,
                Err(reason) => self.desync(reason),
            };
        }

        if !self.synced {
            return Assembled::Skipped;
        }

        if packet.loss > 0 {
            if self.cursor + packet.loss > self.frame_size {
                let cursor = self.cursor;
                return self.desync(DesyncReason::Overflow {
                    cursor,
                    incoming: packet.loss,
                });
            }
            // Buffer is freshly zeroed per frame, so skipping leaves zero padding
            self.cursor += packet.loss;
        }

        if let Err(reason) = self.append(packet.body) {
            return self.desync(reason);
        }

        if packet.is_end() {
            self.finish()
        } else {
            Assembled::Accumulating
        }
    }

    fn append(&mut self, body: &[u8]) -> Result<(), DesyncReason> {
        let end = self.cursor + body.len();
        if end > self.frame_size {
            return Err(DesyncReason::Overflow {
                cursor: self.cursor,
                incoming: body.len(),
            });
        }
        self.buffer[self.cursor..end].copy_from_slice(body);
        self.cursor = end;
        Ok(())
    }

    fn finish(&mut self) -> Assembled {
        if self.cursor != self.frame_size {
            let cursor = self.cursor;
            return self.desync(DesyncReason::ShortFrame { cursor });
        }
        let frame = std::mem::replace(&mut self.buffer, vec![0; self.frame_size]);
        self.cursor = 0;
        Assembled::Frame(Bytes::from(frame))
    }

    fn desync(&mut self, reason: DesyncReason) -> Assembled {
        debug!(?reason, frame_size = self.frame_size, "Frame desync");
        self.reset_buffer();
        self.desyncs += 1;
        Assembled::Desync(reason)
    }

    fn reset_buffer(&mut self) {
        self.buffer = vec![0; self.frame_size];
        self.cursor = 0;
        self.synced = false;
    }
}
