//! Per-endpoint capture pipeline: transfer source events through the packet
//! parser and frame assembler to the consumer's [`FrameStream`].

use crate::assembler::{Assembled, FrameAssembler};
use crate::error::{CamError, ProtocolError};
use crate::iso::IsoParser;
use crate::mode::{CamMode, Endpoint};
use crate::source::SourceEvent;
use crate::transport::{IsoStatus, IsoTransfer};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// A complete raw frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    /// Mode the frame was assembled under
    pub mode: CamMode,
    /// Running count of frames completed on this endpoint, starting at 1
    pub number: u64,
    /// Device timestamp of the frame's last packet
    pub timestamp: u32,
}

/// Mode published to a pipeline together with the epoch it takes effect in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeEpoch {
    pub epoch: u64,
    pub mode: CamMode,
}

#[derive(Debug, Default)]
pub struct StreamStats {
    transfers: AtomicU64,
    stale_transfers: AtomicU64,
    packets: AtomicU64,
    errored_packets: AtomicU64,
    filtered_packets: AtomicU64,
    truncated_packets: AtomicU64,
    lost_bytes: AtomicU64,
    frames: AtomicU64,
    dropped_frames: AtomicU64,
    desyncs: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub transfers: u64,
    /// Transfers discarded because they were issued under an older mode
    pub stale_transfers: u64,
    pub packets: u64,
    /// Packets with a failed status or an unparseable header
    pub errored_packets: u64,
    /// Short, foreign-magic or other-stream packets
    pub filtered_packets: u64,
    pub truncated_packets: u64,
    /// Estimated bytes lost to sequence gaps
    pub lost_bytes: u64,
    pub frames: u64,
    /// Complete frames dropped because the consumer queue was full
    pub dropped_frames: u64,
    pub desyncs: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            transfers: get(&self.transfers),
            stale_transfers: get(&self.stale_transfers),
            packets: get(&self.packets),
            errored_packets: get(&self.errored_packets),
            filtered_packets: get(&self.filtered_packets),
            truncated_packets: get(&self.truncated_packets),
            lost_bytes: get(&self.lost_bytes),
            frames: get(&self.frames),
            dropped_frames: get(&self.dropped_frames),
            desyncs: get(&self.desyncs),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Consumer side of one endpoint. Yields frames until the camera closes;
/// a transport failure is delivered as an `Err` item.
#[derive(Debug)]
pub struct FrameStream {
    endpoint: Endpoint,
    rx: mpsc::Receiver<Result<Frame, CamError>>,
}

impl FrameStream {
    pub(crate) fn new(endpoint: Endpoint, rx: mpsc::Receiver<Result<Frame, CamError>>) -> Self {
        Self { endpoint, rx }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Wait for the next frame. `None` once the camera is closed.
    pub async fn recv(&mut self) -> Option<Result<Frame, CamError>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Result<Frame, CamError>> {
        self.rx.try_recv().ok()
    }
}

struct Pipeline {
    endpoint: Endpoint,
    parser: IsoParser,
    assembler: FrameAssembler,
    current: ModeEpoch,
    frames: mpsc::Sender<Result<Frame, CamError>>,
    stats: Arc<StreamStats>,
    frame_number: u64,
}

/// Spawn the pipeline task for one endpoint. It ends when the source's event
/// stream ends, after forwarding a transport error if there was one.
pub fn spawn_pipeline(
    endpoint: Endpoint,
    events: mpsc::Receiver<SourceEvent>,
    mode: watch::Receiver<ModeEpoch>,
    frames: mpsc::Sender<Result<Frame, CamError>>,
    stats: Arc<StreamStats>,
) -> JoinHandle<()> {
    let initial = *mode.borrow();
    let pipeline = Pipeline {
        endpoint,
        parser: IsoParser::new(endpoint.stream_flag()),
        assembler: FrameAssembler::new(initial.mode.frame_size()),
        current: initial,
        frames,
        stats,
        frame_number: 0,
    };
    tokio::spawn(pipeline.run(events, mode))
}

impl Pipeline {
    async fn run(mut self, mut events: mpsc::Receiver<SourceEvent>, mut mode: watch::Receiver<ModeEpoch>) {
        debug!(endpoint = %self.endpoint, "Pipeline started");
        while let Some(event) = events.recv().await {
            if mode.has_changed().unwrap_or(false) {
                let next = *mode.borrow_and_update();
                self.apply_mode(next);
            }

            let transfer = match event.result {
                Ok(transfer) => transfer,
                Err(e) => {
                    error!(endpoint = %self.endpoint, error = %e, "Capture failed");
                    let _ = self.frames.send(Err(e)).await;
                    break;
                }
            };

            if event.epoch != self.current.epoch {
                trace!(endpoint = %self.endpoint, epoch = event.epoch, "Dropping transfer from previous mode");
                StreamStats::add(&self.stats.stale_transfers, 1);
                continue;
            }

            StreamStats::add(&self.stats.transfers, 1);
            self.process(&transfer);
        }
        debug!(endpoint = %self.endpoint, "Pipeline stopped");
    }

    fn apply_mode(&mut self, next: ModeEpoch) {
        if next.epoch == self.current.epoch {
            return;
        }
        debug!(endpoint = %self.endpoint, mode = %next.mode, epoch = next.epoch, "Pipeline reconfigured");
        let before = self.assembler.desync_count();
        self.assembler.reconfigure(next.mode.frame_size());
        StreamStats::add(&self.stats.desyncs, self.assembler.desync_count() - before);
        self.parser.reset();
        self.current = next;
    }

    fn process(&mut self, transfer: &IsoTransfer) {
        let stats = Arc::clone(&self.stats);
        for (status, data) in transfer.packets() {
            StreamStats::add(&stats.packets, 1);
            if status != IsoStatus::Ok {
                StreamStats::add(&stats.errored_packets, 1);
                continue;
            }
            if data.is_empty() {
                continue;
            }

            let packet = match self.parser.parse(data) {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    StreamStats::add(&stats.filtered_packets, 1);
                    continue;
                }
                Err(e @ ProtocolError::TruncatedPacket { .. }) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Dropping truncated packet");
                    StreamStats::add(&stats.truncated_packets, 1);
                    continue;
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Dropping malformed packet");
                    StreamStats::add(&stats.errored_packets, 1);
                    continue;
                }
            };

            StreamStats::add(&stats.lost_bytes, packet.loss as u64);
            let before = self.assembler.desync_count();
            let assembled = self.assembler.push(&packet);
            StreamStats::add(&stats.desyncs, self.assembler.desync_count() - before);

            if let Assembled::Frame(data) = assembled {
                self.deliver(data, packet.timestamp);
            }
        }
    }

    fn deliver(&mut self, data: Bytes, timestamp: u32) {
        self.frame_number += 1;
        let frame = Frame {
            data,
            mode: self.current.mode,
            number: self.frame_number,
            timestamp,
        };
        match self.frames.try_send(Ok(frame)) {
            Ok(()) => StreamStats::add(&self.stats.frames, 1),
            Err(TrySendError::Full(_)) => {
                debug!(endpoint = %self.endpoint, number = self.frame_number, "Consumer behind, frame dropped");
                StreamStats::add(&self.stats.dropped_frames, 1);
            }
            Err(TrySendError::Closed(_)) => {
                StreamStats::add(&self.stats.dropped_frames, 1);
            }
        }
    }
}
