use crate::channel::CommandChannel;
use crate::command::{CommandMessage, Opcode};
use crate::config::CameraConfig;
use crate::constants::{CAMERA_INTERFACE, INFRARED_BRIGHTNESS_RANGE};
use crate::error::CamError;
use crate::mode::{CamMode, Endpoint};
use crate::register::Register;
use crate::source::TransferSource;
use crate::stream::{Frame, FrameStream, ModeEpoch, StatsSnapshot, StreamStats, spawn_pipeline};
use crate::transport::{ControlTransport, IsoBatch, IsochronousTransport, NusbControl};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type FrameSender = mpsc::Sender<Result<Frame, CamError>>;

/// Source, pipeline and consumer queue of one endpoint
struct Capture {
    endpoint: Endpoint,
    mode: CamMode,
    source: TransferSource,
    pipeline: JoinHandle<()>,
    mode_tx: watch::Sender<ModeEpoch>,
    frames_tx: Option<FrameSender>,
    frames_rx: Option<mpsc::Receiver<Result<Frame, CamError>>>,
    stats: Arc<StreamStats>,
}

impl Capture {
    fn start<I: IsochronousTransport>(endpoint: Endpoint, iso: &Arc<I>, config: &CameraConfig) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_queue_depth);
        let (mode_tx, _) = watch::channel(ModeEpoch::default());
        let stats = Arc::new(StreamStats::default());
        let (source, pipeline) = spawn_capture(endpoint, iso, config, &mode_tx, &frames_tx, &stats);
        Self {
            endpoint,
            mode: CamMode::Off,
            source,
            pipeline,
            mode_tx,
            frames_tx: Some(frames_tx),
            frames_rx: Some(frames_rx),
            stats,
        }
    }

    /// Replace a source that ended on a transport error
    fn restart_if_failed<I: IsochronousTransport>(&mut self, iso: &Arc<I>, config: &CameraConfig) {
        let Some(frames_tx) = &self.frames_tx else {
            return;
        };
        if !self.source.is_finished() {
            return;
        }
        info!(endpoint = %self.endpoint, "Restarting capture after transport failure");
        self.pipeline.abort();
        let (source, pipeline) = spawn_capture(self.endpoint, iso, config, &self.mode_tx, frames_tx, &self.stats);
        self.source = source;
        self.pipeline = pipeline;
    }

    fn shutdown(&mut self) {
        self.source.close();
        self.pipeline.abort();
        self.frames_tx = None;
    }
}

fn spawn_capture<I: IsochronousTransport>(
    endpoint: Endpoint,
    iso: &Arc<I>,
    config: &CameraConfig,
    mode_tx: &watch::Sender<ModeEpoch>,
    frames_tx: &FrameSender,
    stats: &Arc<StreamStats>,
) -> (TransferSource, JoinHandle<()>) {
    let batch = IsoBatch {
        packets: config.iso_batch_packets,
        packet_size: endpoint.packet_size(),
    };
    let (source, events) = TransferSource::spawn(Arc::clone(iso), endpoint.address(), batch, config.max_in_flight);
    let pipeline = spawn_pipeline(
        endpoint,
        events,
        mode_tx.subscribe(),
        frames_tx.clone(),
        Arc::clone(stats),
    );
    (source, pipeline)
}

struct Session {
    epoch: u64,
    depth: Capture,
    video: Capture,
    closed: bool,
}

impl Session {
    fn capture_mut(&mut self, endpoint: Endpoint) -> &mut Capture {
        match endpoint {
            Endpoint::Depth => &mut self.depth,
            Endpoint::Video => &mut self.video,
        }
    }
}

/// A Kinect camera: register access plus the depth and video capture
/// pipelines.
pub struct Camera<C, I> {
    channel: CommandChannel<C>,
    iso: Arc<I>,
    config: CameraConfig,
    session: tokio::sync::Mutex<Session>,
    registers: Mutex<HashMap<Register, u16>>,
    depth_stats: Arc<StreamStats>,
    video_stats: Arc<StreamStats>,
}

impl<I: IsochronousTransport> Camera<NusbControl, I> {
    /// Open the first camera found over `nusb`, with `iso` supplying the
    /// isochronous transfers.
    pub async fn open(iso: I, config: CameraConfig) -> Result<Self, CamError> {
        let control = NusbControl::open().await?;
        Self::new(control, iso, config).await
    }
}

impl<C: ControlTransport, I: IsochronousTransport> Camera<C, I> {
    /// Claim the camera interface and start both endpoint pipelines, paused
    /// with every stream off.
    pub async fn new(control: C, iso: I, config: CameraConfig) -> Result<Self, CamError> {
        config.validate()?;

        iso.claim_interface(CAMERA_INTERFACE).await?;
        if let Some(alt) = config.alt_setting {
            iso.set_alt_setting(CAMERA_INTERFACE, alt).await?;
        }

        let iso = Arc::new(iso);
        let depth = Capture::start(Endpoint::Depth, &iso, &config);
        let video = Capture::start(Endpoint::Video, &iso, &config);
        let depth_stats = Arc::clone(&depth.stats);
        let video_stats = Arc::clone(&video.stats);
        info!("Camera ready");

        Ok(Self {
            channel: CommandChannel::new(control, &config),
            iso,
            config,
            session: tokio::sync::Mutex::new(Session {
                epoch: 0,
                depth,
                video,
                closed: false,
            }),
            registers: Mutex::new(HashMap::new()),
            depth_stats,
            video_stats,
        })
    }

    pub fn channel(&self) -> &CommandChannel<C> {
        &self.channel
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Send a raw command and return the reply as-is
    pub async fn command(&self, opcode: Opcode, body: &[u16]) -> Result<CommandMessage, CamError> {
        self.channel.send(opcode, body).await
    }

    /// Read one register. The reply must be `[0, value]`.
    pub async fn read_register(&self, register: Register) -> Result<u16, CamError> {
        let reply = self.channel.send(Opcode::ReadRegister, &[register.address()]).await?;
        match reply.body.as_slice() {
            [0, value] => {
                debug!(%register, value, "Register read");
                Ok(*value)
            }
            _ => Err(CamError::RegisterRead {
                register,
                body: reply.body,
            }),
        }
    }

    /// Write one register. The reply must be `[0]`; anything else is reported
    /// and not retried.
    pub async fn write_register(&self, register: Register, value: u16) -> Result<(), CamError> {
        let reply = self
            .channel
            .send(Opcode::WriteRegister, &[register.address(), value])
            .await?;
        if reply.body != [0] {
            warn!(%register, value, body = ?reply.body, "Register write rejected");
            return Err(CamError::RegisterWrite {
                register,
                body: reply.body,
            });
        }
        debug!(%register, value, "Register written");
        self.registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(register, value);
        Ok(())
    }

    /// Last value successfully written to `register`
    pub fn cached_register(&self, register: Register) -> Option<u16> {
        self.registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&register)
            .copied()
    }

    pub async fn set_infrared_brightness(&self, value: u16) -> Result<(), CamError> {
        if !INFRARED_BRIGHTNESS_RANGE.contains(&value) {
            return Err(CamError::ValueOutOfRange {
                register: Register::InfraredBrightness,
                value,
            });
        }
        self.write_register(Register::InfraredBrightness, value).await
    }

    /// Reconfigure both endpoints.
    ///
    /// Both sources are paused, the register sequences are written (stream
    /// type off, parameters, stream type on), then sources for non-off modes
    /// resume under a new epoch so data from the old mode is discarded.
    /// Concurrent calls run one after another. If a write fails the call
    /// stops there and both endpoints stay paused.
    pub async fn set_mode(&self, depth: CamMode, video: CamMode) -> Result<(), CamError> {
        let mut writes = depth.register_writes(Endpoint::Depth)?;
        writes.extend(video.register_writes(Endpoint::Video)?);

        let mut session = self.session.lock().await;
        if session.closed {
            return Err(CamError::Closed);
        }
        session.depth.source.pause();
        session.video.source.pause();

        for (register, value) in writes {
            self.write_register(register, value).await?;
        }

        session.epoch += 1;
        let epoch = session.epoch;
        for (endpoint, mode) in [(Endpoint::Depth, depth), (Endpoint::Video, video)] {
            let capture = session.capture_mut(endpoint);
            capture.mode = mode;
            capture.mode_tx.send_replace(ModeEpoch { epoch, mode });
            capture.restart_if_failed(&self.iso, &self.config);
            if !mode.is_off() {
                capture.source.resume(epoch);
            }
        }

        info!(%depth, %video, epoch, "Mode set");
        Ok(())
    }

    /// Current `(depth, video)` modes
    pub async fn modes(&self) -> (CamMode, CamMode) {
        let session = self.session.lock().await;
        (session.depth.mode, session.video.mode)
    }

    /// Take the consumer side of an endpoint. Returns `None` if it was
    /// already taken.
    pub async fn frames(&self, endpoint: Endpoint) -> Option<FrameStream> {
        let mut session = self.session.lock().await;
        session
            .capture_mut(endpoint)
            .frames_rx
            .take()
            .map(|rx| FrameStream::new(endpoint, rx))
    }

    pub async fn depth_frames(&self) -> Option<FrameStream> {
        self.frames(Endpoint::Depth).await
    }

    pub async fn video_frames(&self) -> Option<FrameStream> {
        self.frames(Endpoint::Video).await
    }

    pub fn stats(&self, endpoint: Endpoint) -> StatsSnapshot {
        match endpoint {
            Endpoint::Depth => self.depth_stats.snapshot(),
            Endpoint::Video => self.video_stats.snapshot(),
        }
    }

    /// Transfers issued and not yet completed on an endpoint
    pub async fn in_flight(&self, endpoint: Endpoint) -> usize {
        self.session.lock().await.capture_mut(endpoint).source.in_flight()
    }

    /// Stop both pipelines, end the frame streams and release the interface.
    pub async fn close(&self) -> Result<(), CamError> {
        let mut session = self.session.lock().await;
        if session.closed {
            return Ok(());
        }
        session.closed = true;
        session.depth.shutdown();
        session.video.shutdown();
        info!("Camera closed");
        self.iso.release_interface(CAMERA_INTERFACE).await
    }
}
