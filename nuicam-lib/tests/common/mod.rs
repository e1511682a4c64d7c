//! Common test utilities: mock transports and isochronous packet builders

// Shared across test files, not every item is used in every file
#![allow(dead_code, unused_imports)]

pub use bytes::Bytes;
pub use hex;
pub use nuicam_lib::command::{CommandMessage, Direction, Opcode};
pub use nuicam_lib::config::CameraConfig;
pub use nuicam_lib::error::{CamError, ProtocolError};
pub use nuicam_lib::iso::FramePosition;
pub use nuicam_lib::register::Register;
pub use nuicam_lib::transport::{
    ControlRequest, ControlTransport, IsoBatch, IsoStatus, IsoTransfer, IsochronousTransport,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Decode hex string to bytes for testing
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Route library logs to the test output when RUST_LOG is set
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Config with short deadlines so failing tests fail fast
pub fn fast_config() -> CameraConfig {
    CameraConfig {
        command_timeout_ms: 200,
        reply_poll_interval_ms: 2,
        ..Default::default()
    }
}

/// Raw reply bytes for a request
pub fn reply_bytes(request: &CommandMessage, body: &[u16]) -> Vec<u8> {
    CommandMessage::reply(request.opcode, request.tag as u8, body)
        .to_bytes()
        .to_vec()
}

/// Decides what the mock device answers; returned bytes are queued for the
/// next reply read.
pub type Responder = Box<dyn Fn(&CommandMessage) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct ControlState {
    requests: Vec<CommandMessage>,
    outbox: VecDeque<Vec<u8>>,
    registers: HashMap<u16, u16>,
}

struct ControlInner {
    responder: Option<Responder>,
    state: Mutex<ControlState>,
    fail_reads: AtomicBool,
    reverse_replies: AtomicBool,
    reads: AtomicUsize,
}

/// In-memory camera answering register commands. Clones share state.
#[derive(Clone)]
pub struct MockControl {
    inner: Arc<ControlInner>,
}

impl MockControl {
    fn build(responder: Option<Responder>) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                responder,
                state: Mutex::new(ControlState::default()),
                fail_reads: AtomicBool::new(false),
                reverse_replies: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
            }),
        }
    }

    /// Accepts every write and reads back the last written value
    pub fn acking() -> Self {
        Self::build(None)
    }

    /// Never replies
    pub fn silent() -> Self {
        Self::build(Some(Box::new(|_| Vec::new())))
    }

    pub fn with_responder(responder: impl Fn(&CommandMessage) -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(responder)))
    }

    /// Queue raw bytes for the next reply read
    pub fn inject(&self, bytes: &[u8]) {
        self.inner.state.lock().unwrap().outbox.push_back(bytes.to_vec());
    }

    pub fn fail_reads(&self) {
        self.inner.fail_reads.store(true, Ordering::SeqCst);
    }

    /// Deliver queued replies newest first
    pub fn reverse_replies(&self) {
        self.inner.reverse_replies.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CommandMessage> {
        self.inner.state.lock().unwrap().requests.clone()
    }

    /// `(register, value)` of every write request, in order
    pub fn register_writes(&self) -> Vec<(Register, u16)> {
        self.requests()
            .iter()
            .filter(|r| r.opcode == Opcode::WriteRegister)
            .map(|r| (Register::try_from(r.body[0]).unwrap(), r.body[1]))
            .collect()
    }

    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    fn default_reply(state: &mut ControlState, request: &CommandMessage) -> Vec<u8> {
        match (request.opcode, request.body.as_slice()) {
            (Opcode::WriteRegister, [addr, value]) => {
                state.registers.insert(*addr, *value);
                reply_bytes(request, &[0])
            }
            (Opcode::ReadRegister, [addr]) => {
                let value = state.registers.get(addr).copied().unwrap_or(0);
                reply_bytes(request, &[0, value])
            }
            _ => reply_bytes(request, &[0]),
        }
    }
}

impl ControlTransport for MockControl {
    async fn write_control(&self, request: ControlRequest, data: Bytes) -> Result<usize, CamError> {
        assert_eq!(request, ControlRequest::CAMERA);
        let (message, _) = CommandMessage::from_prefix(&data, Direction::HostToDevice).expect("malformed request");
        let mut state = self.inner.state.lock().unwrap();
        let reply = match &self.inner.responder {
            Some(responder) => responder(&message),
            None => Self::default_reply(&mut state, &message),
        };
        if !reply.is_empty() {
            state.outbox.push_back(reply);
        }
        state.requests.push(message);
        Ok(data.len())
    }

    async fn read_control(&self, request: ControlRequest, length: u16) -> Result<Vec<u8>, CamError> {
        assert_eq!(request, ControlRequest::CAMERA);
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(CamError::Transport("device unplugged".to_string()));
        }

        let mut state = self.inner.state.lock().unwrap();
        let mut replies: Vec<Vec<u8>> = state.outbox.drain(..).collect();
        if self.inner.reverse_replies.load(Ordering::SeqCst) {
            replies.reverse();
        }
        let mut out: Vec<u8> = replies.concat();
        // Whatever does not fit waits for the next read
        if out.len() > length as usize {
            let rest = out.split_off(length as usize);
            state.outbox.push_front(rest);
        }
        Ok(out)
    }
}

struct IsoInner {
    queues: Mutex<HashMap<u8, VecDeque<Result<IsoTransfer, CamError>>>>,
    batches: Mutex<Vec<(u8, IsoBatch)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    claimed: AtomicBool,
    released: AtomicBool,
    alt_setting: Mutex<Option<u8>>,
}

/// Isochronous endpoint fed from per-endpoint queues. A read waits until
/// something is queued for its endpoint. Clones share state.
#[derive(Clone)]
pub struct MockIso {
    inner: Arc<IsoInner>,
}

impl Default for MockIso {
    fn default() -> Self {
        Self {
            inner: Arc::new(IsoInner {
                queues: Mutex::new(HashMap::new()),
                batches: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                claimed: AtomicBool::new(false),
                released: AtomicBool::new(false),
                alt_setting: Mutex::new(None),
            }),
        }
    }
}

impl MockIso {
    pub fn push(&self, endpoint: u8, transfer: IsoTransfer) {
        self.push_result(endpoint, Ok(transfer));
    }

    pub fn push_error(&self, endpoint: u8, error: CamError) {
        self.push_result(endpoint, Err(error));
    }

    fn push_result(&self, endpoint: u8, result: Result<IsoTransfer, CamError>) {
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(result);
    }

    /// Reads currently waiting
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of reads ever waiting at once
    pub fn max_active(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Every read issued, in order
    pub fn batches(&self) -> Vec<(u8, IsoBatch)> {
        self.inner.batches.lock().unwrap().clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn alt_setting(&self) -> Option<u8> {
        *self.inner.alt_setting.lock().unwrap()
    }

    fn pop(&self, endpoint: u8) -> Option<Result<IsoTransfer, CamError>> {
        self.inner.queues.lock().unwrap().get_mut(&endpoint)?.pop_front()
    }
}

/// Keeps the active count right when a read is aborted
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IsochronousTransport for MockIso {
    async fn claim_interface(&self, _interface: u8) -> Result<(), CamError> {
        self.inner.claimed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release_interface(&self, _interface: u8) -> Result<(), CamError> {
        self.inner.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_alt_setting(&self, _interface: u8, alt_setting: u8) -> Result<(), CamError> {
        *self.inner.alt_setting.lock().unwrap() = Some(alt_setting);
        Ok(())
    }

    async fn read_isochronous(&self, endpoint: u8, batch: IsoBatch) -> Result<IsoTransfer, CamError> {
        self.inner.batches.lock().unwrap().push((endpoint, batch));
        let now = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.inner.active);

        loop {
            if let Some(result) = self.pop(endpoint) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// One isochronous packet with a valid header
pub fn iso_packet(stream: u8, position: FramePosition, sequence: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x52, 0x42, 0x00, (stream << 4) | u8::from(position), 0x00, sequence];
    packet.extend_from_slice(&((12 + body.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&0x0102_0304u32.to_be_bytes());
    packet.extend_from_slice(body);
    packet
}

/// Split a frame into start, mid and end packets of at most `body_size`
/// payload bytes, numbered from `first_sequence`.
pub fn frame_packets(stream: u8, first_sequence: u8, frame: &[u8], body_size: usize) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = frame.chunks(body_size).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let position = match i {
                0 => FramePosition::Start,
                i if i == last => FramePosition::End,
                _ => FramePosition::Mid,
            };
            iso_packet(stream, position, first_sequence.wrapping_add(i as u8), chunk)
        })
        .collect()
}

/// A transfer carrying the given packets, all with OK status
pub fn transfer_of(packets: Vec<Vec<u8>>) -> IsoTransfer {
    IsoTransfer::from_packets(packets.into_iter().map(|p| (IsoStatus::Ok, p)))
}

/// A test frame with a recognisable byte pattern
pub fn patterned_frame(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Wait until `condition` holds, failing the test after a second
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
