//! Tag-correlated command channel.
//!
//! Each [`CommandChannel::send`] takes the next 8-bit tag, registers a
//! oneshot in the pending table, writes the request and waits for the reply
//! with that tag. Replies are drained by a single poll task that runs only
//! while the table is non-empty, so reads never overlap.

use crate::command::{CommandMessage, Opcode, decode_batch, encode};
use crate::config::CameraConfig;
use crate::error::CamError;
use crate::transport::{ControlRequest, ControlTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

type Reply = Result<CommandMessage, CamError>;

struct Pending {
    /// Unique per send, so a stale cleanup never removes a reused tag
    id: u64,
    opcode: Opcode,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct ChannelState {
    last_tag: u8,
    next_id: u64,
    pending: HashMap<u8, Pending>,
    polling: bool,
}

struct Shared<C> {
    transport: C,
    state: Mutex<ChannelState>,
    command_timeout: Duration,
    poll_interval: Duration,
    read_size: u16,
    reply_desyncs: AtomicU64,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, tag: u8, id: u64) {
        let mut state = self.lock();
        if state.pending.get(&tag).is_some_and(|p| p.id == id) {
            state.pending.remove(&tag);
        }
    }

    fn dispatch(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        trace!(bytes = hex::encode(bytes), "Reply read");

        let batch = decode_batch(bytes);
        let mut state = self.lock();
        for message in batch.messages {
            let entry = u8::try_from(message.tag).ok().and_then(|tag| state.pending.remove(&tag));
            match entry {
                Some(pending) => {
                    if pending.opcode != message.opcode {
                        debug!(
                            tag = message.tag,
                            sent = ?pending.opcode,
                            got = ?message.opcode,
                            "Reply opcode differs"
                        );
                    }
                    debug!(tag = message.tag, body = ?message.body, "Reply received");
                    // receiver may have timed out already
                    let _ = pending.reply.send(Ok(message));
                }
                None => {
                    warn!(tag = message.tag, opcode = ?message.opcode, "Reply for unknown tag");
                }
            }
        }

        if let Some(e) = batch.error {
            self.reply_desyncs.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Reply stream lost sync, rest of read dropped");
        }
    }
}

/// Request/response protocol over a [`ControlTransport`]. Cheap to clone.
pub struct CommandChannel<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for CommandChannel<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: ControlTransport> CommandChannel<C> {
    pub fn new(transport: C, config: &CameraConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                state: Mutex::new(ChannelState::default()),
                command_timeout: config.command_timeout(),
                poll_interval: config.reply_poll_interval(),
                read_size: config.reply_read_size,
                reply_desyncs: AtomicU64::new(0),
            }),
        }
    }

    pub fn transport(&self) -> &C {
        &self.shared.transport
    }

    /// Commands currently waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Reply reads that contained undecodable data
    pub fn reply_desync_count(&self) -> u64 {
        self.shared.reply_desyncs.load(Ordering::Relaxed)
    }

    /// Send one command and wait for its reply.
    ///
    /// The reply body is returned as-is; a non-zero status word is for the
    /// caller to interpret.
    pub async fn send(&self, opcode: Opcode, body: &[u16]) -> Result<CommandMessage, CamError> {
        let (tag, id, rx) = self.reserve(opcode)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            tag,
            id,
        };

        debug!(tag, ?opcode, ?body, "Sending command");
        let request = encode(opcode, tag, body);
        self.shared.transport.write_control(ControlRequest::CAMERA, request).await?;
        self.ensure_polling();

        match timeout(self.shared.command_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CamError::ChannelClosed),
            Err(_) => {
                debug!(tag, ?opcode, "Command timed out");
                Err(CamError::CommandTimeout { tag, opcode })
            }
        }
    }

    /// Allocate the next tag and register it. A tag still outstanding means
    /// the tag space is exhausted; every pending command is failed.
    fn reserve(&self, opcode: Opcode) -> Result<(u8, u64, oneshot::Receiver<Reply>), CamError> {
        let mut state = self.shared.lock();
        let tag = state.last_tag.wrapping_add(1);
        state.last_tag = tag;

        if state.pending.contains_key(&tag) {
            let outstanding = state.pending.len();
            error!(tag, outstanding, "Tag space exhausted, failing all pending commands");
            for (_, pending) in state.pending.drain() {
                let _ = pending.reply.send(Err(CamError::TooManyPending));
            }
            return Err(CamError::TooManyPending);
        }

        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            tag,
            Pending {
                id,
                opcode,
                reply: tx,
            },
        );
        Ok((tag, id, rx))
    }

    fn ensure_polling(&self) {
        let mut state = self.shared.lock();
        if state.polling || state.pending.is_empty() {
            return;
        }
        state.polling = true;
        drop(state);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(poll_replies(shared));
    }
}

/// Removes the pending entry when `send` returns or is cancelled
struct PendingGuard<'a, C> {
    shared: &'a Shared<C>,
    tag: u8,
    id: u64,
}

impl<C> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        self.shared.remove(self.tag, self.id);
    }
}

async fn poll_replies<C: ControlTransport>(shared: Arc<Shared<C>>) {
    trace!("Reply poll started");
    loop {
        tokio::time::sleep(shared.poll_interval).await;

        {
            let mut state = shared.lock();
            if state.pending.is_empty() {
                state.polling = false;
                trace!("Reply poll stopped");
                return;
            }
        }

        match shared.transport.read_control(ControlRequest::CAMERA, shared.read_size).await {
            Ok(bytes) => shared.dispatch(&bytes),
            Err(e) => {
                error!(error = %e, "Reply read failed, failing pending commands");
                let mut state = shared.lock();
                let message = e.to_string();
                for (_, pending) in state.pending.drain() {
                    let _ = pending.reply.send(Err(CamError::Transport(message.clone())));
                }
                state.polling = false;
                return;
            }
        }
    }
}
