//! Isochronous transfer source.
//!
//! One driver task per endpoint keeps up to `max_in_flight` batched
//! isochronous reads outstanding and forwards each completed transfer,
//! tagged with the epoch it was issued under. Pausing stops issuing new
//! reads; transfers already in flight still complete and are forwarded.
//! A transport error is forwarded once and ends the source.

use crate::error::CamError;
use crate::transport::{IsoBatch, IsoTransfer, IsochronousTransport};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, trace};

/// Control state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Issuing transfers tagged with this epoch
    Running(u64),
    Paused,
    Closed,
}

/// One completed (or failed) transfer
#[derive(Debug)]
pub struct SourceEvent {
    pub epoch: u64,
    pub result: Result<IsoTransfer, CamError>,
}

/// Handle to a running transfer source. Dropping it closes the source.
#[derive(Debug)]
pub struct TransferSource {
    state: watch::Sender<SourceState>,
    in_flight: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TransferSource {
    /// Start a paused source for `endpoint`. Events arrive on the returned
    /// receiver, which yields `None` once the source has stopped.
    pub fn spawn<I: IsochronousTransport>(
        iso: Arc<I>,
        endpoint: u8,
        batch: IsoBatch,
        max_in_flight: usize,
    ) -> (Self, mpsc::Receiver<SourceEvent>) {
        let (state_tx, state_rx) = watch::channel(SourceState::Paused);
        let (event_tx, event_rx) = mpsc::channel(max_in_flight.max(1));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let driver = Driver {
            iso,
            endpoint,
            batch,
            max_in_flight: max_in_flight.max(1),
            in_flight: Arc::clone(&in_flight),
        };
        let task = tokio::spawn(driver.run(state_rx, event_tx));

        (
            Self {
                state: state_tx,
                in_flight,
                task,
            },
            event_rx,
        )
    }

    /// Stop issuing transfers. In-flight transfers are left to complete.
    pub fn pause(&self) {
        self.set_state(SourceState::Paused);
    }

    /// Issue transfers again, tagging them with `epoch`.
    pub fn resume(&self, epoch: u64) {
        self.set_state(SourceState::Running(epoch));
    }

    /// Stop for good, cancelling in-flight transfers and ending the event stream.
    pub fn close(&self) {
        self.set_state(SourceState::Closed);
    }

    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    /// Transfers issued and not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the driver task has ended, by close or by a transport error
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn set_state(&self, state: SourceState) {
        // Closed is final
        self.state.send_if_modified(|current| {
            if *current == SourceState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

impl Drop for TransferSource {
    fn drop(&mut self) {
        self.close();
    }
}

struct Driver<I> {
    iso: Arc<I>,
    endpoint: u8,
    batch: IsoBatch,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

impl<I: IsochronousTransport> Driver<I> {
    async fn run(self, mut state: watch::Receiver<SourceState>, events: mpsc::Sender<SourceEvent>) {
        let endpoint = self.endpoint;
        debug!(endpoint, "Transfer source started");
        let mut transfers: JoinSet<(u64, Result<IsoTransfer, CamError>)> = JoinSet::new();
        let mut epoch = 0;

        loop {
            let current = *state.borrow_and_update();
            match current {
                SourceState::Closed => break,
                SourceState::Paused => {}
                SourceState::Running(e) => {
                    epoch = e;
                    while transfers.len() < self.max_in_flight {
                        self.issue(&mut transfers, epoch);
                    }
                }
            }

            tokio::select! {
                Some(joined) = transfers.join_next(), if !transfers.is_empty() => {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    let (issued_epoch, result) = joined.unwrap_or_else(|e| {
                        (epoch, Err(CamError::Transport(format!("transfer task failed: {e}"))))
                    });
                    let failed = result.is_err();
                    if let Err(e) = &result {
                        error!(endpoint, error = %e, "Isochronous transfer failed, stopping source");
                    } else {
                        trace!(endpoint, epoch = issued_epoch, "Transfer complete");
                    }
                    if events.send(SourceEvent { epoch: issued_epoch, result }).await.is_err() || failed {
                        break;
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = events.closed() => break,
            }
        }

        transfers.abort_all();
        self.in_flight.store(0, Ordering::Release);
        debug!(endpoint, "Transfer source stopped");
    }

    fn issue(&self, transfers: &mut JoinSet<(u64, Result<IsoTransfer, CamError>)>, epoch: u64) {
        let iso = Arc::clone(&self.iso);
        let endpoint = self.endpoint;
        let batch = self.batch;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        transfers.spawn(async move { (epoch, iso.read_isochronous(endpoint, batch).await) });
    }
}
