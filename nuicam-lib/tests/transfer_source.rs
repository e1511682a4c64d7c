//! Tests for the isochronous transfer source: in-flight limit, pause and
//! resume, failure and shutdown.

mod common;

use common::*;
use nuicam_lib::constants::{DEPTH_ENDPOINT, DEPTH_PACKET_SIZE, DEPTH_STREAM_FLAG};
use nuicam_lib::source::{SourceState, TransferSource};
use std::sync::Arc;
use std::time::Duration;

const BATCH: IsoBatch = IsoBatch {
    packets: 16,
    packet_size: DEPTH_PACKET_SIZE,
};

fn small_transfer(sequence: u8) -> IsoTransfer {
    transfer_of(vec![iso_packet(DEPTH_STREAM_FLAG, FramePosition::Mid, sequence, &[sequence])])
}

#[tokio::test]
async fn test_never_more_than_two_in_flight() {
    init_tracing();
    let iso = Arc::new(MockIso::default());
    let (source, mut events) = TransferSource::spawn(Arc::clone(&iso), DEPTH_ENDPOINT, BATCH, 2);
    source.resume(1);

    wait_until(|| iso.active() == 2).await;
    assert_eq!(source.in_flight(), 2);

    for i in 0..10 {
        iso.push(DEPTH_ENDPOINT, small_transfer(i));
    }
    for _ in 0..10 {
        let event = events.recv().await.unwrap();
        assert_eq!(event.epoch, 1);
        assert_eq!(event.result.unwrap().len(), 1);
    }

    assert_eq!(iso.max_active(), 2);
    assert!(iso.batches().iter().all(|(endpoint, batch)| *endpoint == DEPTH_ENDPOINT && *batch == BATCH));
}

#[tokio::test]
async fn test_paused_source_issues_nothing() {
    let iso = Arc::new(MockIso::default());
    let (source, _events) = TransferSource::spawn(Arc::clone(&iso), DEPTH_ENDPOINT, BATCH, 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(source.state(), SourceState::Paused);
    assert!(iso.batches().is_empty());
    assert_eq!(source.in_flight(), 0);
}

#[tokio::test]
async fn test_pause_lets_in_flight_transfers_complete() {
    let iso = Arc::new(MockIso::default());
    let (source, mut events) = TransferSource::spawn(Arc::clone(&iso), DEPTH_ENDPOINT, BATCH, 2);
    source.resume(1);
    wait_until(|| iso.active() == 2).await;

    source.pause();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(iso.active(), 2, "pause must not cancel outstanding reads");

    iso.push(DEPTH_ENDPOINT, small_transfer(1));
    iso.push(DEPTH_ENDPOINT, small_transfer(2));
    for _ in 0..2 {
        let event = events.recv().await.unwrap();
        assert_eq!(event.epoch, 1);
        assert!(event.result.is_ok());
    }

    // nothing new issued while paused
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(iso.batches().len(), 2);
    assert_eq!(source.in_flight(), 0);

    // resuming under a new epoch tags the new transfers with it
    source.resume(2);
    wait_until(|| iso.active() == 2).await;
    iso.push(DEPTH_ENDPOINT, small_transfer(3));
    assert_eq!(events.recv().await.unwrap().epoch, 2);
}

#[tokio::test]
async fn test_transport_error_ends_the_source() {
    let iso = Arc::new(MockIso::default());
    let (source, mut events) = TransferSource::spawn(Arc::clone(&iso), DEPTH_ENDPOINT, BATCH, 2);
    source.resume(1);

    iso.push_error(DEPTH_ENDPOINT, CamError::Transport("endpoint stalled".to_string()));

    let event = events.recv().await.unwrap();
    assert!(matches!(event.result, Err(CamError::Transport(_))));
    assert!(events.recv().await.is_none());
    wait_until(|| source.is_finished()).await;
    wait_until(|| iso.active() == 0).await;
}

#[tokio::test]
async fn test_close_cancels_outstanding_reads() {
    let iso = Arc::new(MockIso::default());
    let (source, mut events) = TransferSource::spawn(Arc::clone(&iso), DEPTH_ENDPOINT, BATCH, 2);
    source.resume(1);
    wait_until(|| iso.active() == 2).await;

    source.close();
    assert!(events.recv().await.is_none());
    wait_until(|| iso.active() == 0).await;
    assert_eq!(source.in_flight(), 0);

    // closed is final
    source.resume(5);
    assert_eq!(source.state(), SourceState::Closed);
}

#[tokio::test]
async fn test_dropping_the_receiver_stops_the_source() {
    let iso = Arc::new(MockIso::default());
    let (source, events) = TransferSource::spawn(Arc::clone(&iso), DEPTH_ENDPOINT, BATCH, 2);
    source.resume(1);
    wait_until(|| iso.active() == 2).await;

    drop(events);
    wait_until(|| source.is_finished()).await;
    wait_until(|| iso.active() == 0).await;
}

#[tokio::test]
async fn test_dropping_the_handle_closes_the_source() {
    let iso = Arc::new(MockIso::default());
    let (source, mut events) = TransferSource::spawn(Arc::clone(&iso), DEPTH_ENDPOINT, BATCH, 2);
    source.resume(1);
    wait_until(|| iso.active() == 2).await;

    drop(source);
    assert!(events.recv().await.is_none());
}
