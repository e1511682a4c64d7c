//! End-to-end camera tests against the mock control and isochronous transports

mod common;

use common::*;
use nuicam_lib::Camera;
use nuicam_lib::constants::{DEPTH_ENDPOINT, DEPTH_PACKET_SIZE, DEPTH_STREAM_FLAG, ISO_HEADER_SIZE};
use nuicam_lib::mode::{
    CamMode, DepthFormat, Endpoint, FrameRate, MODE_DEPTH, MODE_INFRARED, MODE_VISIBLE_BAYER, Resolution,
    StreamSettings,
};
use std::time::Duration;

const DEPTH_BODY: usize = DEPTH_PACKET_SIZE - ISO_HEADER_SIZE;

fn qvga_depth() -> CamMode {
    CamMode::Depth(StreamSettings::new(DepthFormat::Bits11, Resolution::Qvga, FrameRate::Fps30))
}

async fn open(control: &MockControl, iso: &MockIso) -> Camera<MockControl, MockIso> {
    Camera::new(control.clone(), iso.clone(), fast_config()).await.unwrap()
}

fn push_frame(iso: &MockIso, frame: &[u8]) {
    iso.push(DEPTH_ENDPOINT, transfer_of(frame_packets(DEPTH_STREAM_FLAG, 0, frame, DEPTH_BODY)));
}

#[tokio::test]
async fn test_open_claims_interface_and_selects_alt_setting() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let config = CameraConfig {
        alt_setting: Some(1),
        ..fast_config()
    };
    let camera = Camera::new(control.clone(), iso.clone(), config).await.unwrap();

    assert!(iso.is_claimed());
    assert_eq!(iso.alt_setting(), Some(1));
    assert_eq!(camera.modes().await, (CamMode::Off, CamMode::Off));
    // both endpoints start paused
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(iso.batches().is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = CameraConfig {
        frame_queue_depth: 0,
        ..fast_config()
    };
    let result = Camera::new(MockControl::acking(), MockIso::default(), config).await;
    assert!(matches!(result, Err(CamError::Config(_))));
}

#[tokio::test]
async fn test_set_mode_register_sequence() {
    init_tracing();
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;

    camera.set_mode(MODE_DEPTH, MODE_VISIBLE_BAYER).await.unwrap();

    assert_eq!(
        control.register_writes(),
        vec![
            (Register::DepthType, 0),
            (Register::ProjectorCycle, 0),
            (Register::DepthFmt, 3),
            (Register::DepthRes, 1),
            (Register::DepthFps, 30),
            (Register::DepthFlip, 0),
            (Register::DepthType, 2),
            (Register::VideoType, 0),
            (Register::VisibleFmt, 0),
            (Register::VisibleRes, 1),
            (Register::VisibleFps, 30),
            (Register::VisibleFlip, 0),
            (Register::VideoType, 1),
        ]
    );
    assert_eq!(camera.cached_register(Register::DepthType), Some(2));
    assert_eq!(camera.cached_register(Register::VideoType), Some(1));
    assert_eq!(camera.modes().await, (MODE_DEPTH, MODE_VISIBLE_BAYER));
}

#[tokio::test]
async fn test_depth_frames_flow_end_to_end() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;
    let mut depth = camera.depth_frames().await.unwrap();
    assert_eq!(depth.endpoint(), Endpoint::Depth);

    camera.set_mode(qvga_depth(), CamMode::Off).await.unwrap();
    let frame = patterned_frame(qvga_depth().frame_size());
    push_frame(&iso, &frame);

    let delivered = depth.recv().await.unwrap().unwrap();
    assert_eq!(&delivered.data[..], &frame[..]);
    assert_eq!(delivered.mode, qvga_depth());
    assert_eq!(camera.stats(Endpoint::Depth).frames, 1);

    // the video endpoint stays idle while its mode is off
    wait_until(|| iso.active() == 2).await;
    assert!(iso.batches().iter().all(|(endpoint, _)| *endpoint == DEPTH_ENDPOINT));
    assert_eq!(camera.in_flight(Endpoint::Depth).await, 2);
    assert_eq!(camera.in_flight(Endpoint::Video).await, 0);
}

#[tokio::test]
async fn test_frame_stream_can_only_be_taken_once() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;
    assert!(camera.video_frames().await.is_some());
    assert!(camera.video_frames().await.is_none());
}

#[tokio::test]
async fn test_rejected_write_aborts_set_mode() {
    let control = MockControl::with_responder(|request| reply_bytes(request, &[1]));
    let iso = MockIso::default();
    let camera = open(&control, &iso).await;

    let result = camera.set_mode(MODE_DEPTH, CamMode::Off).await;
    match result {
        Err(CamError::RegisterWrite { register, body }) => {
            assert_eq!(register, Register::DepthType);
            assert_eq!(body, vec![1]);
        }
        other => panic!("expected register write failure, got {other:?}"),
    }
    assert_eq!(control.requests().len(), 1);
    assert_eq!(camera.cached_register(Register::DepthType), None);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(iso.batches().is_empty());
}

#[tokio::test]
async fn test_mode_on_wrong_endpoint_sends_nothing() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;

    let result = camera.set_mode(MODE_VISIBLE_BAYER, CamMode::Off).await;
    assert!(matches!(result, Err(CamError::InvalidMode(_))));
    let result = camera.set_mode(CamMode::Off, MODE_DEPTH).await;
    assert!(matches!(result, Err(CamError::InvalidMode(_))));
    assert!(control.requests().is_empty());
}

#[tokio::test]
async fn test_register_read_and_write() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;

    camera.write_register(Register::ProjectorCycle, 1).await.unwrap();
    assert_eq!(camera.read_register(Register::ProjectorCycle).await.unwrap(), 1);
    assert_eq!(camera.cached_register(Register::ProjectorCycle), Some(1));
}

#[tokio::test]
async fn test_malformed_read_reply() {
    let control = MockControl::with_responder(|request| reply_bytes(request, &[0]));
    let iso = MockIso::default();
    let camera = open(&control, &iso).await;

    let result = camera.read_register(Register::DepthType).await;
    assert!(matches!(
        result,
        Err(CamError::RegisterRead {
            register: Register::DepthType,
            ..
        })
    ));
}

#[tokio::test]
async fn test_infrared_brightness_range() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;

    for value in [0, 51] {
        assert!(matches!(
            camera.set_infrared_brightness(value).await,
            Err(CamError::ValueOutOfRange { value: v, .. }) if v == value
        ));
    }
    assert!(control.requests().is_empty());

    camera.set_infrared_brightness(50).await.unwrap();
    assert_eq!(control.register_writes(), vec![(Register::InfraredBrightness, 50)]);
}

#[tokio::test]
async fn test_transport_failure_then_recovery_on_next_set_mode() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;
    let mut depth = camera.depth_frames().await.unwrap();

    camera.set_mode(qvga_depth(), CamMode::Off).await.unwrap();
    iso.push_error(DEPTH_ENDPOINT, CamError::Transport("endpoint stalled".to_string()));
    assert!(matches!(depth.recv().await, Some(Err(CamError::Transport(_)))));

    // let the failed source wind down
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(camera.in_flight(Endpoint::Depth).await, 0);

    camera.set_mode(qvga_depth(), CamMode::Off).await.unwrap();
    let frame = patterned_frame(qvga_depth().frame_size());
    push_frame(&iso, &frame);
    let delivered = depth.recv().await.unwrap().unwrap();
    assert_eq!(&delivered.data[..], &frame[..]);
}

#[tokio::test]
async fn test_concurrent_set_mode_calls_do_not_interleave() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;

    let (a, b) = tokio::join!(
        camera.set_mode(MODE_DEPTH, CamMode::Off),
        camera.set_mode(CamMode::Off, MODE_INFRARED),
    );
    a.unwrap();
    b.unwrap();

    let sequence = |depth: CamMode, video: CamMode| {
        let mut writes = depth.register_writes(Endpoint::Depth).unwrap();
        writes.extend(video.register_writes(Endpoint::Video).unwrap());
        writes
    };
    let first = sequence(MODE_DEPTH, CamMode::Off);
    let second = sequence(CamMode::Off, MODE_INFRARED);

    let writes = control.register_writes();
    let a_then_b = [first.clone(), second.clone()].concat();
    let b_then_a = [second, first].concat();
    assert!(writes == a_then_b || writes == b_then_a, "interleaved: {writes:?}");
}

#[tokio::test]
async fn test_close_ends_streams_and_releases_interface() {
    let (control, iso) = (MockControl::acking(), MockIso::default());
    let camera = open(&control, &iso).await;
    let mut depth = camera.depth_frames().await.unwrap();
    camera.set_mode(qvga_depth(), CamMode::Off).await.unwrap();

    camera.close().await.unwrap();
    assert!(depth.recv().await.is_none());
    assert!(iso.is_released());
    wait_until(|| iso.active() == 0).await;

    assert!(matches!(
        camera.set_mode(MODE_DEPTH, CamMode::Off).await,
        Err(CamError::Closed)
    ));
    // closing twice is harmless
    camera.close().await.unwrap();
}
