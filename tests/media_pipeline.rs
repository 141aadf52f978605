//! Media pipeline integration tests
//!
//! End-to-end checks of the demux -> relay -> subscriber flow, driven
//! by in-process MJPEG byte sources instead of a live camera. The byte
//! feed is a channel held by the test, so frame arrival is controlled
//! and every assertion is deterministic.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use image::codecs::jpeg::JpegEncoder;

use camgate::analysis::AnalysisWorker;
use camgate::config::AnalysisConfig;
use camgate::media::mjpeg::ByteStream;
use camgate::media::{
    CameraSource, FrameProcessor, FrameRelay, FrameSource, MjpegStream, PixelFormat,
    StreamDescriptor, TimeBase, TrackWriter,
};
use camgate::Error;

use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("camgate=debug")
        .try_init();
}

/// Encode a solid-color JPEG the way camera firmware would
fn jpeg_frame(width: u32, height: u32, value: u8) -> Vec<u8> {
    let pixels = vec![value; (width * height * 3) as usize];
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, 90);
    encoder
        .encode(&pixels, width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// Wrap JPEG payloads in multipart parts
fn multipart_body(parts: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(part);
        body.extend_from_slice(b"\r\n");
    }
    body
}

type ChunkSender = futures::channel::mpsc::Sender<std::io::Result<Bytes>>;

/// Camera over a hand-fed byte channel. Dropping the sender reads as
/// the upstream connection closing.
fn controlled_camera() -> (ChunkSender, CameraSource) {
    let (tx, rx) = futures::channel::mpsc::channel::<std::io::Result<Bytes>>(64);
    let stream: ByteStream = Box::pin(rx);
    let mjpeg = MjpegStream::new(
        stream,
        StreamDescriptor {
            content_type: "multipart/x-mixed-replace; boundary=frame".to_string(),
            boundary: Some("frame".to_string()),
        },
        TimeBase::from_fps(30),
        1024 * 1024,
    );
    (tx, CameraSource::new(mjpeg, Duration::from_millis(1)))
}

async fn send_body(tx: &mut ChunkSender, body: Vec<u8>) {
    tx.send(Ok(Bytes::from(body))).await.unwrap();
}

/// One camera read fans out to every subscriber without copying pixels
#[tokio::test]
async fn test_fan_out_shares_one_upstream_read() {
    init_logging();
    let (mut tx, camera) = controlled_camera();
    let relay = FrameRelay::spawn(camera, 8);

    let mut a = relay.subscribe().await.unwrap();
    let mut b = relay.subscribe().await.unwrap();

    send_body(&mut tx, multipart_body(&[&jpeg_frame(8, 6, 40)])).await;

    let fa = a.recv().await.unwrap();
    let fb = b.recv().await.unwrap();
    assert_eq!(fa.pts, 0);
    assert_eq!(fb.pts, 0);
    assert_eq!(fa.format, PixelFormat::Rgb24);
    assert_eq!(fa.data.len(), 8 * 6 * 3);
    // Both subscribers hold the same allocation
    assert_eq!(fa.data.as_ptr(), fb.data.as_ptr());
}

/// A corrupt part is retried inside the camera source; subscribers only
/// ever see good frames
#[tokio::test]
async fn test_recoverable_demux_errors_invisible_to_subscribers() {
    init_logging();
    let (mut tx, camera) = controlled_camera();
    let relay = FrameRelay::spawn(camera, 8);
    let mut sub = relay.subscribe().await.unwrap();

    let mut truncated = jpeg_frame(8, 6, 99);
    truncated.truncate(20);
    let mut body = multipart_body(&[&truncated]);
    body.extend_from_slice(&multipart_body(&[&jpeg_frame(8, 6, 10)]));
    body.extend_from_slice(&multipart_body(&[&jpeg_frame(8, 6, 20)]));
    send_body(&mut tx, body).await;

    let first = sub.recv().await.unwrap();
    let second = sub.recv().await.unwrap();
    assert_eq!(first.pts, 0);
    assert_eq!(second.pts, 1);
    assert!(relay.is_live().await);
}

/// A subscriber that stops reading loses the oldest frames and resumes
/// at the most recent ones; the feed itself never stalls
#[tokio::test]
async fn test_slow_subscriber_skips_to_most_recent() {
    init_logging();
    let (mut tx, camera) = controlled_camera();
    let relay = FrameRelay::spawn(camera, 2);
    let mut slow = relay.subscribe().await.unwrap();

    let frames: Vec<Vec<u8>> = (0..6u8).map(|i| jpeg_frame(8, 6, i * 30)).collect();
    let parts: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
    send_body(&mut tx, multipart_body(&parts)).await;
    drop(tx);

    // Read nothing until the feed has broadcast all six frames and
    // closed; the window of two then holds only the last two
    while relay.is_live().await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first = slow.recv().await.unwrap();
    assert_eq!(first.pts, 4);
    assert_eq!(slow.dropped(), 4);

    let second = slow.recv().await.unwrap();
    assert_eq!(second.pts, 5);

    let err = slow.recv().await.unwrap_err();
    assert!(matches!(err, Error::TransportState(_)));
}

/// Upstream loss closes every subscription and rejects new ones
#[tokio::test]
async fn test_source_loss_reaches_every_subscriber() {
    init_logging();
    let (mut tx, camera) = controlled_camera();
    let relay = FrameRelay::spawn(camera, 8);

    let mut a = relay.subscribe().await.unwrap();
    let mut b = relay.subscribe().await.unwrap();

    send_body(&mut tx, multipart_body(&[&jpeg_frame(8, 6, 50)])).await;
    drop(tx);

    assert_eq!(a.recv().await.unwrap().pts, 0);
    assert_eq!(b.recv().await.unwrap().pts, 0);
    assert!(matches!(a.recv().await.unwrap_err(), Error::TransportState(_)));
    assert!(matches!(b.recv().await.unwrap_err(), Error::TransportState(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!relay.is_live().await);
    assert!(relay.subscribe().await.is_err());
}

/// Frames keep flowing at full cadence while the analysis collaborator
/// is unreachable; submissions fail in the background
#[tokio::test]
async fn test_analysis_tap_never_blocks_delivery() {
    init_logging();
    let (mut tx, camera) = controlled_camera();
    let relay = FrameRelay::spawn(camera, 8);
    let subscription = relay.subscribe().await.unwrap();

    // Nothing listens on this port; every submission fails
    let config = AnalysisConfig {
        enabled: true,
        endpoint: "http://127.0.0.1:9/analyze".to_string(),
        api_key: "test-key".to_string(),
        queue_depth: 1,
        timeout_secs: 1,
        ..AnalysisConfig::default()
    };
    let (handle, worker) = AnalysisWorker::spawn(&config).unwrap();
    let mut processor = FrameProcessor::new(
        subscription,
        Some(handle),
        "it-conn".to_string(),
        "it-track".to_string(),
    );

    let frames: Vec<Vec<u8>> = (0..4u8).map(|i| jpeg_frame(8, 6, 60 + i * 20)).collect();
    let parts: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
    send_body(&mut tx, multipart_body(&parts)).await;

    for expected_pts in 0..4 {
        let frame = processor.recv().await.unwrap();
        assert_eq!(frame.pts, expected_pts);
    }

    let (submitted, rejected) = processor.submission_counts();
    assert_eq!(submitted + rejected, 4);

    drop(processor);
    worker.abort();
}

/// Full path: camera bytes demux, relay, encode to H.264, write to a
/// WebRTC track; the writer ends with the relay's terminal error
#[tokio::test]
async fn test_camera_bytes_reach_webrtc_track_as_h264() {
    init_logging();
    let (mut tx, camera) = controlled_camera();
    let relay = FrameRelay::spawn(camera, 8);
    let subscription = relay.subscribe().await.unwrap();
    let processor = FrameProcessor::new(
        subscription,
        None,
        "it-conn".to_string(),
        "it-track".to_string(),
    );

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_string(),
        "camgate-test".to_string(),
    ));
    let writer = TrackWriter::new(processor, Arc::clone(&track), "it-conn".to_string());
    let run = tokio::spawn(writer.run());

    let frames: Vec<Vec<u8>> = (0..3u8).map(|i| jpeg_frame(64, 48, 30 + i * 40)).collect();
    let parts: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
    send_body(&mut tx, multipart_body(&parts)).await;
    drop(tx);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::TransportState(_)));
}
