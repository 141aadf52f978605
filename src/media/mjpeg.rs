//! MJPEG stream demuxing.
//!
//! An MJPEG camera serves an endless HTTP response of JPEG images separated
//! by multipart boundaries. [`MjpegDemuxer::open`] performs the handshake and
//! returns an [`MjpegStream`] handle; [`MjpegStream::next_frame`] pulls body
//! chunks, carves out complete JPEG payloads by scanning for the SOI/EOI
//! markers, and decodes each payload to the canonical RGB24 layout off the
//! async loop.
//!
//! Error classification follows the stream lifecycle: malformed payloads and
//! oversized scans are recoverable (the read position resynchronizes and the
//! caller may retry after a backoff), transport errors and end-of-stream are
//! fatal and invalidate the handle.

use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::{debug, info, trace};

use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::media::frame::{PixelFormat, TimeBase, VideoFrame};

/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Boxed stream of raw body chunks feeding the demuxer
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// What `open` discovered about the source response
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Response content type
    pub content_type: String,
    /// Multipart boundary token, when the source advertises one
    pub boundary: Option<String>,
}

/// Connects to MJPEG sources
pub struct MjpegDemuxer;

impl MjpegDemuxer {
    /// Establish the connection and locate the video stream.
    ///
    /// Fails with [`Error::Connect`] if the endpoint is unreachable, the
    /// handshake times out, or the response carries no JPEG stream.
    pub async fn open(config: &SourceConfig) -> Result<MjpegStream> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Connect(format!("failed to build HTTP client: {}", e)))?;

        let response = client
            .get(&config.url)
            .send()
            .await
            .map_err(|e| Error::Connect(format!("request to {} failed: {}", config.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Connect(format!(
                "{} answered HTTP {}",
                config.url, status
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let descriptor = parse_descriptor(&content_type).ok_or_else(|| {
            Error::Connect(format!(
                "no video stream at {}: content type '{}' is neither multipart JPEG nor image/jpeg",
                config.url, content_type
            ))
        })?;

        info!(
            url = %config.url,
            content_type = %descriptor.content_type,
            boundary = ?descriptor.boundary,
            "Opened MJPEG source"
        );

        let stream: ByteStream = Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }));

        Ok(MjpegStream::new(
            stream,
            descriptor,
            TimeBase::from_fps(config.fps),
            config.max_frame_bytes,
        ))
    }
}

/// Open handle over an MJPEG byte source.
///
/// Holds the response body stream, the scan buffer (current demux position)
/// and the stream descriptor discovered at open time. Dropping the handle
/// closes the underlying connection.
pub struct MjpegStream {
    stream: ByteStream,
    scanner: JpegScanner,
    descriptor: StreamDescriptor,
    time_base: TimeBase,
    max_frame_bytes: usize,
    next_pts: i64,
}

impl MjpegStream {
    /// Build a stream handle over an arbitrary chunk source. Used by `open`
    /// and by in-process byte sources.
    pub fn new(
        stream: ByteStream,
        descriptor: StreamDescriptor,
        time_base: TimeBase,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            stream,
            scanner: JpegScanner::new(),
            descriptor,
            time_base,
            max_frame_bytes,
            next_pts: 0,
        }
    }

    /// Descriptor discovered at open time
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Time-base applied to produced frames
    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// Read until one complete frame decodes.
    ///
    /// Returns [`Error::DemuxRecoverable`] for malformed payloads (the scan
    /// position has already been resynchronized; retry after a backoff) and
    /// [`Error::DemuxFatal`] when the stream ends or the transport fails.
    pub async fn next_frame(&mut self) -> Result<VideoFrame> {
        loop {
            if let Some(payload) = self.scanner.next_payload(self.max_frame_bytes)? {
                match decode_rgb(payload.clone()).await {
                    Ok((width, height, pixels)) => {
                        let pts = self.next_pts;
                        self.next_pts += 1;
                        trace!(pts, width, height, "Demuxed frame");
                        return VideoFrame::new(
                            width,
                            height,
                            PixelFormat::Rgb24,
                            pixels,
                            pts,
                            self.time_base,
                        );
                    }
                    Err(e) => {
                        // Rescan the failed span from its next SOI so a good
                        // frame glued to a truncated one is not lost.
                        if let Some(inner) = find_marker(&payload[2..], SOI) {
                            self.scanner.requeue(&payload[inner + 2..]);
                        }
                        debug!(error = %e, "Resynchronized after bad payload");
                        return Err(e);
                    }
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.scanner.push(&chunk),
                Some(Err(e)) => {
                    return Err(Error::DemuxFatal(format!("source transport error: {}", e)))
                }
                None => return Err(Error::DemuxFatal("end of stream".to_string())),
            }
        }
    }
}

/// Carves complete JPEG payloads out of a raw byte sequence.
///
/// Multipart headers and boundary lines between parts are discarded as
/// preamble before each SOI. Operates purely on the markers, so boundary
/// token variations across camera firmwares don't matter.
struct JpegScanner {
    buf: BytesMut,
}

impl JpegScanner {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete payload, `Ok(None)` when more bytes are needed.
    ///
    /// An unterminated scan growing past `max_bytes` resets the buffer and
    /// reports a recoverable error.
    fn next_payload(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        let Some(start) = find_marker(&self.buf, SOI) else {
            // No image start in sight; everything buffered is part headers
            // or boundary text. Keep the last byte in case a marker is
            // split across chunks.
            if self.buf.len() > 1 {
                let keep = self.buf.split_off(self.buf.len() - 1);
                self.buf = keep;
            }
            return Ok(None);
        };

        if start > 0 {
            let _ = self.buf.split_to(start);
        }

        match find_marker(&self.buf[2..], EOI) {
            Some(offset) => {
                let end = 2 + offset + 2;
                let payload = self.buf.split_to(end).freeze();
                Ok(Some(payload))
            }
            None => {
                if self.buf.len() > max_bytes {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    return Err(Error::DemuxRecoverable(format!(
                        "unterminated payload exceeded {} bytes (dropped {})",
                        max_bytes, dropped
                    )));
                }
                Ok(None)
            }
        }
    }

    /// Put back a tail of a failed payload so it is rescanned first
    fn requeue(&mut self, tail: &[u8]) {
        if tail.is_empty() {
            return;
        }
        let mut fresh = BytesMut::with_capacity(tail.len() + self.buf.len());
        fresh.extend_from_slice(tail);
        fresh.extend_from_slice(&self.buf);
        self.buf = fresh;
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

fn parse_descriptor(content_type: &str) -> Option<StreamDescriptor> {
    let lower = content_type.to_ascii_lowercase();
    if lower.starts_with("multipart/") {
        let boundary = content_type
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("boundary="))
            .map(|b| b.trim_matches('"').to_string());
        Some(StreamDescriptor {
            content_type: content_type.to_string(),
            boundary,
        })
    } else if lower.starts_with("image/jpeg") {
        Some(StreamDescriptor {
            content_type: content_type.to_string(),
            boundary: None,
        })
    } else {
        None
    }
}

/// Decode a JPEG payload to RGB24 on the blocking pool
async fn decode_rgb(payload: Bytes) -> Result<(u32, u32, Bytes)> {
    tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory_with_format(&payload, image::ImageFormat::Jpeg)
            .map_err(|e| Error::DemuxRecoverable(format!("JPEG decode failed: {}", e)))?;
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok((width, height, Bytes::from(rgb.into_raw())))
    })
    .await
    .map_err(|e| Error::DemuxRecoverable(format!("decode task failed: {}", e)))?
}
