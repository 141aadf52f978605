//! Video frame types shared across the media pipeline.
//!
//! The demuxer reformats every decoded image to one canonical pixel layout
//! ([`PixelFormat::Rgb24`]) so nothing downstream branches on the source
//! format. Frame payloads are reference-counted; cloning a frame shares the
//! pixel buffer, which is what lets the relay hand the same payload to every
//! subscriber.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 24-bit RGB, 3 bytes per pixel, row-major. The canonical
    /// layout produced by the demuxer.
    Rgb24,
    /// Planar YUV 4:2:0, 12 bits per pixel
    Yuv420p,
}

impl PixelFormat {
    /// Expected payload size in bytes for the given dimensions
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = (width as usize) * (height as usize);
        match self {
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Yuv420p => pixels * 3 / 2,
        }
    }
}

/// Rational time-base converting presentation timestamp ticks to wall-clock
/// time. An MJPEG source running at 30fps uses `1/30`: one tick per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    /// Numerator (seconds per tick numerator)
    pub num: u32,
    /// Denominator
    pub den: u32,
}

impl TimeBase {
    /// Time-base for a nominal frame rate: one tick per frame
    pub fn from_fps(fps: u32) -> Self {
        Self { num: 1, den: fps.max(1) }
    }

    /// Convert a tick count to a wall-clock duration
    pub fn ticks_to_duration(&self, ticks: i64) -> Duration {
        if self.den == 0 || ticks <= 0 {
            return Duration::ZERO;
        }
        let micros = (ticks as u64)
            .saturating_mul(self.num as u64)
            .saturating_mul(1_000_000)
            / self.den as u64;
        Duration::from_micros(micros)
    }

    /// Duration of a single tick (one frame period for a `1/fps` base)
    pub fn tick_duration(&self) -> Duration {
        self.ticks_to_duration(1)
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// A single decoded video frame.
///
/// Immutable once produced; `pts` values within one stream are
/// non-decreasing.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel layout of `data`
    pub format: PixelFormat,
    /// Pixel payload; shared between clones
    pub data: Bytes,
    /// Presentation timestamp in `time_base` ticks
    pub pts: i64,
    /// Scale converting `pts` ticks to wall-clock time
    pub time_base: TimeBase,
}

impl VideoFrame {
    /// Create a frame, validating the payload length against the format
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Bytes,
        pts: i64,
        time_base: TimeBase,
    ) -> Result<Self> {
        let expected = format.buffer_size(width, height);
        if data.len() != expected {
            return Err(Error::MediaTrack(format!(
                "Frame payload is {} bytes, expected {} for {:?} {}x{}",
                data.len(),
                expected,
                format,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            pts,
            time_base,
        })
    }

    /// Wall-clock presentation time of this frame within its stream
    pub fn timestamp(&self) -> Duration {
        self.time_base.ticks_to_duration(self.pts)
    }
}

/// Pull-based source of decoded frames.
///
/// `recv` blocks until a frame is available or the source fails terminally;
/// it never returns an empty result.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<VideoFrame>;
}
