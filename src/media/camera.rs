//! Pull-based video source over an MJPEG stream.
//!
//! [`CameraSource`] adapts [`MjpegStream`] to the [`FrameSource`] contract
//! the relay feed loop expects: every `recv` call blocks until a frame is
//! available or the stream fails terminally. Recoverable demux errors are
//! retried inside the call after a backoff of roughly one frame period, so
//! a corrupt payload never busy-loops and never surfaces past this layer.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::media::frame::{FrameSource, VideoFrame};
use crate::media::mjpeg::{MjpegDemuxer, MjpegStream};

/// Frame source backed by a live MJPEG stream handle
pub struct CameraSource {
    stream: MjpegStream,
    backoff: Duration,
    last_pts: Option<i64>,
    terminated: bool,
}

impl CameraSource {
    /// Wrap an open stream handle
    pub fn new(stream: MjpegStream, backoff: Duration) -> Self {
        Self {
            stream,
            backoff,
            last_pts: None,
            terminated: false,
        }
    }

    /// Connect to the configured source and wrap the resulting handle
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let stream = MjpegDemuxer::open(config).await?;
        Ok(Self::new(
            stream,
            Duration::from_millis(config.retry_backoff_ms),
        ))
    }
}

#[async_trait]
impl FrameSource for CameraSource {
    /// Next frame, in source timestamp order.
    ///
    /// The frame's pts and time-base come through from the demuxer
    /// unchanged. A fatal demux error terminates the source; subsequent
    /// calls keep returning a fatal error without touching the stream.
    async fn recv(&mut self) -> Result<VideoFrame> {
        if self.terminated {
            return Err(Error::DemuxFatal("video source already terminated".to_string()));
        }

        loop {
            match self.stream.next_frame().await {
                Ok(frame) => {
                    if let Some(last) = self.last_pts {
                        if frame.pts < last {
                            warn!(pts = frame.pts, last_pts = last, "Out-of-order frame pts");
                        }
                    }
                    self.last_pts = Some(frame.pts);
                    return Ok(frame);
                }
                Err(e) if e.is_recoverable() => {
                    debug!(error = %e, backoff_ms = self.backoff.as_millis() as u64, "Retrying after recoverable demux error");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    self.terminated = true;
                    warn!(error = %e, "Video source terminated");
                    return Err(e);
                }
            }
        }
    }
}
