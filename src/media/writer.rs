//! Per-connection outbound sample writer.
//!
//! One writer task per peer connection pulls frames from its own
//! subscription, H.264-encodes them, and hands samples to the peer's
//! outbound track. webrtc-rs packetizes samples into RTP per RFC 6184.
//!
//! The writer owns its encoder because encode state (IDR cadence, rate
//! control) is per-receiver: a peer joining mid-stream needs its own
//! leading keyframe, not a slice of someone else's refresh cycle.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};
use crate::media::encode::H264Encoder;
use crate::media::frame::{FrameSource, VideoFrame};

/// Forced IDR cadence in seconds of source time
const KEYFRAME_INTERVAL_SECS: u64 = 2;

/// Pulls frames from a source and writes encoded samples to one track
pub struct TrackWriter<S> {
    source: S,
    track: Arc<TrackLocalStaticSample>,
    connection_id: String,
    encoder: Option<H264Encoder>,
    frames_written: u64,
}

impl<S: FrameSource> TrackWriter<S> {
    pub fn new(source: S, track: Arc<TrackLocalStaticSample>, connection_id: String) -> Self {
        Self {
            source,
            track,
            connection_id,
            encoder: None,
            frames_written: 0,
        }
    }

    /// Run until the source or the track fails terminally.
    ///
    /// Always ends with an error carrying the terminal reason; the
    /// caller decides what that means for the connection.
    pub async fn run(mut self) -> Result<()> {
        info!(connection_id = %self.connection_id, "Track writer started");

        let result = self.write_loop().await;
        if let Err(e) = &result {
            info!(
                connection_id = %self.connection_id,
                frames = self.frames_written,
                reason = %e,
                "Track writer stopped"
            );
        }
        result
    }

    async fn write_loop(&mut self) -> Result<()> {
        loop {
            let frame = self.source.recv().await?;
            self.write_frame(frame).await?;
        }
    }

    async fn write_frame(&mut self, frame: VideoFrame) -> Result<()> {
        let duration = frame.time_base.tick_duration();
        let pts = frame.pts;

        let encoder = self.ensure_encoder(&frame)?;
        let encoded = encoder.encode(&frame)?;

        let sample = Sample {
            data: encoded.data,
            duration,
            timestamp: SystemTime::now(),
            ..Default::default()
        };

        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| Error::MediaTrack(format!("Failed to write RTP sample: {}", e)))?;

        self.frames_written += 1;
        if encoded.is_keyframe {
            debug!(connection_id = %self.connection_id, pts, "Wrote keyframe sample");
        }
        Ok(())
    }

    /// Encoder matching the current frame geometry, recreated on change
    fn ensure_encoder(&mut self, frame: &VideoFrame) -> Result<&mut H264Encoder> {
        let stale = self
            .encoder
            .as_ref()
            .map(|e| e.width() != frame.width || e.height() != frame.height)
            .unwrap_or(true);

        if stale {
            if self.encoder.is_some() {
                info!(
                    connection_id = %self.connection_id,
                    width = frame.width,
                    height = frame.height,
                    "Source geometry changed, restarting encoder"
                );
            }
            let keyframe_interval =
                (frame.time_base.den as u64).saturating_mul(KEYFRAME_INTERVAL_SECS);
            let encoder = H264Encoder::new(frame.width, frame.height, keyframe_interval)?;
            return Ok(self.encoder.insert(encoder));
        }

        match self.encoder.as_mut() {
            Some(encoder) => Ok(encoder),
            None => Err(Error::Encoding("Encoder not initialized".to_string())),
        }
    }
}
