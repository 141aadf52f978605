//! Analysis tap on a frame subscription.
//!
//! [`FrameProcessor`] sits between a relay subscription and whatever
//! consumes it, handing a copy of each frame to the analysis queue on
//! the way through. Submission never waits and failure never changes
//! what the consumer sees: the original frame comes back at the same
//! cadence whether analysis accepted the copy, dropped it, or is not
//! configured at all.

use async_trait::async_trait;
use tracing::trace;

use crate::analysis::{AnalysisHandle, AnalysisRequest};
use crate::error::Result;
use crate::media::frame::{FrameSource, VideoFrame};
use crate::media::relay::FrameSubscription;

/// Pass-through frame source that tees into the analysis queue.
///
/// The connection and track ids ride along with every submission so
/// the worker's outcome logs correlate back to the peer they came from.
pub struct FrameProcessor {
    subscription: FrameSubscription,
    analysis: Option<AnalysisHandle>,
    connection_id: String,
    track_id: String,
    submitted: u64,
    rejected: u64,
}

impl FrameProcessor {
    pub fn new(
        subscription: FrameSubscription,
        analysis: Option<AnalysisHandle>,
        connection_id: String,
        track_id: String,
    ) -> Self {
        Self {
            subscription,
            analysis,
            connection_id,
            track_id,
            submitted: 0,
            rejected: 0,
        }
    }

    /// Frames accepted and rejected by the analysis queue so far
    pub fn submission_counts(&self) -> (u64, u64) {
        (self.submitted, self.rejected)
    }
}

#[async_trait]
impl FrameSource for FrameProcessor {
    async fn recv(&mut self) -> Result<VideoFrame> {
        let frame = self.subscription.recv().await?;

        if let Some(handle) = &self.analysis {
            // The clone shares the pixel buffer; the queue owns no copy
            let request = AnalysisRequest {
                frame: frame.clone(),
                connection_id: self.connection_id.clone(),
                track_id: self.track_id.clone(),
            };
            if handle.try_submit(request) {
                self.submitted += 1;
            } else {
                self.rejected += 1;
            }
            trace!(
                connection_id = %self.connection_id,
                pts = frame.pts,
                submitted = self.submitted,
                rejected = self.rejected,
                "Frame passed through analysis tap"
            );
        }

        Ok(frame)
    }
}
