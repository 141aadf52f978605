//! Bounded submission worker for the analysis collaborator.
//!
//! Frames arrive through [`AnalysisHandle::try_submit`], which never
//! waits: a full queue means the frame is dropped and the media path
//! moves on. One worker task drains the queue, JPEG-encodes each still
//! and submits it under a hard deadline, so a stalled endpoint costs at
//! most one in-flight request plus the queued frames.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::client::AnalysisClient;
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::media::encode::encode_jpeg;
use crate::media::frame::VideoFrame;

/// One queued submission: the frame plus the correlation ids every
/// outcome log line carries.
///
/// Ephemeral and fire-and-forget; a dropped or failed request is never
/// retried, the next frame is a fresh attempt anyway.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub frame: VideoFrame,
    pub connection_id: String,
    pub track_id: String,
}

/// Submission side of the analysis queue.
///
/// Clone freely; the worker stops once every handle is dropped.
#[derive(Clone)]
pub struct AnalysisHandle {
    tx: mpsc::Sender<AnalysisRequest>,
}

impl AnalysisHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<AnalysisRequest>) -> Self {
        Self { tx }
    }

    /// Queue a request for analysis without waiting.
    ///
    /// Returns false when the frame was dropped, either because the
    /// queue is full or the worker has stopped.
    pub fn try_submit(&self, request: AnalysisRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                debug!(
                    connection_id = %request.connection_id,
                    pts = request.frame.pts,
                    "Analysis queue full, dropping frame"
                );
                false
            }
            Err(TrySendError::Closed(request)) => {
                debug!(
                    connection_id = %request.connection_id,
                    pts = request.frame.pts,
                    "Analysis worker stopped, dropping frame"
                );
                false
            }
        }
    }
}

/// Worker that drains the analysis queue
pub struct AnalysisWorker {
    client: AnalysisClient,
    rx: mpsc::Receiver<AnalysisRequest>,
    jpeg_quality: u8,
    timeout: Duration,
}

impl AnalysisWorker {
    /// Start the worker task and return the submission handle
    ///
    /// # Example
    ///
    /// ```
    /// use camgate::analysis::AnalysisWorker;
    /// use camgate::config::AnalysisConfig;
    ///
    /// # tokio_test::block_on(async {
    /// let config = AnalysisConfig {
    ///     enabled: true,
    ///     api_key: "sk-test".to_string(),
    ///     ..Default::default()
    /// };
    /// let (handle, worker) = AnalysisWorker::spawn(&config).unwrap();
    /// // Pass `handle` to the frame processors; drop it to stop the worker
    /// # drop(handle);
    /// # worker.abort();
    /// # });
    /// ```
    pub fn spawn(config: &AnalysisConfig) -> Result<(AnalysisHandle, JoinHandle<()>)> {
        let client = AnalysisClient::new(config)?;
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));

        let worker = Self {
            client,
            rx,
            jpeg_quality: config.jpeg_quality,
            timeout: Duration::from_secs(config.timeout_secs),
        };
        let task = tokio::spawn(worker.run());

        Ok((AnalysisHandle { tx }, task))
    }

    async fn run(mut self) {
        info!("Analysis worker started");

        while let Some(request) = self.rx.recv().await {
            let AnalysisRequest {
                frame,
                connection_id,
                track_id,
            } = request;
            let pts = frame.pts;
            let started = Instant::now();

            let jpeg = match encode_jpeg(&frame, self.jpeg_quality) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    warn!(connection_id = %connection_id, pts, error = %e, "Failed to encode analysis still");
                    continue;
                }
            };

            // The deadline caps the whole submission, connect included
            match tokio::time::timeout(self.timeout, self.client.submit(&jpeg)).await {
                Ok(Ok(caption)) => {
                    info!(
                        connection_id = %connection_id,
                        track_id = %track_id,
                        pts,
                        duration_ms = started.elapsed().as_millis() as u64,
                        caption = %caption,
                        "Analysis result"
                    );
                }
                Ok(Err(e)) => {
                    warn!(connection_id = %connection_id, pts, error = %e, "Analysis submission failed");
                }
                Err(_) => {
                    warn!(
                        connection_id = %connection_id,
                        pts,
                        timeout_secs = self.timeout.as_secs(),
                        "Analysis submission timed out"
                    );
                }
            }
        }

        info!("Analysis worker stopped");
    }
}
