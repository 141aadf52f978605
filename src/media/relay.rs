//! Single-reader fan-out for the live video feed.
//!
//! Exactly one task pulls frames from the upstream [`FrameSource`] and
//! broadcasts them to every subscriber. Frame payloads are reference
//! counted, so fan-out never copies pixel data. A subscriber that falls
//! behind loses the oldest frames in its window and resumes at the most
//! recent one; it never applies backpressure to the upstream read loop.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::frame::{FrameSource, VideoFrame};

/// Fan-out hub for a single upstream video source
pub struct FrameRelay {
    sender: Arc<RwLock<Option<broadcast::Sender<VideoFrame>>>>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameRelay {
    /// Start the relay and its upstream read loop.
    ///
    /// `capacity` is the per-subscriber frame window. The read loop runs
    /// until the source fails terminally, then closes all subscriptions.
    pub fn spawn<S>(mut source: S, capacity: usize) -> Arc<Self>
    where
        S: FrameSource + 'static,
    {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let sender = Arc::new(RwLock::new(Some(tx)));

        let feed_sender = Arc::clone(&sender);
        let feed = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(frame) => {
                        let guard = feed_sender.read().await;
                        if let Some(tx) = guard.as_ref() {
                            // Send only fails when nobody is subscribed
                            let _ = tx.send(frame);
                        } else {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Video source failed, closing relay");
                        feed_sender.write().await.take();
                        break;
                    }
                }
            }
            info!("Relay feed loop stopped");
        });

        Arc::new(Self {
            sender,
            feed_task: Mutex::new(Some(feed)),
        })
    }

    /// Subscribe to the live feed.
    ///
    /// The subscription sees frames broadcast after this call. Fails once
    /// the relay has closed.
    pub async fn subscribe(&self) -> Result<FrameSubscription> {
        let guard = self.sender.read().await;
        match guard.as_ref() {
            Some(tx) => Ok(FrameSubscription {
                rx: tx.subscribe(),
                dropped: 0,
            }),
            None => Err(Error::TransportState("video relay is closed".to_string())),
        }
    }

    /// Whether the upstream feed is still running
    pub async fn is_live(&self) -> bool {
        self.sender.read().await.is_some()
    }

    /// Number of live subscriptions
    pub async fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .await
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Stop the feed loop and close all subscriptions
    pub async fn close(&self) {
        self.sender.write().await.take();
        if let Some(task) = self.feed_task.lock().await.take() {
            task.abort();
        }
    }
}

/// One subscriber's view of the relayed feed
pub struct FrameSubscription {
    rx: broadcast::Receiver<VideoFrame>,
    dropped: u64,
}

impl FrameSubscription {
    /// Next frame for this subscriber.
    ///
    /// When the subscriber has fallen behind its window, the skipped
    /// frames are counted and the call resumes at the oldest retained
    /// frame. Returns an error once the relay has closed.
    pub async fn recv(&mut self) -> Result<VideoFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    debug!(skipped, "Subscriber lagged, resuming at latest frames");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::TransportState("video relay is closed".to_string()));
                }
            }
        }
    }

    /// Total frames this subscriber has missed due to lag
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::channel_source;
    use std::time::Duration;

    fn frame(pts: i64) -> VideoFrame {
        crate::media::testing::rgb_frame(pts, 2, 2)
    }

    #[tokio::test]
    async fn test_fan_out_shares_payload() {
        let (tx, source) = channel_source();
        let relay = FrameRelay::spawn(source, 8);

        let mut a = relay.subscribe().await.unwrap();
        let mut b = relay.subscribe().await.unwrap();
        assert_eq!(relay.subscriber_count().await, 2);

        tx.send(Ok(frame(0))).await.unwrap();

        let fa = a.recv().await.unwrap();
        let fb = b.recv().await.unwrap();
        assert_eq!(fa.pts, 0);
        assert_eq!(fb.pts, 0);
        // Same underlying allocation on both sides of the fan-out
        assert_eq!(fa.data.as_ptr(), fb.data.as_ptr());
    }

    #[tokio::test]
    async fn test_slow_subscriber_skips_to_latest() {
        let (tx, source) = channel_source();
        let relay = FrameRelay::spawn(source, 2);

        let mut slow = relay.subscribe().await.unwrap();
        for pts in 0..5 {
            tx.send(Ok(frame(pts))).await.unwrap();
        }
        // Let the feed loop drain the queue before reading
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = slow.recv().await.unwrap();
        assert_eq!(first.pts, 3);
        assert_eq!(slow.dropped(), 3);

        let second = slow.recv().await.unwrap();
        assert_eq!(second.pts, 4);
    }

    #[tokio::test]
    async fn test_source_failure_closes_subscriptions() {
        let (tx, source) = channel_source();
        let relay = FrameRelay::spawn(source, 8);

        let mut sub = relay.subscribe().await.unwrap();
        tx.send(Ok(frame(0))).await.unwrap();
        tx.send(Err(Error::DemuxFatal("gone".to_string()))).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().pts, 0);
        let err = sub.recv().await.unwrap_err();
        assert!(matches!(err, Error::TransportState(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relay.is_live().await);
        assert!(relay.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_new_frames() {
        let (tx, source) = channel_source();
        let relay = FrameRelay::spawn(source, 8);

        tx.send(Ok(frame(0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut sub = relay.subscribe().await.unwrap();
        tx.send(Ok(frame(1))).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().pts, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_tx, source) = channel_source();
        let relay = FrameRelay::spawn(source, 8);
        relay.close().await;
        relay.close().await;
        assert!(relay.subscribe().await.is_err());
    }
}
