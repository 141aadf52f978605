//! CamGate: MJPEG camera to WebRTC bridge
//!
//! This crate turns a single remote MJPEG camera feed into real-time
//! WebRTC sessions that browsers can join with one HTTP round trip,
//! optionally forwarding frames to an external vision-analysis service.
//!
//! # Features
//!
//! - **MJPEG ingestion**: demuxes `multipart/x-mixed-replace` streams
//!   into decoded RGB frames with a monotonic timestamp per frame
//! - **Single upstream read**: one camera connection fanned out to every
//!   viewer; a slow viewer skips ahead instead of stalling the feed
//! - **H.264 output**: frames are encoded per connection and written to
//!   a WebRTC video track
//! - **Asynchronous analysis**: JPEG stills are submitted to an HTTP
//!   collaborator off the media path; failures never disturb playback
//! - **HTTP signaling**: `POST /offer` exchanges browser SDP for an
//!   answer, with a built-in viewer page at `/`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  MJPEG camera (HTTP multipart)                           │
//! │  ↓ CameraSource (demux, decode, retry)                   │
//! │  FrameRelay (broadcast, most-recent-wins)                │
//! │  ├─ per connection: FrameProcessor (analysis tap)        │
//! │  │   └─ TrackWriter (H.264) → WebRTC video track         │
//! │  └─ AnalysisWorker (bounded queue, JPEG, HTTP submit)    │
//! │                                                          │
//! │  PeerManager (registry, event dispatch)                  │
//! │  ↑ POST /offer (axum signaling router)                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use camgate::config::Config;
//! use camgate::media::{CameraSource, FrameRelay};
//! use camgate::peer::PeerManager;
//!
//! let config = Config::default().with_source_url("http://camera.local/stream");
//! config.validate()?;
//!
//! let camera = CameraSource::connect(&config.source).await?;
//! let relay = FrameRelay::spawn(camera, config.media.relay_capacity);
//! let manager = PeerManager::new(config.media.clone(), relay, None);
//! ```

#![warn(clippy::all)]

pub mod analysis;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod signaling;

// Re-exports for public API
pub use config::Config;
pub use error::{Error, Result};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
