//! Media pipeline: demux, fan-out, encode, per-connection delivery.
//!
//! Frames move one way: the MJPEG demuxer produces canonical RGB frames,
//! the relay fans them out, and per-connection writers encode and hand
//! them to their peer's outbound track.

pub mod camera;
pub mod encode;
pub mod frame;
pub mod mjpeg;
pub mod processor;
pub mod relay;
pub mod writer;

pub use camera::CameraSource;
pub use encode::{encode_jpeg, EncodedFrame, H264Encoder};
pub use frame::{FrameSource, PixelFormat, TimeBase, VideoFrame};
pub use mjpeg::{MjpegDemuxer, MjpegStream, StreamDescriptor};
pub use processor::FrameProcessor;
pub use relay::{FrameRelay, FrameSubscription};
pub use writer::TrackWriter;

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::error::{Error, Result};
    use crate::media::frame::{FrameSource, PixelFormat, TimeBase, VideoFrame};

    /// Frame source fed by hand; the channel closing reads as end of stream
    pub struct ChannelSource {
        rx: mpsc::Receiver<Result<VideoFrame>>,
    }

    pub fn channel_source() -> (mpsc::Sender<Result<VideoFrame>>, ChannelSource) {
        let (tx, rx) = mpsc::channel(32);
        (tx, ChannelSource { rx })
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn recv(&mut self) -> Result<VideoFrame> {
            match self.rx.recv().await {
                Some(item) => item,
                None => Err(Error::DemuxFatal("end of stream".to_string())),
            }
        }
    }

    /// Solid-color RGB frame at a 1/30 time-base
    pub fn rgb_frame(pts: i64, width: u32, height: u32) -> VideoFrame {
        VideoFrame::new(
            width,
            height,
            PixelFormat::Rgb24,
            Bytes::from(vec![(pts as u8).wrapping_mul(31); (width * height * 3) as usize]),
            pts,
            TimeBase::from_fps(30),
        )
        .unwrap()
    }
}
