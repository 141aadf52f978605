//! Frame encoders.
//!
//! Two encode paths leave the canonical RGB domain: JPEG stills for
//! analysis submissions, and H.264 for the outbound peer track.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;

use crate::error::{Error, Result};
use crate::media::frame::{PixelFormat, VideoFrame};

/// Encode a canonical RGB frame as a JPEG still
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Vec<u8>> {
    if frame.format != PixelFormat::Rgb24 {
        return Err(Error::Encoding(format!(
            "JPEG encoder expects RGB24 input, got {:?}",
            frame.format
        )));
    }

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(
            &frame.data,
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| Error::Encoding(format!("JPEG encoding failed: {}", e)))?;
    Ok(out)
}

/// One H.264 access unit in Annex B format
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// RGB24 to H.264 encoder for a fixed frame geometry.
///
/// Dimensions must be even; 4:2:0 chroma subsampling works on 2x2 pixel
/// blocks. An IDR frame is forced every `keyframe_interval` frames so
/// receivers joining mid-stream can start decoding without waiting for
/// the encoder's own refresh cycle.
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    keyframe_interval: u64,
    frame_count: u64,
}

impl H264Encoder {
    pub fn new(width: u32, height: u32, keyframe_interval: u64) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(Error::Encoding(format!(
                "H.264 encoding requires even, non-zero dimensions, got {}x{}",
                width, height
            )));
        }

        let encoder = Encoder::new()
            .map_err(|e| Error::Encoding(format!("Failed to create H.264 encoder: {}", e)))?;

        Ok(Self {
            encoder,
            width,
            height,
            keyframe_interval,
            frame_count: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Encode one frame. Input must be RGB24 at the encoder's geometry.
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame> {
        if frame.format != PixelFormat::Rgb24 {
            return Err(Error::Encoding(format!(
                "H.264 encoder expects RGB24 input, got {:?}",
                frame.format
            )));
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(Error::Encoding(format!(
                "Frame size {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        if self.keyframe_interval > 0
            && self.frame_count > 0
            && self.frame_count % self.keyframe_interval == 0
        {
            self.encoder.force_intra_frame();
        }

        let yuv = YUVBuffer::from_vec(
            rgb_to_yuv420(&frame.data, self.width, self.height),
            self.width as usize,
            self.height as usize,
        );

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| Error::Encoding(format!("H.264 encoding failed: {}", e)))?;
        self.frame_count += 1;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);

        Ok(EncodedFrame {
            data: Bytes::from(bitstream.to_vec()),
            is_keyframe,
        })
    }
}

/// Convert packed RGB24 to planar YUV 4:2:0 using BT.601 coefficients
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for row in 0..h {
        for col in 0..w {
            let idx = (row * w + col) * 3;
            let r = rgb[idx] as i32;
            let g = rgb[idx + 1] as i32;
            let b = rgb[idx + 2] as i32;

            let luma = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[row * w + col] = luma.clamp(0, 255) as u8;

            // Chroma sampled once per 2x2 block
            if row % 2 == 0 && col % 2 == 0 {
                let uv_idx = (row / 2) * (w / 2) + (col / 2);
                let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u.clamp(0, 255) as u8;
                v_plane[uv_idx] = v.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::TimeBase;

    fn rgb_frame(width: u32, height: u32, value: u8) -> VideoFrame {
        VideoFrame::new(
            width,
            height,
            PixelFormat::Rgb24,
            Bytes::from(vec![value; (width * height * 3) as usize]),
            0,
            TimeBase::from_fps(30),
        )
        .unwrap()
    }

    #[test]
    fn test_yuv420_plane_sizes() {
        let rgb = vec![128u8; 64 * 48 * 3];
        let yuv = rgb_to_yuv420(&rgb, 64, 48);
        assert_eq!(yuv.len(), 64 * 48 * 3 / 2);
    }

    #[test]
    fn test_encoder_rejects_odd_dimensions() {
        assert!(H264Encoder::new(641, 480, 60).is_err());
        assert!(H264Encoder::new(640, 481, 60).is_err());
        assert!(H264Encoder::new(0, 0, 60).is_err());
    }

    #[test]
    fn test_encode_produces_annex_b_keyframe() {
        let mut encoder = H264Encoder::new(64, 48, 60).unwrap();
        let encoded = encoder.encode(&rgb_frame(64, 48, 128)).unwrap();

        assert!(!encoded.data.is_empty());
        assert!(
            encoded.data.starts_with(&[0x00, 0x00, 0x00, 0x01])
                || encoded.data.starts_with(&[0x00, 0x00, 0x01])
        );
        // The stream must open with a decodable frame
        assert!(encoded.is_keyframe);
    }

    #[test]
    fn test_encode_rejects_size_mismatch() {
        let mut encoder = H264Encoder::new(64, 48, 60).unwrap();
        let err = encoder.encode(&rgb_frame(32, 32, 0)).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_jpeg_round_trip_geometry() {
        let jpeg = encode_jpeg(&rgb_frame(64, 48, 200), 85).unwrap();
        assert!(jpeg.starts_with(&[0xFF, 0xD8]));

        let decoded =
            image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }

    #[test]
    fn test_jpeg_rejects_non_rgb_input() {
        let frame = VideoFrame::new(
            4,
            4,
            PixelFormat::Yuv420p,
            Bytes::from(vec![0u8; 24]),
            0,
            TimeBase::from_fps(30),
        )
        .unwrap();
        assert!(encode_jpeg(&frame, 85).is_err());
    }
}
