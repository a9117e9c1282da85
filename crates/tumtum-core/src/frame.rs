use std::sync::Arc;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("buffer of {len} bytes does not hold a {width}x{height} RGB frame")]
    BadBuffer { len: usize, width: u32, height: u32 },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// One decoded RGB video frame.
///
/// Pixel data sits behind an `Arc` so the same frame can be handed to a
/// detection worker and to the backend uploader without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    /// Position of the frame in its stream, relative to stream start.
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: Duration) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
        }
    }

    /// Wrap a tightly packed RGB24 buffer as delivered by a capture sink.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: Duration,
    ) -> Result<Self, FrameError> {
        let len = data.len();
        let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::BadBuffer {
            len,
            width,
            height,
        })?;
        Ok(Self::new(image, timestamp))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Re-encode the frame as JPEG for upload.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        self.image
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)))?;
        Ok(buf)
    }

    /// Lossless encoding, used when handing frames to external detectors.
    pub fn to_png(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        self.image.write_with_encoder(PngEncoder::new(&mut buf))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_rejects_short_buffer() {
        let err = Frame::from_rgb(vec![0; 10], 4, 4, Duration::ZERO).unwrap_err();
        assert!(matches!(err, FrameError::BadBuffer { len: 10, .. }));
    }

    #[test]
    fn test_jpeg_magic_bytes() {
        let frame = Frame::from_rgb(vec![128; 16 * 16 * 3], 16, 16, Duration::ZERO).unwrap();
        let jpeg = frame.to_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_png_magic_bytes() {
        let frame = Frame::from_rgb(vec![0; 8 * 8 * 3], 8, 8, Duration::ZERO).unwrap();
        let png = frame.to_png().unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn test_clone_shares_pixels() {
        let frame = Frame::from_rgb(vec![0; 4 * 4 * 3], 4, 4, Duration::from_millis(33)).unwrap();
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.image, &copy.image));
        assert_eq!(copy.timestamp, Duration::from_millis(33));
    }
}
