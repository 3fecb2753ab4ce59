//! Host-side input frames.

use crate::{Error, Result};

/// An RGBA8 image frame on the host, ready for upload to the GPU.
///
/// This is the input type of the detection pipeline; an image source is
/// expected to produce one of these per tick. Conversions from the [`image`]
/// crate's buffer types are provided.
#[derive(Clone)]
pub struct ImageFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ImageFrame {
    /// Creates a frame from raw RGBA8 pixel data in row-major order.
    ///
    /// Fails with [`Error::InvalidInput`] if `data` does not contain exactly
    /// `width * height * 4` bytes.
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(Error::InvalidInput(format!(
                "frame data is {} bytes, expected {expected} for {width}x{height} RGBA",
                data.len(),
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA8 pixel data, `width * height * 4` bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl From<image::RgbaImage> for ImageFrame {
    fn from(img: image::RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }
}

impl From<image::DynamicImage> for ImageFrame {
    fn from(img: image::DynamicImage) -> Self {
        img.to_rgba8().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_data_length() {
        assert!(ImageFrame::from_rgba8(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(
            ImageFrame::from_rgba8(2, 2, vec![0; 15]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn zero_sized_frames_are_constructible() {
        // Degenerate frames are representable; the pipeline rejects them at
        // process time, before any GPU work is dispatched.
        let frame = ImageFrame::from_rgba8(0, 4, Vec::new()).unwrap();
        assert_eq!(frame.width(), 0);
    }
}
