use bytes::Bytes;
use serde::Serialize;

use super::error::{MediaError, MediaResult};

/// Properties of a decoded video stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Number of frames, when the container can tell without decoding.
    pub frame_count: Option<u64>,
}

/// Largest width or height accepted from a stream.
pub const MAX_DIMENSION: u32 = 16_384;

impl StreamInfo {
    /// Byte length of one frame of this stream. Fails for empty or oversized geometry.
    pub fn frame_len(&self) -> MediaResult<usize> {
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
            return Err(MediaError::InvalidHeader(format!(
                "frame size {}x{} outside 1..={}",
                w, h, MAX_DIMENSION
            )));
        }
        Frame::i420_len(w, h).ok_or_else(|| MediaError::InvalidHeader(format!("frame size {}x{} overflows", w, h)))
    }
}

/// One planar 8-bit YUV 4:2:0 picture: the full luma plane followed by the
/// two quarter-size chroma planes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> MediaResult<Self> {
        let data = data.into();
        let expected = Self::i420_len(width, height)
            .ok_or_else(|| MediaError::InvalidHeader(format!("frame size {}x{} overflows", width, height)))?;
        if data.len() != expected {
            return Err(MediaError::FrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    /// A frame with every luma sample set to `luma` and neutral chroma.
    #[cfg(test)]
    pub fn filled(width: u32, height: u32, luma: u8) -> Self {
        let luma_len = width as usize * height as usize;
        let mut data = vec![128u8; Self::i420_len(width, height).expect("small test frame")];
        data[..luma_len].fill(luma);
        Self {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    pub fn i420_len(width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let chroma = cw.checked_mul(ch)?.checked_mul(2)?;
        w.checked_mul(h)?.checked_add(chroma)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn luma(&self) -> &[u8] {
        &self.data[..self.width as usize * self.height as usize]
    }

    pub fn same_geometry(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }
}
