use anyhow::{bail, Result};
use ndarray::Array4;

/// Bytes per pixel in an interleaved RGBA buffer.
pub const CHANNELS: usize = 4;

/// Interleaved RGBA8 image, row-major.
///
/// Owns its bytes; sending one across the worker boundary moves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            bail!(
                "pixel buffer length mismatch: expected {} ({}x{}x{}), got {}",
                expected,
                width,
                height,
                CHANNELS,
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Fully transparent black buffer.
    pub fn zeroed(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * CHANNELS],
        }
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut buffer = Self::zeroed(width, height);
        for pixel in buffer.data.chunks_exact_mut(CHANNELS) {
            pixel.copy_from_slice(&rgba);
        }
        buffer
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

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Byte length of one row.
    pub fn stride(&self) -> usize {
        self.width as usize * CHANNELS
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ])
    }
}

/// Planar `[1, 3, H, W]` f32 tensor with values normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarTensor {
    data: Array4<f32>,
}

impl PlanarTensor {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            data: Array4::<f32>::zeros((1, 3, height as usize, width as usize)),
        }
    }

    /// Wrap an NCHW array, normalizing its memory layout to C order.
    pub fn from_array(data: Array4<f32>) -> Result<Self> {
        let shape = data.shape();
        if shape[0] != 1 || shape[1] != 3 {
            bail!(
                "planar tensor must have shape [1, 3, H, W], got {:?}",
                shape
            );
        }
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Ok(Self { data })
    }

    pub fn width(&self) -> u32 {
        self.data.shape()[3] as u32
    }

    pub fn height(&self) -> u32 {
        self.data.shape()[2] as u32
    }

    pub fn array(&self) -> &Array4<f32> {
        &self.data
    }

    pub(crate) fn array_mut(&mut self) -> &mut Array4<f32> {
        &mut self.data
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }
}

/// A rectangle of a source image together with its pixels.
///
/// `x`, `y`, `width` and `height` always describe the region in the source
/// image. Tiles streamed by the super-resolution stage carry the upscaled
/// rendition of that region in `buffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub buffer: PixelBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_rejects_bad_length() {
        let err = PixelBuffer::new(2, 2, vec![0u8; 15]).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
        assert!(PixelBuffer::new(2, 2, vec![0u8; 16]).is_ok());
    }

    #[test]
    fn test_pixel_lookup() {
        let mut data = vec![0u8; 2 * 2 * 4];
        data[12..16].copy_from_slice(&[1, 2, 3, 4]);
        let buffer = PixelBuffer::new(2, 2, data).unwrap();
        assert_eq!(buffer.pixel(1, 1), Some([1, 2, 3, 4]));
        assert_eq!(buffer.pixel(0, 0), Some([0, 0, 0, 0]));
        assert_eq!(buffer.pixel(2, 0), None);
        assert_eq!(buffer.stride(), 8);
    }

    #[test]
    fn test_filled_buffer() {
        let buffer = PixelBuffer::filled(3, 1, [9, 8, 7, 255]);
        assert_eq!(buffer.data(), &[9, 8, 7, 255, 9, 8, 7, 255, 9, 8, 7, 255]);
    }

    #[test]
    fn test_planar_tensor_shape_checks() {
        let tensor = PlanarTensor::zeros(5, 3);
        assert_eq!(tensor.width(), 5);
        assert_eq!(tensor.height(), 3);
        assert_eq!(tensor.array().len(), 3 * 5 * 3);

        let bad = Array4::<f32>::zeros((1, 4, 2, 2));
        assert!(PlanarTensor::from_array(bad).is_err());
    }

    #[test]
    fn test_planar_tensor_normalizes_layout() {
        let arr = Array4::<f32>::zeros((1, 3, 2, 4));
        let transposed = arr.permuted_axes([0, 1, 3, 2]);
        assert!(!transposed.is_standard_layout());
        let tensor = PlanarTensor::from_array(transposed).unwrap();
        assert!(tensor.array().is_standard_layout());
        assert_eq!(tensor.width(), 2);
        assert_eq!(tensor.height(), 4);
    }
}
