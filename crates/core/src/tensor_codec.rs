//! Conversions between interleaved RGBA8 pixels and planar `[1,3,H,W]` f32 tensors.

use anyhow::{bail, Context, Result};

use crate::types::{PixelBuffer, PlanarTensor, CHANNELS};

/// Interleaved RGBA8 → planar RGB f32 in `[0, 1]`. Alpha is dropped.
pub fn to_tensor(buffer: &PixelBuffer) -> Result<PlanarTensor> {
    let w = buffer.width() as usize;
    let h = buffer.height() as usize;
    let hw = w * h;

    let mut tensor = PlanarTensor::zeros(buffer.width(), buffer.height());
    let src = buffer.data();
    let planes = tensor
        .array_mut()
        .as_slice_mut()
        .context("planar tensor is not contiguous")?;

    let (r_plane, rest) = planes.split_at_mut(hw);
    let (g_plane, b_plane) = rest.split_at_mut(hw);

    for (i, pixel) in src.chunks_exact(CHANNELS).enumerate() {
        r_plane[i] = pixel[0] as f32 / 255.0;
        g_plane[i] = pixel[1] as f32 / 255.0;
        b_plane[i] = pixel[2] as f32 / 255.0;
    }

    Ok(tensor)
}

/// Planar RGB f32 → interleaved RGBA8 with opaque alpha.
///
/// Values are scaled by 255, rounded and clamped, so `from_tensor(to_tensor(p))`
/// reproduces `p`'s colour channels exactly.
pub fn from_tensor(tensor: &PlanarTensor, width: u32, height: u32) -> Result<PixelBuffer> {
    if tensor.width() != width || tensor.height() != height {
        bail!(
            "tensor is {}x{}, cannot decode as {}x{}",
            tensor.width(),
            tensor.height(),
            width,
            height
        );
    }

    let hw = width as usize * height as usize;
    let planes = tensor
        .array()
        .as_slice()
        .context("planar tensor is not contiguous")?;

    let r_plane = &planes[..hw];
    let g_plane = &planes[hw..2 * hw];
    let b_plane = &planes[2 * hw..3 * hw];

    let mut rgba = vec![0u8; hw * CHANNELS];
    for (i, pixel) in rgba.chunks_exact_mut(CHANNELS).enumerate() {
        pixel[0] = quantize(r_plane[i]);
        pixel[1] = quantize(g_plane[i]);
        pixel[2] = quantize(b_plane[i]);
        pixel[3] = 255;
    }

    PixelBuffer::new(width, height, rgba)
}

// NaN saturates to 0 through the `as` cast.
fn quantize(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> PixelBuffer {
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for i in 0..(width * height) {
            data.push((i * 7 % 256) as u8);
            data.push((i * 13 % 256) as u8);
            data.push((255 - i % 256) as u8);
            data.push((i * 3 % 256) as u8);
        }
        PixelBuffer::new(width, height, data).unwrap()
    }

    #[test]
    fn test_to_tensor_splits_planes() {
        let data = vec![
            255, 0, 0, 10, //
            0, 255, 0, 20, //
            0, 0, 255, 30, //
            128, 128, 128, 40,
        ];
        let buffer = PixelBuffer::new(2, 2, data).unwrap();
        let tensor = to_tensor(&buffer).unwrap();
        let arr = tensor.array();

        assert_eq!(arr.shape(), &[1, 3, 2, 2]);
        assert_eq!(arr[[0, 0, 0, 0]], 1.0);
        assert_eq!(arr[[0, 1, 0, 0]], 0.0);
        assert_eq!(arr[[0, 1, 0, 1]], 1.0);
        assert_eq!(arr[[0, 2, 1, 0]], 1.0);
        assert!((arr[[0, 0, 1, 1]] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_tensor_sets_opaque_alpha_and_clamps() {
        let mut tensor = PlanarTensor::zeros(1, 1);
        tensor.array_mut()[[0, 0, 0, 0]] = 1.7;
        tensor.array_mut()[[0, 1, 0, 0]] = -0.3;
        tensor.array_mut()[[0, 2, 0, 0]] = 0.5;

        let buffer = from_tensor(&tensor, 1, 1).unwrap();
        assert_eq!(buffer.data(), &[255, 0, 128, 255]);
    }

    #[test]
    fn test_from_tensor_rejects_dimension_mismatch() {
        let tensor = PlanarTensor::zeros(4, 2);
        let err = from_tensor(&tensor, 2, 4).unwrap_err();
        assert!(err.to_string().contains("cannot decode"));
    }

    #[test]
    fn test_roundtrip_within_one_level() {
        let original = gradient(17, 9);
        let restored = from_tensor(&to_tensor(&original).unwrap(), 17, 9).unwrap();

        for (i, (a, b)) in original
            .data()
            .chunks_exact(4)
            .zip(restored.data().chunks_exact(4))
            .enumerate()
        {
            for c in 0..3 {
                let diff = (a[c] as i16 - b[c] as i16).unsigned_abs();
                assert!(diff <= 1, "pixel {i} channel {c}: {} vs {}", a[c], b[c]);
            }
            assert_eq!(b[3], 255);
        }
    }

    #[test]
    fn test_nan_decodes_to_zero() {
        let mut tensor = PlanarTensor::zeros(1, 1);
        tensor.array_mut()[[0, 0, 0, 0]] = f32::NAN;
        let buffer = from_tensor(&tensor, 1, 1).unwrap();
        assert_eq!(buffer.data()[0], 0);
    }
}
