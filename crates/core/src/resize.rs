//! Bilinear resampling of RGBA8 buffers.

use anyhow::{bail, Result};

use crate::types::{PixelBuffer, CHANNELS};

/// Resize `src` to exactly `dst_w`×`dst_h`. Aspect ratio is not preserved.
pub fn resize(src: &PixelBuffer, dst_w: u32, dst_h: u32) -> Result<PixelBuffer> {
    if dst_w == 0 || dst_h == 0 {
        bail!("resize target must be non-empty, got {dst_w}x{dst_h}");
    }
    if src.width() == 0 || src.height() == 0 {
        bail!(
            "cannot resize an empty {}x{} buffer",
            src.width(),
            src.height()
        );
    }
    if src.width() == dst_w && src.height() == dst_h {
        return Ok(src.clone());
    }

    let data = resize_bilinear(
        src.data(),
        src.width() as usize,
        src.height() as usize,
        dst_w as usize,
        dst_h as usize,
    );
    PixelBuffer::new(dst_w, dst_h, data)
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * CHANNELS];

    let x_taps: Vec<(usize, usize, f64)> = (0..dst_w)
        .map(|dst_x| source_taps(dst_x, src_w, dst_w))
        .collect();

    for dst_y in 0..dst_h {
        let (src_y0, src_y1, fy) = source_taps(dst_y, src_h, dst_h);
        let row0 = src_y0 * src_w;
        let row1 = src_y1 * src_w;

        for (dst_x, &(src_x0, src_x1, fx)) in x_taps.iter().enumerate() {
            let di = (dst_y * dst_w + dst_x) * CHANNELS;

            for c in 0..CHANNELS {
                let p00 = src[(row0 + src_x0) * CHANNELS + c] as f64;
                let p10 = src[(row0 + src_x1) * CHANNELS + c] as f64;
                let p01 = src[(row1 + src_x0) * CHANNELS + c] as f64;
                let p11 = src[(row1 + src_x1) * CHANNELS + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

/// Map a destination index to its two source neighbours and the blend weight,
/// aligning pixel centres.
fn source_taps(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f64) {
    let pos = (dst as f64 + 0.5) * src_len as f64 / dst_len as f64 - 0.5;
    let i0 = (pos.floor().max(0.0) as usize).min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    let frac = (pos - i0 as f64).clamp(0.0, 1.0);
    (i0, i1, frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_color_survives_any_resize() {
        let src = PixelBuffer::filled(7, 5, [10, 200, 30, 255]);
        for (w, h) in [(1, 1), (3, 2), (14, 10), (512, 512), (5, 7)] {
            let out = resize(&src, w, h).unwrap();
            assert_eq!(out.width(), w);
            assert_eq!(out.height(), h);
            assert!(out
                .data()
                .chunks_exact(4)
                .all(|p| p == [10, 200, 30, 255]));
        }
    }

    #[test]
    fn test_same_size_is_identity() {
        let data: Vec<u8> = (0..(3 * 3 * 4)).map(|v| v as u8).collect();
        let src = PixelBuffer::new(3, 3, data).unwrap();
        assert_eq!(resize(&src, 3, 3).unwrap(), src);
    }

    #[test]
    fn test_upscale_interpolates_between_pixels() {
        let src = PixelBuffer::new(2, 1, vec![0, 0, 0, 255, 200, 200, 200, 255]).unwrap();
        let out = resize(&src, 4, 1).unwrap();
        let reds: Vec<u8> = out.data().chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(reds[0], 0);
        assert_eq!(reds[3], 200);
        assert!(reds[1] > 0 && reds[1] < reds[2] && reds[2] < 200);
    }

    #[test]
    fn test_downscale_averages_neighbours() {
        let src = PixelBuffer::new(2, 1, vec![0, 0, 0, 0, 100, 100, 100, 100]).unwrap();
        let out = resize(&src, 1, 1).unwrap();
        assert_eq!(out.data(), &[50, 50, 50, 50]);
    }

    #[test]
    fn test_alpha_is_resampled() {
        let src = PixelBuffer::new(1, 2, vec![0, 0, 0, 0, 0, 0, 0, 255]).unwrap();
        let out = resize(&src, 1, 4).unwrap();
        let alpha: Vec<u8> = out.data().chunks_exact(4).map(|p| p[3]).collect();
        assert_eq!(alpha.first(), Some(&0));
        assert_eq!(alpha.last(), Some(&255));
    }

    #[test]
    fn test_rejects_empty_target() {
        let src = PixelBuffer::filled(2, 2, [0, 0, 0, 255]);
        assert!(resize(&src, 0, 2).is_err());
        assert!(resize(&src, 2, 0).is_err());
    }
}
