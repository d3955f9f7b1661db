// preview.rs — 8-bit previews of result maps.
//
// Quick-look renderings for inspecting a pass without a viewer that
// understands DMB:
//
//   normals  n / |n| × 127 + 127 per channel         → RGB
//   costs    NaN → finite max, then c / 3 × 255       → gray
//   depths   standardise over the valid range, then
//            255 / (1 + exp(-8 · 0.333 · z))          → gray
//
// Float-to-byte conversion truncates and saturates.

use std::path::Path;

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

use crate::dmb::NormalMap;
use crate::error::{DataError, Result};
use crate::image::Image;

#[inline]
fn to_u8(v: f32) -> u8 {
    // `as` saturates and maps NaN to 0.
    v as u8
}

/// Render unit normals as RGB. Zero-length normals come out as (127,127,127).
pub fn normal_preview(normals: &NormalMap) -> RgbImage {
    let (w, h) = normals.dims();
    ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
        let [nx, ny, nz] = normals.get(x as usize, y as usize);
        let len2 = nx * nx + ny * ny + nz * nz;
        let len = if len2 == 0.0 { 1.0 } else { len2.sqrt() };
        Rgb([
            to_u8(nx / len * 127.0 + 127.0),
            to_u8(ny / len * 127.0 + 127.0),
            to_u8(nz / len * 127.0 + 127.0),
        ])
    })
}

/// Render matching costs (0..3) as gray, NaN shown as the worst cost.
pub fn cost_preview(cost: &Image<f32>) -> GrayImage {
    let upper = cost
        .as_slice()
        .iter()
        .copied()
        .filter(|c| !c.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    let upper = if upper.is_finite() { upper } else { 0.0 };

    ImageBuffer::from_fn(cost.width() as u32, cost.height() as u32, |x, y| {
        let c = cost.get(x as usize, y as usize);
        let c = if c.is_nan() { upper } else { c };
        Luma([to_u8(c / 3.0 * 255.0)])
    })
}

/// Render depths with adaptive contrast.
///
/// Depths below `depth_range.0` (and NaN) become 0, depths above
/// `depth_range.1` saturate to it. Mean and standard deviation are taken
/// over the depths strictly inside the range.
pub fn depth_preview(depth: &Image<f32>, depth_range: (f32, f32)) -> GrayImage {
    let (lo, hi) = depth_range;
    let clamped: Vec<f32> = depth
        .as_slice()
        .iter()
        .map(|&d| {
            if d.is_nan() || d < lo {
                0.0
            } else if d > hi {
                hi
            } else {
                d
            }
        })
        .collect();

    let valid: Vec<f64> = depth
        .as_slice()
        .iter()
        .filter(|&&d| !d.is_nan() && d >= lo && d <= hi)
        .map(|&d| d as f64)
        .collect();
    let (mean, std) = mean_std(&valid);

    let w = depth.width();
    ImageBuffer::from_fn(w as u32, depth.height() as u32, |x, y| {
        let d = clamped[y as usize * w + x as usize] as f64;
        let z = if std > 0.0 { (d - mean) / std * 0.333 } else { 0.0 };
        Luma([to_u8((255.0 / ((-8.0 * z).exp() + 1.0)) as f32)])
    })
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Save a preview; the format follows the file extension.
pub fn save_preview(path: &Path, preview: DynamicImage) -> Result<()> {
    preview.save(path).map_err(|e| match e {
        image::ImageError::IoError(io) => DataError::io(path, io),
        other => DataError::ImageEncode {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    })?;
    log::debug!("preview written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_preview_axes() {
        let mut n = NormalMap::new(2, 1);
        n.set(0, 0, [0.0, 0.0, -2.0]);
        n.set(1, 0, [0.0, 0.0, 0.0]);
        let img = normal_preview(&n);
        assert_eq!(img.get_pixel(0, 0).0, [127, 127, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [127, 127, 127]);
    }

    #[test]
    fn test_cost_preview_nan_uses_max() {
        let cost = Image::from_vec(3, 1, vec![0.0f32, 1.5, f32::NAN]);
        let img = cost_preview(&cost);
        assert_eq!(img.get_pixel(0, 0).0, [0]);
        assert_eq!(img.get_pixel(1, 0).0, [127]);
        assert_eq!(img.get_pixel(2, 0).0, [127]);
    }

    #[test]
    fn test_depth_preview_is_monotonic() {
        let depth = Image::from_vec(4, 1, vec![1.0f32, 2.0, 3.0, 4.0]);
        let img = depth_preview(&depth, (0.5, 10.0));
        let v: Vec<u8> = (0..4).map(|x| img.get_pixel(x, 0).0[0]).collect();
        assert!(v.windows(2).all(|p| p[0] < p[1]), "{v:?}");
    }

    #[test]
    fn test_depth_preview_out_of_range() {
        // Below range → 0 before standardisation, i.e. darker than any valid depth.
        let depth = Image::from_vec(3, 1, vec![0.1f32, 5.0, 6.0]);
        let img = depth_preview(&depth, (1.0, 10.0));
        assert!(img.get_pixel(0, 0).0[0] < img.get_pixel(1, 0).0[0]);
    }

    #[test]
    fn test_save_preview_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost.png");
        let cost = Image::filled(4, 4, 1.0f32);
        save_preview(&path, DynamicImage::ImageLuma8(cost_preview(&cost))).unwrap();
        assert!(path.exists());
    }
}
