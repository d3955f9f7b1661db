// image.rs — Runtime-sized single-channel image container.
//
// Every per-pixel grid in the crate lives in an `Image<T>`: intensity
// images, depth maps, cost maps and the three planes of a normal map.
// Storage is row-major and contiguous (stride == width), which is exactly
// the layout of a DMB payload plane and of a wgpu staging buffer row before
// alignment padding.
//
// Two samplers live here because both the rescaler and the host texture
// backend need them:
//
//   interpolate_bilinear   clamp-to-edge, pixel centres at integer coords.
//                          Used by resize_bilinear (linear-filter resize).
//   sample_texture         texture-unit semantics: unnormalised coordinates
//                          with texel centres at +0.5, wrap or clamp
//                          addressing, linear or nearest filtering. Used by
//                          the host backend so CPU and WGSL kernels agree.

use std::fmt;

/// A `width × height` grid of `T` in row-major order.
#[derive(Clone, PartialEq)]
pub struct Image<T> {
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Copy + Default> Image<T> {
    /// All pixels `T::default()`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, T::default())
    }
}

impl<T: Copy> Image<T> {
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// Wrap a row-major pixel vector.
    ///
    /// # Panics
    /// If `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "{width}x{height} image needs {} pixels, got {}",
            width * height,
            data.len(),
        );
        Image { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pixel at column `x`, row `y`. Panics outside the image.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[self.offset(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let i = self.offset(x, y);
        self.data[i] = value;
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} outside {} rows", self.height);
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    #[inline]
    fn offset(&self, x: usize, y: usize) -> usize {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for {}x{} image",
            self.width,
            self.height,
        );
        y * self.width + x
    }
}

// Dimensions plus the first few pixels; maps are far too large to print.
impl<T: fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.data[..self.data.len().min(8)];
        write!(f, "Image {}x{} {head:?}", self.width, self.height)?;
        if self.data.len() > head.len() {
            write!(f, " ...")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bilinear interpolation and resize
// ---------------------------------------------------------------------------

/// Bilinear interpolation with clamp-to-edge borders.
///
/// Integer coordinates address pixel centres, so `(0.0, 0.0)` returns the
/// top-left pixel exactly.
///
/// # Panics
/// Panics if the image is empty.
pub fn interpolate_bilinear(img: &Image<f32>, x: f32, y: f32) -> f32 {
    assert!(!img.is_empty(), "cannot interpolate on an empty image");

    let max_x = (img.width() - 1) as f32;
    let max_y = (img.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);

    let w = img.width();
    let d = img.as_slice();
    let p00 = d[y0 * w + x0];
    let p10 = d[y0 * w + x1];
    let p01 = d[y1 * w + x0];
    let p11 = d[y1 * w + x1];
    (1.0 - fx) * (1.0 - fy) * p00
        + fx * (1.0 - fy) * p10
        + (1.0 - fx) * fy * p01
        + fx * fy * p11
}

/// Resize with a linear filter.
///
/// Destination pixel centres are mapped back with the half-pixel
/// convention `src = (dst + 0.5) * (src_size / dst_size) - 0.5`, then
/// sampled with [`interpolate_bilinear`]. When the target size equals the
/// source size this is an exact copy.
pub fn resize_bilinear(src: &Image<f32>, width: usize, height: usize) -> Image<f32> {
    if src.dims() == (width, height) {
        return src.clone();
    }
    let mut dst = Image::new(width, height);
    if src.is_empty() || width == 0 || height == 0 {
        return dst;
    }

    let sx = src.width() as f32 / width as f32;
    let sy = src.height() as f32 / height as f32;
    for y in 0..height {
        let fy = (y as f32 + 0.5) * sy - 0.5;
        for x in 0..width {
            let fx = (x as f32 + 0.5) * sx - 0.5;
            dst.data[y * width + x] = interpolate_bilinear(src, fx, fy);
        }
    }
    dst
}

// ---------------------------------------------------------------------------
// Texture-unit sampling
// ---------------------------------------------------------------------------

/// Out-of-range addressing for [`sample_texture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// Coordinates wrap around (`i mod size`).
    Wrap,
    /// Coordinates clamp to the edge texel.
    Clamp,
}

/// Filtering for [`sample_texture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Linear,
    Nearest,
}

#[inline]
fn address(i: i64, size: usize, mode: AddressMode) -> usize {
    let n = size as i64;
    match mode {
        AddressMode::Wrap => i.rem_euclid(n) as usize,
        AddressMode::Clamp => i.clamp(0, n - 1) as usize,
    }
}

/// Sample `img` the way a texture unit does with unnormalised coordinates.
///
/// Texel `(i, j)` covers `[i, i+1) × [j, j+1)`; its centre is at
/// `(i + 0.5, j + 0.5)`. Linear filtering blends the four texels around
/// `(x - 0.5, y - 0.5)`.
///
/// # Panics
/// Panics if the image is empty.
pub fn sample_texture(
    img: &Image<f32>,
    x: f32,
    y: f32,
    address_mode: AddressMode,
    filter: FilterMode,
) -> f32 {
    assert!(!img.is_empty(), "cannot sample an empty texture");
    let (w, h) = img.dims();
    let d = img.as_slice();

    match filter {
        FilterMode::Nearest => {
            let i = address(x.floor() as i64, w, address_mode);
            let j = address(y.floor() as i64, h, address_mode);
            d[j * w + i]
        }
        FilterMode::Linear => {
            let xb = x - 0.5;
            let yb = y - 0.5;
            let i0 = xb.floor();
            let j0 = yb.floor();
            let a = xb - i0;
            let b = yb - j0;
            let (i0, j0) = (i0 as i64, j0 as i64);

            let x0 = address(i0, w, address_mode);
            let x1 = address(i0 + 1, w, address_mode);
            let y0 = address(j0, h, address_mode);
            let y1 = address(j0 + 1, h, address_mode);

            (1.0 - a) * (1.0 - b) * d[y0 * w + x0]
                + a * (1.0 - b) * d[y0 * w + x1]
                + (1.0 - a) * b * d[y1 * w + x0]
                + a * b * d[y1 * w + x1]
        }
    }
}
