// camera.rs — Pinhole camera with extrinsics and a depth search range.
//
// Handles:
// - Parsing the per-image camera text file (`<id>_cam.txt`)
// - Rescaling an image together with its intrinsics
// - Pixel <-> world transforms (back-projection, projection)
// - Small geometric helpers: ray angle, disparity
//
// Conventions: `R` and `K` are stored row-major as `[f32; 9]`. The world →
// camera transform is `X_cam = R·X_world + t`, so the camera centre is
// `C = -Rᵗt`.
//
// The camera file layout is whitespace-delimited:
//
// ```text
// extrinsic
// r00 r01 r02 t0
// r10 r11 r12 t1
// r20 r21 r22 t2
// 0 0 0 1
//
// intrinsic
// fx 0 cx
// 0 fy cy
// 0 0 1
//
// depth_min depth_interval depth_num depth_max
// ```
//
// We tokenise it by hand; the format is fixed-order and has no nesting.

use std::fs;
use std::path::Path;

use crate::error::{DataError, MvsError, Result};
use crate::image::{resize_bilinear, Image};

/// Camera intrinsics, extrinsics, depth range and image size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Intrinsics, row-major.
    pub k: [f32; 9],
    /// World → camera rotation, row-major.
    pub r: [f32; 9],
    /// World → camera translation.
    pub t: [f32; 3],
    pub depth_min: f32,
    pub depth_max: f32,
    pub width: usize,
    pub height: usize,
}

impl Camera {
    /// Identity extrinsics with the given intrinsics and depth range.
    pub fn with_intrinsics(k: [f32; 9], width: usize, height: usize, depth_min: f32, depth_max: f32) -> Self {
        Camera {
            k,
            r: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            t: [0.0; 3],
            depth_min,
            depth_max,
            width,
            height,
        }
    }

    /// Parse the camera text format described in the module header.
    ///
    /// `width`/`height` are left at zero; the caller fills them from the
    /// image the camera belongs to.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = Tokens::new(text);

        tokens.word("extrinsic header")?;
        let mut r = [0.0f32; 9];
        let mut t = [0.0f32; 3];
        for row in 0..3 {
            for col in 0..3 {
                r[row * 3 + col] = tokens.number("rotation")?;
            }
            t[row] = tokens.number("translation")?;
        }
        for _ in 0..4 {
            tokens.number("homogeneous row")?;
        }

        tokens.word("intrinsic header")?;
        let mut k = [0.0f32; 9];
        for v in k.iter_mut() {
            *v = tokens.number("intrinsics")?;
        }

        let depth_min = tokens.number("depth_min")?;
        let _interval = tokens.number("depth_interval")?;
        let _samples = tokens.number("depth_num")?;
        let depth_max = tokens.number("depth_max")?;

        Ok(Camera {
            k,
            r,
            t,
            depth_min,
            depth_max,
            width: 0,
            height: 0,
        })
    }

    /// Read and parse a camera file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
        match Camera::parse(&text) {
            Err(MvsError::Recoverable(DataError::MalformedCamera(msg))) => {
                Err(DataError::MalformedCamera(format!("{}: {msg}", path.display())).into())
            }
            other => other,
        }
    }

    #[inline]
    pub fn fx(&self) -> f32 {
        self.k[0]
    }

    #[inline]
    pub fn fy(&self) -> f32 {
        self.k[4]
    }

    #[inline]
    pub fn cx(&self) -> f32 {
        self.k[2]
    }

    #[inline]
    pub fn cy(&self) -> f32 {
        self.k[5]
    }

    /// Camera centre in world coordinates, `C = -Rᵗt`.
    pub fn center(&self) -> [f32; 3] {
        let r = &self.r;
        let t = &self.t;
        [
            -(r[0] * t[0] + r[3] * t[1] + r[6] * t[2]),
            -(r[1] * t[0] + r[4] * t[1] + r[7] * t[2]),
            -(r[2] * t[0] + r[5] * t[1] + r[8] * t[2]),
        ]
    }
}

/// Whitespace tokenizer with labelled errors.
struct Tokens<'a> {
    iter: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Tokens { iter: text.split_whitespace() }
    }

    fn word(&mut self, what: &str) -> Result<&'a str> {
        self.iter
            .next()
            .ok_or_else(|| DataError::MalformedCamera(format!("unexpected end of input reading {what}")).into())
    }

    fn number(&mut self, what: &str) -> Result<f32> {
        let tok = self.word(what)?;
        tok.parse::<f32>()
            .map_err(|_| DataError::MalformedCamera(format!("{what}: '{tok}' is not a number")).into())
    }
}

// ---------------------------------------------------------------------------
// Rescaling
// ---------------------------------------------------------------------------

/// Resize `src` to `target = (width, height)` and scale the camera to match.
///
/// Equal dimensions return a copy and the camera unchanged (apart from
/// `width`/`height`, which are set to the image size). Otherwise `fx`, `cx`
/// are scaled by the column ratio and `fy`, `cy` by the row ratio.
pub fn rescale_image_and_camera(
    src: &Image<f32>,
    target: (usize, usize),
    camera: &Camera,
) -> (Image<f32>, Camera) {
    let (src_w, src_h) = src.dims();
    let mut cam = *camera;
    if target == (src_w, src_h) {
        cam.width = src_w;
        cam.height = src_h;
        return (src.clone(), cam);
    }

    let (dst_w, dst_h) = target;
    let scale_x = dst_w as f32 / src_w as f32;
    let scale_y = dst_h as f32 / src_h as f32;
    cam.k[0] *= scale_x;
    cam.k[2] *= scale_x;
    cam.k[4] *= scale_y;
    cam.k[5] *= scale_y;
    cam.width = dst_w;
    cam.height = dst_h;

    (resize_bilinear(src, dst_w, dst_h), cam)
}

/// Target size that fits `(width, height)` inside a `max_size` square with
/// the aspect ratio preserved, or `None` if it already fits.
pub fn fit_within(max_size: usize, width: usize, height: usize) -> Option<(usize, usize)> {
    if width <= max_size && height <= max_size {
        return None;
    }
    let factor_x = max_size as f32 / width as f32;
    let factor_y = max_size as f32 / height as f32;
    let factor = factor_x.min(factor_y);
    let w = ((width as f32 * factor).round() as usize).max(1);
    let h = ((height as f32 * factor).round() as usize).max(1);
    Some((w, h))
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Pixel `(x, y)` at `depth` → camera-space point.
#[inline]
pub fn pixel_to_camera(x: f32, y: f32, depth: f32, camera: &Camera) -> [f32; 3] {
    [
        depth * (x - camera.k[2]) / camera.k[0],
        depth * (y - camera.k[5]) / camera.k[4],
        depth,
    ]
}

/// Pixel `(x, y)` at `depth` → world-space point.
pub fn back_project(x: f32, y: f32, depth: f32, camera: &Camera) -> [f32; 3] {
    let p = pixel_to_camera(x, y, depth, camera);
    let r = &camera.r;
    let c = camera.center();
    [
        r[0] * p[0] + r[3] * p[1] + r[6] * p[2] + c[0],
        r[1] * p[0] + r[4] * p[1] + r[7] * p[2] + c[1],
        r[2] * p[0] + r[5] * p[1] + r[8] * p[2] + c[2],
    ]
}

/// World-space point → `(pixel, depth)`.
///
/// Returns [`DataError::DegenerateDepth`] when the point lies on the
/// camera's principal plane.
pub fn project(point: [f32; 3], camera: &Camera) -> Result<([f32; 2], f32)> {
    let r = &camera.r;
    let t = &camera.t;
    let cam = [
        r[0] * point[0] + r[1] * point[1] + r[2] * point[2] + t[0],
        r[3] * point[0] + r[4] * point[1] + r[5] * point[2] + t[1],
        r[6] * point[0] + r[7] * point[1] + r[8] * point[2] + t[2],
    ];
    let k = &camera.k;
    let u = k[0] * cam[0] + k[1] * cam[1] + k[2] * cam[2];
    let v = k[3] * cam[0] + k[4] * cam[1] + k[5] * cam[2];
    let depth = k[6] * cam[0] + k[7] * cam[1] + k[8] * cam[2];
    if depth == 0.0 {
        return Err(DataError::DegenerateDepth.into());
    }
    Ok(([u / depth, v / depth], depth))
}

/// Angle in radians between two unit vectors. Never NaN.
pub fn angle(v1: [f32; 3], v2: [f32; 3]) -> f32 {
    let dot = v1[0] * v2[0] + v1[1] * v2[1] + v1[2] * v2[2];
    let a = dot.acos();
    if a.is_nan() {
        0.0
    } else {
        a
    }
}

/// Euclidean norm of the camera-space point seen at `pixel` and `depth`.
pub fn disparity(camera: &Camera, pixel: [f32; 2], depth: f32) -> f32 {
    let p = pixel_to_camera(pixel[0], pixel[1], depth, camera);
    (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt()
}

/// Stereo disparity range `(min, max)` for a depth range, focal length and
/// baseline. The nearest depth gives the largest disparity.
pub fn disparity_range(fx: f32, baseline: f32, depth_min: f32, depth_max: f32) -> (f32, f32) {
    (fx * baseline / depth_max, fx * baseline / depth_min)
}
