// jbu.rs — Joint bilateral upsampling of a coarse depth map.
//
// A coarse pass produces depth at a fraction of the reference resolution.
// Before the fine pass can start, the coarse depth is upsampled to full
// resolution with the full-resolution intensity image as the edge guide:
//
//   out(p) = Σ_q w_s(q) · w_r(q) · D(q) / Σ_q w_s(q) · w_r(q)
//
//   c      = (p + 0.5) / scale                 p in coarse texel coords
//   q      = floor(c) + (i, j),  |i|,|j| ≤ R   coarse texel indices
//   w_s(q) = exp(-|q + 0.5 - c|² / 2σs²)
//   w_r(q) = exp(-(I((q + 0.5)·scale) - I(p + 0.5))² / 2σr²)
//
// Both inputs are sampled through textures (wrap addressing, bilinear,
// unnormalised coordinates). The result is persisted as `depths.dmb` in the
// reference image's result directory, where the hierarchical pass picks it
// up.
//
// Device sequence per call:
//   create 2 textures + params + output → synchronize → kernel →
//   synchronize → read back → release all four.

use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use log::{debug, info, warn};

use crate::backend::{BufferKind, ComputeBackend, JbuBindings, SamplerDesc};
use crate::config::{JbuConfig, ResultLayout};
use crate::dmb::{result_dir, write_depth, MapKind};
use crate::error::{DataError, MvsError, Result};
use crate::image::{AddressMode, Image};

/// Radius of the filter window on the coarse grid.
pub const JBU_RADIUS: u32 = 2;

/// Uniform block for the upsampling kernel. 48 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct JbuParams {
    /// Full-resolution (guide) size.
    pub width: u32,
    pub height: u32,
    /// Coarse size.
    pub s_width: u32,
    pub s_height: u32,
    pub scale: u32,
    pub radius: u32,
    pub sigma_spatial: f32,
    pub sigma_range: f32,
    /// 0 = wrap, 1 = clamp.
    pub address_mode: u32,
    pub _pad: [u32; 3],
}

/// Compute one output pixel. Shared by the host backend; the WGSL kernel
/// is a line-for-line port.
pub(crate) fn filter_pixel<G, C>(guide: &G, coarse: &C, p: &JbuParams, x: u32, y: u32) -> f32
where
    G: Fn(f32, f32) -> f32,
    C: Fn(f32, f32) -> f32,
{
    let scale = p.scale as f32;
    let center = guide(x as f32 + 0.5, y as f32 + 0.5);
    let cx = (x as f32 + 0.5) / scale;
    let cy = (y as f32 + 0.5) / scale;
    let bx = cx.floor();
    let by = cy.floor();

    let inv_2ss = 1.0 / (2.0 * p.sigma_spatial * p.sigma_spatial);
    let inv_2sr = 1.0 / (2.0 * p.sigma_range * p.sigma_range);
    let r = p.radius as i32;

    let mut sum = 0.0f32;
    let mut weight = 0.0f32;
    for j in -r..=r {
        for i in -r..=r {
            let qx = bx + i as f32 + 0.5;
            let qy = by + j as f32 + 0.5;
            let dx = qx - cx;
            let dy = qy - cy;
            let g = guide(qx * scale, qy * scale) - center;
            let w = (-(dx * dx + dy * dy) * inv_2ss).exp() * (-(g * g) * inv_2sr).exp();
            sum += w * coarse(qx, qy);
            weight += w;
        }
    }
    sum / weight
}

/// Result of a successful upsampling run.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsampleReport {
    /// Where the full-resolution depth was written.
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub scale: u32,
    /// Pixels whose upsampled depth is NaN.
    pub nan_pixels: usize,
}

impl UpsampleReport {
    /// `false` if the output contains NaN depths.
    pub fn is_clean(&self) -> bool {
        self.nan_pixels == 0
    }
}

/// What `run` did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsampleOutcome {
    /// Guide and coarse depth already share a resolution; nothing was done.
    SameResolution,
    Upsampled(UpsampleReport),
}

/// Integer upsampling factor: the larger of the row and column ratios.
pub fn scale_factor(guide: (usize, usize), coarse: (usize, usize)) -> Result<u32> {
    let (gw, gh) = guide;
    let (cw, ch) = coarse;
    if gw == 0 || gh == 0 || cw == 0 || ch == 0 {
        return Err(DataError::DimensionMismatch {
            what: "joint bilateral upsampling input".to_string(),
            expected: guide,
            found: coarse,
        }
        .into());
    }
    let scale = (gh / ch).max(gw / cw);
    if scale == 0 {
        return Err(DataError::DimensionMismatch {
            what: "coarse depth larger than guide".to_string(),
            expected: guide,
            found: coarse,
        }
        .into());
    }
    Ok(scale as u32)
}

/// Upsamples coarse depth on a compute backend.
pub struct JointBilateralUpsampler<'d, B: ComputeBackend> {
    backend: &'d B,
    config: JbuConfig,
    layout: ResultLayout,
}

impl<'d, B: ComputeBackend> JointBilateralUpsampler<'d, B> {
    pub fn new(backend: &'d B, config: JbuConfig, layout: ResultLayout) -> Self {
        JointBilateralUpsampler {
            backend,
            config,
            layout,
        }
    }

    /// Upsample `coarse` to the size of `guide` and write the result to
    /// `<dense>/<marker>/<prefix>_<ref_id>/depths.dmb`.
    ///
    /// Returns [`UpsampleOutcome::SameResolution`] without touching the
    /// device or the filesystem when the scale factor is 1.
    pub fn run(
        &self,
        guide: &Image<f32>,
        coarse: &Image<f32>,
        dense_folder: &Path,
        ref_image_id: u32,
    ) -> Result<UpsampleOutcome> {
        let scale = scale_factor(guide.dims(), coarse.dims())?;
        if scale == 1 {
            debug!("jbu: guide and coarse depth share resolution, skipping");
            return Ok(UpsampleOutcome::SameResolution);
        }

        let (width, height) = guide.dims();
        let depth = self.upsample(guide, coarse, scale)?;

        let nan_pixels = depth.as_slice().iter().filter(|v| v.is_nan()).count();
        if nan_pixels > 0 {
            warn!(
                "jbu: {nan_pixels} of {} upsampled depths are NaN (image {ref_image_id})",
                width * height
            );
        }

        let dir = result_dir(dense_folder, ref_image_id, &self.layout);
        std::fs::create_dir_all(&dir).map_err(|e| DataError::io(&dir, e))?;
        let path = dir.join(MapKind::Depth.file_name());
        write_depth(&path, &depth)?;
        info!(
            "jbu: {}x{} -> {width}x{height} (scale {scale}) written to {}",
            coarse.width(),
            coarse.height(),
            path.display()
        );

        Ok(UpsampleOutcome::Upsampled(UpsampleReport {
            path,
            width,
            height,
            scale,
            nan_pixels,
        }))
    }

    /// Run the kernel and return the full-resolution depth, without
    /// persisting it.
    pub fn upsample(&self, guide: &Image<f32>, coarse: &Image<f32>, scale: u32) -> Result<Image<f32>> {
        let b = self.backend;
        let (width, height) = guide.dims();
        let params = JbuParams {
            width: width as u32,
            height: height as u32,
            s_width: coarse.width() as u32,
            s_height: coarse.height() as u32,
            scale,
            radius: JBU_RADIUS,
            sigma_spatial: self.config.sigma_spatial,
            sigma_range: self.config.sigma_range,
            address_mode: match SamplerDesc::LOOKUP.address_mode {
                AddressMode::Wrap => 0,
                AddressMode::Clamp => 1,
            },
            _pad: [0; 3],
        };

        let guide_tex = b.create_texture("jbu guide", guide, SamplerDesc::LOOKUP)?;
        let coarse_tex = match b.create_texture("jbu coarse depth", coarse, SamplerDesc::LOOKUP) {
            Ok(t) => t,
            Err(e) => {
                b.destroy_texture(guide_tex);
                return Err(e);
            }
        };

        let mut params_buf = None;
        let mut output_buf = None;
        let result = (|| -> Result<Vec<f32>> {
            let pb = params_buf.insert(b.create_buffer_init(
                "jbu params",
                std::slice::from_ref(&params),
                BufferKind::Uniform,
            )?);
            let ob = output_buf.insert(b.create_buffer(
                "jbu output",
                (width * height * std::mem::size_of::<f32>()) as u64,
                BufferKind::Storage,
            )?);
            b.synchronize()?;

            b.joint_bilateral(&JbuBindings {
                guide: &guide_tex,
                coarse: &coarse_tex,
                params: pb,
                output: ob,
                width: width as u32,
                height: height as u32,
            })?;
            b.synchronize()?;

            b.read_pod::<f32>(ob)
        })();

        if let Some(buf) = output_buf {
            b.free_buffer(buf);
        }
        if let Some(buf) = params_buf {
            b.free_buffer(buf);
        }
        b.destroy_texture(coarse_tex);
        b.destroy_texture(guide_tex);

        let data = result?;
        if data.len() != width * height {
            return Err(MvsError::device(
                "joint_bilateral",
                format!("read back {} values, expected {}", data.len(), width * height),
            ));
        }
        Ok(Image::from_vec(width, height, data))
    }
}
