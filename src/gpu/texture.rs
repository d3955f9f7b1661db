// gpu/texture.rs — Single-channel float textures and host readback.
//
// `GpuTexture` holds one `Image<f32>` as an `R32Float` 2D texture. Kernels
// read it with `textureLoad` and do their own addressing and bilinear
// interpolation (R32Float is not filterable without an optional feature),
// so the texture carries its `SamplerDesc` alongside for the kernel to
// honour.
//
// UPLOAD
// ──────
// `copy_buffer_to_texture` needs `bytes_per_row` to be a multiple of
// `COPY_BYTES_PER_ROW_ALIGNMENT` (256). Rows are staged into a padded
// buffer first:
//
//   row stride = align_to(width * 4, 256)
//   row y      = staging[y * stride .. y * stride + width * 4]
//
// READBACK
// ────────
// A MAP_READ | COPY_DST buffer receives the copy; the map callback reports
// through a channel and `device.poll(Wait)` drives it to completion.

use wgpu::util::DeviceExt;

use crate::backend::SamplerDesc;
use crate::error::{MvsError, Result};
use crate::gpu::device::GpuDevice;
use crate::image::Image;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
const TEXEL_BYTES: u32 = std::mem::size_of::<f32>() as u32;

/// A float image resident on the GPU.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub sampler: SamplerDesc,
}

impl GpuTexture {
    /// Upload `src` as an `R32Float` texture. The copy is queued; work
    /// submitted afterwards on the same queue observes it.
    pub fn upload(gpu: &GpuDevice, label: &str, src: &Image<f32>, sampler: SamplerDesc) -> Self {
        let (width, height) = (src.width() as u32, src.height() as u32);
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let tex = GpuTexture {
            view: texture.create_view(&Default::default()),
            texture,
            width,
            height,
            sampler,
        };

        let (rows, pitch) = stage_rows(src);
        let staging = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("patchmvs::texture_staging"),
            contents: &rows,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("patchmvs::texture_upload"),
        });
        encoder.copy_buffer_to_texture(tex.buffer_side(&staging, pitch), tex.texture_side(), tex.extent());
        gpu.queue.submit([encoder.finish()]);
        tex
    }

    /// Copy the texture back into a host image. Blocks.
    pub fn readback(&self, gpu: &GpuDevice) -> Result<Image<f32>> {
        let pitch = row_pitch(self.width as usize);
        let target = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("patchmvs::texture_readback"),
            size: u64::from(pitch) * u64::from(self.height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("patchmvs::texture_readback"),
        });
        encoder.copy_texture_to_buffer(self.texture_side(), self.buffer_side(&target, pitch), self.extent());
        gpu.queue.submit([encoder.finish()]);

        let raw = map_read(gpu, &target)?;
        Ok(unstage_rows(&raw, self.width as usize, self.height as usize, pitch as usize))
    }

    fn extent(&self) -> wgpu::Extent3d {
        extent(self.width, self.height)
    }

    fn texture_side(&self) -> wgpu::ImageCopyTexture<'_> {
        wgpu::ImageCopyTexture {
            texture: &self.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }

    fn buffer_side<'a>(&self, buffer: &'a wgpu::Buffer, pitch: u32) -> wgpu::ImageCopyBuffer<'a> {
        wgpu::ImageCopyBuffer {
            buffer,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(pitch),
                rows_per_image: Some(self.height),
            },
        }
    }
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// Staging row pitch for a row of `width` texels.
fn row_pitch(width: usize) -> u32 {
    align_to(width as u32 * TEXEL_BYTES, COPY_ALIGNMENT)
}

/// Map a MAP_READ buffer and copy its contents out. Blocks until every
/// submitted copy into it has landed.
pub(crate) fn map_read(gpu: &GpuDevice, buffer: &wgpu::Buffer) -> Result<Vec<u8>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        // Receiver outlives the poll below; a send error cannot happen.
        let _ = sender.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);

    receiver
        .recv()
        .map_err(|_| MvsError::device("map_read", "map callback never fired"))?
        .map_err(|e| MvsError::device("map_read", e.to_string()))?;

    let out = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(out)
}

/// Pack image rows into a 256-byte-aligned staging layout.
/// Returns the bytes and the row pitch.
fn stage_rows(src: &Image<f32>) -> (Vec<u8>, u32) {
    let pitch = row_pitch(src.width());
    let mut staging = vec![0u8; pitch as usize * src.height()];
    for (y, chunk) in staging.chunks_exact_mut(pitch as usize).enumerate() {
        let row: &[u8] = bytemuck::cast_slice(src.row(y));
        chunk[..row.len()].copy_from_slice(row);
    }
    (staging, pitch)
}

/// Inverse of [`stage_rows`].
fn unstage_rows(raw: &[u8], width: usize, height: usize, pitch: usize) -> Image<f32> {
    let row_bytes = width * TEXEL_BYTES as usize;
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        let row = &raw[y * pitch..y * pitch + row_bytes];
        data.extend(bytemuck::pod_collect_to_vec::<u8, f32>(row));
    }
    Image::from_vec(width, height, data)
}

/// Smallest multiple of `alignment` that is `>= value`.
#[inline]
fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}
