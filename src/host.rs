// host.rs — CPU reference implementation of `ComputeBackend`.
//
// Textures are host images sampled with the same texel-centre, wrap and
// bilinear rules the WGSL kernels implement by hand, so results from this
// backend and the wgpu backend agree to float rounding. Buffers are plain
// byte vectors behind a `RefCell`: handles are owned by a single host
// thread.
//
// Used by the test suite and benches, and as a fallback when no adapter is
// available.

use std::cell::RefCell;

use crate::backend::{BufferKind, ComputeBackend, JbuBindings, ResourceLedger, SamplerDesc};
use crate::error::{MvsError, Result};
use crate::image::{sample_texture, Image};
use crate::jbu::{filter_pixel, JbuParams};

/// A host-resident sampled texture.
#[derive(Debug)]
pub struct HostTexture {
    image: Image<f32>,
    sampler: SamplerDesc,
}

impl HostTexture {
    /// Sample at `(x, y)` using the texture's sampler.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let (x, y) = if self.sampler.normalized_coords {
            (x * self.image.width() as f32, y * self.image.height() as f32)
        } else {
            (x, y)
        };
        sample_texture(&self.image, x, y, self.sampler.address_mode, self.sampler.filter)
    }

    pub fn image(&self) -> &Image<f32> {
        &self.image
    }
}

/// A host-resident byte buffer.
#[derive(Debug)]
pub struct HostBuffer {
    data: RefCell<Vec<u8>>,
    kind: BufferKind,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }
}

/// CPU compute backend.
#[derive(Debug, Default)]
pub struct HostBackend {
    ledger: ResourceLedger,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComputeBackend for HostBackend {
    type Texture = HostTexture;
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "host"
    }

    fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn create_texture(&self, label: &str, image: &Image<f32>, sampler: SamplerDesc) -> Result<HostTexture> {
        if image.is_empty() {
            return Err(MvsError::device("create_texture", format!("{label}: empty image")));
        }
        self.ledger.texture_created();
        log::trace!("host texture {label} {}x{}", image.width(), image.height());
        Ok(HostTexture {
            image: image.clone(),
            sampler,
        })
    }

    fn destroy_texture(&self, texture: HostTexture) {
        drop(texture);
        self.ledger.texture_destroyed();
    }

    fn create_buffer(&self, label: &str, size: u64, kind: BufferKind) -> Result<HostBuffer> {
        let size = usize::try_from(size)
            .map_err(|_| MvsError::device("create_buffer", format!("{label}: size {size} too large")))?;
        self.ledger.buffer_created();
        log::trace!("host buffer {label} {size} bytes");
        Ok(HostBuffer {
            data: RefCell::new(vec![0u8; size]),
            kind,
        })
    }

    fn write_buffer(&self, buffer: &HostBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut dst = buffer.data.borrow_mut();
        let start = offset as usize;
        let end = start + data.len();
        if end > dst.len() {
            return Err(MvsError::device(
                "write_buffer",
                format!("write of {} bytes at {start} overruns buffer of {}", data.len(), dst.len()),
            ));
        }
        dst[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HostBuffer) -> Result<Vec<u8>> {
        Ok(buffer.data.borrow().clone())
    }

    fn free_buffer(&self, buffer: HostBuffer) {
        drop(buffer);
        self.ledger.buffer_freed();
    }

    fn synchronize(&self) -> Result<()> {
        self.ledger.barrier();
        Ok(())
    }

    fn joint_bilateral(&self, b: &JbuBindings<'_, Self>) -> Result<()> {
        let raw = b.params.data.borrow();
        if raw.len() < std::mem::size_of::<JbuParams>() {
            return Err(MvsError::device("joint_bilateral", "parameter buffer too small"));
        }
        let params: JbuParams = bytemuck::pod_read_unaligned(&raw[..std::mem::size_of::<JbuParams>()]);

        let (w, h) = (b.width as usize, b.height as usize);
        let mut out = b.output.data.borrow_mut();
        if out.len() < w * h * 4 {
            return Err(MvsError::device("joint_bilateral", "output buffer too small"));
        }

        let guide = |x: f32, y: f32| b.guide.sample(x, y);
        let coarse = |x: f32, y: f32| b.coarse.sample(x, y);
        for y in 0..h {
            for x in 0..w {
                let v = filter_pixel(&guide, &coarse, &params, x as u32, y as u32);
                let i = (y * w + x) * 4;
                out[i..i + 4].copy_from_slice(&v.to_ne_bytes());
            }
        }
        Ok(())
    }
}
