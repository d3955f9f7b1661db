// backend.rs — Device abstraction shared by the CPU and wgpu backends.
//
// The reconstruction state and the upsampler never talk to wgpu directly.
// They allocate through a `ComputeBackend`, which hands out opaque texture
// and buffer handles and counts every allocation and release in a
// `ResourceLedger`. Two implementations exist:
//
//   HostBackend (host.rs)          CPU reference, used by tests and benches
//   GpuBackend  (gpu/backend.rs)   wgpu compute
//
// Handle ownership: `destroy_texture` and `free_buffer` take the handle by
// value, so a handle cannot be released twice.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytemuck::Pod;

use crate::error::Result;
use crate::image::{AddressMode, FilterMode, Image};

/// How a texture is sampled by device kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub address_mode: AddressMode,
    pub filter: FilterMode,
    /// `false`: coordinates are in texels, centre of texel i at i + 0.5.
    pub normalized_coords: bool,
}

impl SamplerDesc {
    /// Wrap addressing, linear filtering, unnormalised coordinates.
    pub const LOOKUP: SamplerDesc = SamplerDesc {
        address_mode: AddressMode::Wrap,
        filter: FilterMode::Linear,
        normalized_coords: false,
    };
}

impl Default for SamplerDesc {
    fn default() -> Self {
        SamplerDesc::LOOKUP
    }
}

/// Buffer usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Read-write kernel storage, copyable back to the host.
    Storage,
    /// Small read-only parameter block.
    Uniform,
}

// ---------------------------------------------------------------------------
// Resource ledger
// ---------------------------------------------------------------------------

/// Running allocation counters for one backend.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    textures_created: AtomicUsize,
    textures_destroyed: AtomicUsize,
    buffers_created: AtomicUsize,
    buffers_freed: AtomicUsize,
    barriers: AtomicUsize,
}

/// Point-in-time copy of a [`ResourceLedger`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub textures_created: usize,
    pub textures_destroyed: usize,
    pub buffers_created: usize,
    pub buffers_freed: usize,
    pub barriers: usize,
}

impl LedgerSnapshot {
    pub fn live_textures(&self) -> usize {
        self.textures_created - self.textures_destroyed
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers_created - self.buffers_freed
    }

    pub fn is_balanced(&self) -> bool {
        self.textures_created == self.textures_destroyed && self.buffers_created == self.buffers_freed
    }

    /// Total allocations of either kind.
    pub fn allocations(&self) -> usize {
        self.textures_created + self.buffers_created
    }
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texture_created(&self) {
        self.textures_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn texture_destroyed(&self) {
        self.textures_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_created(&self) {
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_freed(&self) {
        self.buffers_freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            textures_created: self.textures_created.load(Ordering::Relaxed),
            textures_destroyed: self.textures_destroyed.load(Ordering::Relaxed),
            buffers_created: self.buffers_created.load(Ordering::Relaxed),
            buffers_freed: self.buffers_freed.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
        }
    }

    /// `true` if every allocation so far has been released.
    pub fn is_balanced(&self) -> bool {
        self.snapshot().is_balanced()
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Inputs of one joint-bilateral-upsampling dispatch.
pub struct JbuBindings<'a, B: ComputeBackend + ?Sized> {
    /// Full-resolution guide intensity.
    pub guide: &'a B::Texture,
    /// Coarse depth.
    pub coarse: &'a B::Texture,
    /// Uniform holding a `JbuParams`.
    pub params: &'a B::Buffer,
    /// Storage for `width × height` f32 results.
    pub output: &'a B::Buffer,
    pub width: u32,
    pub height: u32,
}

/// A compute device that can hold textures and buffers and run the
/// joint-bilateral kernel.
pub trait ComputeBackend {
    type Texture;
    type Buffer;

    /// Short human-readable backend name for logs.
    fn name(&self) -> &str;

    fn ledger(&self) -> &ResourceLedger;

    /// Upload a single-channel image as a sampled texture.
    fn create_texture(&self, label: &str, image: &Image<f32>, sampler: SamplerDesc) -> Result<Self::Texture>;

    fn destroy_texture(&self, texture: Self::Texture);

    /// Allocate a zero-initialised buffer of `size` bytes.
    fn create_buffer(&self, label: &str, size: u64, kind: BufferKind) -> Result<Self::Buffer>;

    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Copy the whole buffer back to the host. Blocks until the copy is
    /// complete.
    fn read_buffer(&self, buffer: &Self::Buffer) -> Result<Vec<u8>>;

    fn free_buffer(&self, buffer: Self::Buffer);

    /// Wait until all submitted work has finished.
    fn synchronize(&self) -> Result<()>;

    /// Run the joint-bilateral upsampling kernel.
    fn joint_bilateral(&self, bindings: &JbuBindings<'_, Self>) -> Result<()>;

    /// Allocate a buffer and fill it with `data`.
    fn create_buffer_init<T: Pod>(&self, label: &str, data: &[T], kind: BufferKind) -> Result<Self::Buffer>
    where
        Self: Sized,
    {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = self.create_buffer(label, bytes.len() as u64, kind)?;
        if let Err(e) = self.write_buffer(&buffer, 0, bytes) {
            self.free_buffer(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Read a buffer back as a vector of `T`.
    fn read_pod<T: Pod>(&self, buffer: &Self::Buffer) -> Result<Vec<T>>
    where
        Self: Sized,
    {
        let bytes = self.read_buffer(buffer)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}
