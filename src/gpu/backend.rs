// gpu/backend.rs — wgpu implementation of `ComputeBackend`.
//
// Every allocation and dispatch runs inside a pair of wgpu error scopes
// (OutOfMemory, Validation). A captured error becomes a fatal
// `MvsError::Fatal` naming the operation; wgpu would otherwise route it to
// the uncaptured-error handler, which panics.
//
// Buffers are created with COPY_SRC | COPY_DST so they can be filled with
// `queue.write_buffer` and read back through a MAP_READ staging copy. Sizes
// are padded to `COPY_BUFFER_ALIGNMENT`; the logical size is kept on the
// handle and readback trims to it.
//
// Pipelines:
//   jbu.wgsl   joint bilateral upsampling, one invocation per output pixel.

use crate::backend::{BufferKind, ComputeBackend, JbuBindings, ResourceLedger, SamplerDesc};
use crate::error::{MvsError, Result};
use crate::gpu::device::{DeviceProfile, GpuDevice};
use crate::gpu::texture::{map_read, GpuTexture};
use crate::image::{FilterMode, Image};

const JBU_SHADER: &str = include_str!("../shaders/jbu.wgsl");

/// A device buffer plus its logical (unpadded) size.
pub struct GpuBuffer {
    pub buffer: wgpu::Buffer,
    pub size: u64,
    pub kind: BufferKind,
}

struct JbuPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// wgpu compute backend.
pub struct GpuBackend {
    gpu: GpuDevice,
    ledger: ResourceLedger,
    jbu: JbuPipeline,
}

impl GpuBackend {
    /// Open the best Vulkan adapter with native limits.
    pub fn new() -> Result<Self> {
        Self::with_profile(DeviceProfile::Native)
    }

    pub fn with_profile(profile: DeviceProfile) -> Result<Self> {
        let gpu = GpuDevice::new_with_profile(profile)?;
        Self::from_device(gpu)
    }

    /// Build pipelines on an existing device.
    pub fn from_device(gpu: GpuDevice) -> Result<Self> {
        let jbu = scoped(&gpu, "create jbu pipeline", || create_jbu_pipeline(&gpu))?;
        Ok(GpuBackend {
            gpu,
            ledger: ResourceLedger::new(),
            jbu,
        })
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    /// Read a texture back to the host.
    pub fn read_texture(&self, texture: &GpuTexture) -> Result<Image<f32>> {
        texture.readback(&self.gpu)
    }
}

/// Run `f` with OutOfMemory and Validation error scopes pushed.
#[track_caller]
fn scoped<T>(gpu: &GpuDevice, op: &str, f: impl FnOnce() -> T) -> Result<T> {
    gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(gpu.device.pop_error_scope());
    let oom = pollster::block_on(gpu.device.pop_error_scope());
    match validation.or(oom) {
        Some(err) => Err(MvsError::device(op, err.to_string())),
        None => Ok(value),
    }
}

fn create_jbu_pipeline(gpu: &GpuDevice) -> JbuPipeline {
    let source = gpu.workgroup_size.specialize(JBU_SHADER);
    let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("patchmvs::jbu"),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };

    let bind_group_layout = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("patchmvs::jbu_bgl"),
        entries: &[
            // binding 0: guide intensity
            texture_entry(0),
            // binding 1: coarse depth
            texture_entry(1),
            // binding 2: JbuParams
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            // binding 3: output depth
            wgpu::BindGroupLayoutEntry {
                binding: 3,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    });

    let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("patchmvs::jbu_layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("patchmvs::jbu_pipeline"),
        layout: Some(&layout),
        module: &shader,
        entry_point: "jbu_main",
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });

    JbuPipeline {
        pipeline,
        bind_group_layout,
    }
}

impl ComputeBackend for GpuBackend {
    type Texture = GpuTexture;
    type Buffer = GpuBuffer;

    fn name(&self) -> &str {
        "wgpu"
    }

    fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn create_texture(&self, label: &str, image: &Image<f32>, sampler: SamplerDesc) -> Result<GpuTexture> {
        if image.is_empty() {
            return Err(MvsError::device("create_texture", format!("{label}: empty image")));
        }
        if sampler.filter != FilterMode::Linear {
            return Err(MvsError::device(
                "create_texture",
                format!("{label}: kernels only implement linear filtering"),
            ));
        }
        self.gpu.check_texture(label, image.width(), image.height())?;
        let texture = scoped(&self.gpu, "create_texture", || {
            GpuTexture::upload(&self.gpu, label, image, sampler)
        })?;
        self.ledger.texture_created();
        log::trace!("gpu texture {label} {}x{}", texture.width, texture.height);
        Ok(texture)
    }

    fn destroy_texture(&self, texture: GpuTexture) {
        texture.texture.destroy();
        self.ledger.texture_destroyed();
    }

    fn create_buffer(&self, label: &str, size: u64, kind: BufferKind) -> Result<GpuBuffer> {
        if kind == BufferKind::Storage {
            self.gpu.check_storage(label, size)?;
        }
        let padded = size
            .max(wgpu::COPY_BUFFER_ALIGNMENT)
            .div_ceil(wgpu::COPY_BUFFER_ALIGNMENT)
            * wgpu::COPY_BUFFER_ALIGNMENT;
        let usage = match kind {
            BufferKind::Storage => wgpu::BufferUsages::STORAGE,
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM,
        } | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;

        // wgpu zero-initialises new buffers.
        let buffer = scoped(&self.gpu, "create_buffer", || {
            self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: padded,
                usage,
                mapped_at_creation: false,
            })
        })?;
        self.ledger.buffer_created();
        log::trace!("gpu buffer {label} {size} bytes ({kind:?})");
        Ok(GpuBuffer { buffer, size, kind })
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > buffer.size {
            return Err(MvsError::device(
                "write_buffer",
                format!("write of {} bytes at {offset} overruns buffer of {}", data.len(), buffer.size),
            ));
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(MvsError::device(
                "write_buffer",
                format!("offset {offset} and length {} must be multiples of 4", data.len()),
            ));
        }
        scoped(&self.gpu, "write_buffer", || {
            self.gpu.queue.write_buffer(&buffer.buffer, offset, data);
        })
    }

    fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        let padded = buffer.buffer.size();
        let staging = scoped(&self.gpu, "read_buffer", || {
            let staging = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("patchmvs::buffer_readback"),
                size: padded,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("patchmvs::buffer_readback"),
            });
            encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, padded);
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
            staging
        })?;

        let mut bytes = map_read(&self.gpu, &staging)?;
        bytes.truncate(buffer.size as usize);
        Ok(bytes)
    }

    fn free_buffer(&self, buffer: GpuBuffer) {
        buffer.buffer.destroy();
        self.ledger.buffer_freed();
    }

    fn synchronize(&self) -> Result<()> {
        self.gpu.device.poll(wgpu::Maintain::Wait);
        self.ledger.barrier();
        Ok(())
    }

    fn joint_bilateral(&self, b: &JbuBindings<'_, Self>) -> Result<()> {
        if b.output.size < b.width as u64 * b.height as u64 * 4 {
            return Err(MvsError::device("joint_bilateral", "output buffer too small"));
        }
        let (groups_x, groups_y) = self.gpu.dispatch_size(b.width, b.height);

        scoped(&self.gpu, "joint_bilateral", || {
            let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("patchmvs::jbu_bg"),
                layout: &self.jbu.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&b.guide.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&b.coarse.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: b.params.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: b.output.buffer.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("patchmvs::jbu"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("patchmvs::jbu_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.jbu.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups_x, groups_y, 1);
            }
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
        })
    }
}
