// gpu/device.rs — Vulkan adapter and device setup for the compute backend.
//
// Adapters are ranked by device type (discrete, integrated, virtual, other,
// software) and the best one is opened. A software rasteriser such as
// llvmpipe is accepted only when nothing else exists, and a warning is
// logged because reconstruction on it is orders of magnitude slower.
//
// `DeviceProfile::Embedded` requests lower limits than the hardware offers.
// wgpu validates allocations and dispatches against the requested limits,
// so a reference image or hypothesis buffer that would not fit on a small
// target fails on the development machine too. The backend checks the
// limits up front (`check_texture`, `check_storage`) to report the failing
// resource by name instead of as an opaque validation error.
//
// Every error here is a device failure and converts into `MvsError::Fatal`.

use std::fmt;

use thiserror::Error;

use crate::error::MvsError;

/// Which set of device limits to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// wgpu's default limits.
    Native,
    /// A small GPU: 256 invocations per workgroup, 4096² textures and
    /// 128 MiB storage bindings.
    Embedded,
}

impl DeviceProfile {
    pub fn limits(self) -> wgpu::Limits {
        let base = wgpu::Limits::default();
        match self {
            DeviceProfile::Native => base,
            DeviceProfile::Embedded => wgpu::Limits {
                max_compute_invocations_per_workgroup: 256,
                max_compute_workgroup_size_x: 256,
                max_compute_workgroup_size_y: 256,
                max_compute_workgroup_size_z: 64,
                max_texture_dimension_2d: 4096,
                max_storage_buffer_binding_size: 128 << 20,
                ..base
            },
        }
    }

    /// Workgroup shape baked into the kernels by default. 16×8 fills whole
    /// warps on desktop parts; 8×8 leaves headroom under the 256 cap.
    fn default_workgroup(self) -> WorkgroupSize {
        match self {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::Embedded => WorkgroupSize { x: 8, y: 8 },
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceProfile::Native => "native",
            DeviceProfile::Embedded => "embedded",
        })
    }
}

/// 2D workgroup shape for the per-pixel kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Replace the `{{WG_X}}` and `{{WG_Y}}` placeholders in a kernel
    /// source. naga rejects `override` constants in `@workgroup_size`, so
    /// the shape is written into the text before compilation.
    pub fn specialize(&self, template: &str) -> String {
        template
            .replace("{{WG_X}}", &self.x.to_string())
            .replace("{{WG_Y}}", &self.y.to_string())
    }

    /// Workgroups needed to cover a `width × height` grid. Kernels guard
    /// against the overhang themselves.
    pub fn groups_for(&self, width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(self.x), height.div_ceil(self.y))
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Preference order when several adapters are present; higher wins.
fn adapter_rank(kind: wgpu::DeviceType) -> u8 {
    match kind {
        wgpu::DeviceType::DiscreteGpu => 4,
        wgpu::DeviceType::IntegratedGpu => 3,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Other => 1,
        wgpu::DeviceType::Cpu => 0,
    }
}

/// An open wgpu device together with the limits it was opened with.
///
/// `_instance` is the last field so it is dropped after `device` and
/// `queue`; the dzn Vulkan layer on WSL2 crashes when the instance goes
/// first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub limits: wgpu::Limits,
    pub adapter: wgpu::AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::open(profile))
    }

    async fn open(profile: DeviceProfile) -> Result<Self, GpuError> {
        // dzn reports itself as non-conformant and would be filtered out.
        let mut flags = wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER;
        if cfg!(debug_assertions) {
            flags |= wgpu::InstanceFlags::VALIDATION;
        }
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let adapter = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .inspect(|a| {
                let info = a.get_info();
                log::debug!("found adapter {} ({:?})", info.name, info.device_type);
            })
            .max_by_key(|a| adapter_rank(a.get_info().device_type))
            .ok_or(GpuError::NoSuitableAdapter)?;

        let info = adapter.get_info();
        if info.device_type == wgpu::DeviceType::Cpu {
            log::warn!("no hardware adapter, falling back to {}", info.name);
        }

        let limits = profile.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("patchmvs"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        let gpu = GpuDevice {
            device,
            queue,
            profile,
            limits,
            adapter: info,
            workgroup_size: profile.default_workgroup(),
            _instance: instance,
        };
        log::info!("opened {gpu}");
        Ok(gpu)
    }

    /// Change the kernel workgroup shape. Takes effect for pipelines built
    /// afterwards.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let max = self.limits.max_compute_invocations_per_workgroup;
        if x * y > max {
            return Err(GpuError::WorkgroupTooLarge { total: x * y, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    pub fn dispatch_size(&self, width: u32, height: u32) -> (u32, u32) {
        self.workgroup_size.groups_for(width, height)
    }

    /// Fail early when a `width × height` texture exceeds the device limit.
    pub fn check_texture(&self, label: &str, width: usize, height: usize) -> Result<(), GpuError> {
        let max = self.limits.max_texture_dimension_2d as usize;
        if width > max || height > max {
            return Err(GpuError::TextureTooLarge {
                label: label.to_string(),
                width,
                height,
                max,
            });
        }
        Ok(())
    }

    /// Fail early when a storage buffer exceeds the binding size limit.
    pub fn check_storage(&self, label: &str, size: u64) -> Result<(), GpuError> {
        let max = u64::from(self.limits.max_storage_buffer_binding_size);
        if size > max {
            return Err(GpuError::StorageTooLarge {
                label: label.to_string(),
                size,
                max,
            });
        }
        Ok(())
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:?}, {} limits, workgroup {}]",
            self.adapter.name, self.adapter.device_type, self.profile, self.workgroup_size
        )
    }
}

/// Device setup and capacity errors.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no Vulkan adapter available (does `vulkaninfo` list a device?)")]
    NoSuitableAdapter,
    #[error("device request failed: {0}")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),
    #[error("workgroup of {total} invocations exceeds the device limit of {max}")]
    WorkgroupTooLarge { total: u32, max: u32 },
    #[error("texture {label} is {width}x{height}, device limit is {max} per side")]
    TextureTooLarge {
        label: String,
        width: usize,
        height: usize,
        max: usize,
    },
    #[error("buffer {label} needs {size} bytes, storage binding limit is {max}")]
    StorageTooLarge { label: String, size: u64, max: u64 },
}

impl From<GpuError> for MvsError {
    #[track_caller]
    fn from(e: GpuError) -> Self {
        MvsError::device("gpu device", e.to_string())
    }
}
