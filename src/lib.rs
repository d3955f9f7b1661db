// patchmvs: device-resident state, geometry and map I/O for PatchMatch
// multi-view stereo
//
// A reconstruction pass estimates a depth and a surface normal for every
// pixel of a reference image by matching it against nearby source images.
// This crate owns everything around the propagation kernel: loading and
// rescaling inputs, the DMB map codec, the device buffers the kernel reads
// and writes, joint bilateral upsampling between pyramid levels, and
// exporting results as maps and point clouds.
//
// Backends: `host::HostBackend` (CPU reference) and `gpu::GpuBackend`
// (wgpu/Vulkan). Both implement `backend::ComputeBackend`.

pub mod error;
pub mod image;
pub mod camera;
pub mod dmb;
pub mod ply;
pub mod preview;
pub mod config;
pub mod problem;

pub mod backend;
pub mod host;
pub mod jbu;
pub mod state;

pub mod gpu;

pub use error::{DataError, MvsError, Result};
