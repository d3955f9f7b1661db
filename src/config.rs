// config.rs — Reconstruction and upsampling configuration.
//
// `ReconstructionConfig` is captured by value when a `ReconstructionState`
// is constructed and never changes afterwards. Both device allocation and
// teardown read `modes` from that one copy, so the conditional frees always
// mirror the conditional allocations.
//
// `PassParams` is the device-side view of the same configuration plus the
// per-problem values (depth range, image count, dimensions) derived during
// input initialisation. It is uploaded once per pass as a uniform buffer.

use bytemuck::{Pod, Zeroable};

/// Optional operating modes. Combinable; set before initialisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    /// Cross-check against previously persisted depth/normal maps.
    pub geom_consistency: bool,
    /// Seed this pass from a coarser pass.
    pub hierarchy: bool,
    /// Read/write the `_geom` suffixed consistency maps.
    pub multi_geometry: bool,
    /// Passed through to the propagation kernel.
    pub repair: bool,
}

impl ModeFlags {
    pub const GEOM_CONSISTENCY: u32 = 1 << 0;
    pub const HIERARCHY: u32 = 1 << 1;
    pub const MULTI_GEOMETRY: u32 = 1 << 2;
    pub const REPAIR: u32 = 1 << 3;

    /// Pack into the bit layout used by `PassParams::mode_bits`.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.geom_consistency {
            bits |= Self::GEOM_CONSISTENCY;
        }
        if self.hierarchy {
            bits |= Self::HIERARCHY;
        }
        if self.multi_geometry {
            bits |= Self::MULTI_GEOMETRY;
        }
        if self.repair {
            bits |= Self::REPAIR;
        }
        bits
    }
}

/// Naming of the per-image result directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLayout {
    /// Directory under the dense folder holding all results.
    pub marker: String,
    /// Prefix of each per-image directory, joined to the id by `_`.
    pub prefix: String,
}

impl Default for ResultLayout {
    fn default() -> Self {
        ResultLayout {
            marker: "CNVR".to_string(),
            prefix: "2333".to_string(),
        }
    }
}

/// Configuration for one reconstruction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionConfig {
    pub modes: ModeFlags,
    /// Stereo baseline used for the disparity range.
    pub baseline: f32,
    /// Propagation iterations.
    pub max_iterations: u32,
    /// Weight of the normal-smoothness term, forwarded to the kernel.
    pub normal_lambda: f32,
    /// Seed for the per-pixel RNG states.
    pub rng_seed: u64,
    /// Maximum number of images (and texture slots per map kind).
    pub image_capacity: usize,
    pub layout: ResultLayout,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        ReconstructionConfig {
            modes: ModeFlags::default(),
            baseline: 0.54,
            max_iterations: 3,
            normal_lambda: 0.0,
            rng_seed: 0x5eed_1234,
            image_capacity: 32,
            layout: ResultLayout::default(),
        }
    }
}

impl ReconstructionConfig {
    /// Enable geometric consistency. Drops the iteration count to 2.
    pub fn with_geom_consistency(mut self, multi_geometry: bool) -> Self {
        self.modes.geom_consistency = true;
        self.max_iterations = 2;
        if multi_geometry {
            self.modes.multi_geometry = true;
        }
        self
    }

    pub fn with_hierarchy(mut self) -> Self {
        self.modes.hierarchy = true;
        self
    }

    pub fn with_repair(mut self) -> Self {
        self.modes.repair = true;
        self
    }

    /// Normal lambda for the given outer iteration (`2 × iteration`).
    pub fn with_normal_lambda(mut self, iteration: u32) -> Self {
        self.normal_lambda = 2.0 * iteration as f32;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    pub fn with_image_capacity(mut self, capacity: usize) -> Self {
        self.image_capacity = capacity;
        self
    }

    pub fn with_layout(mut self, layout: ResultLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// Uniform record handed to the propagation kernel.
///
/// 64 bytes, every field 4 bytes wide so the WGSL struct matches without
/// implicit padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PassParams {
    pub depth_min: f32,
    pub depth_max: f32,
    pub disparity_min: f32,
    pub disparity_max: f32,
    pub num_images: u32,
    pub max_iterations: u32,
    pub mode_bits: u32,
    pub normal_lambda: f32,
    pub ref_width: u32,
    pub ref_height: u32,
    /// Coarse width when `upsample != 0`, else 0.
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub upsample: u32,
    pub baseline: f32,
    pub _pad: [u32; 2],
}

/// Joint bilateral upsampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JbuConfig {
    /// Spatial Gaussian sigma, in coarse-grid pixels.
    pub sigma_spatial: f32,
    /// Range Gaussian sigma, in guide intensity units (0..255).
    pub sigma_range: f32,
}

impl Default for JbuConfig {
    fn default() -> Self {
        JbuConfig {
            sigma_spatial: 0.5,
            sigma_range: 25.5,
        }
    }
}
