// state.rs — Per-problem reconstruction state: host inputs, device
// resources, host mirrors of the pass results, and teardown.
//
// Lifecycle (enforced at runtime, out-of-order calls are `InvalidState`):
//
//   new(backend, config, dense)      captures the config by value
//   input_initialization(problem)    images, cameras, depth range, and in
//                                    geometric-consistency mode the prior
//                                    depth/normal maps of every image
//   device_initialization()          textures, camera array, hypothesis /
//                                    cost / RNG / view-mask buffers, plus the
//                                    geometry textures and hierarchy buffers
//                                    when their modes are on
//   run_pass(kernel)                 opaque propagation, then read-back
//   accessors, persist_results()
//   drop                             releases everything device_initialization
//                                    created
//
// Allocation and teardown both branch on `self.config.modes`, the one copy
// taken at construction. Every file the device phase needs is read before
// the first allocation, so a missing or malformed map never leaves device
// resources behind. A device failure midway leaves the partial resources
// in `self.device`, and drop releases them.

use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use log::{debug, info};

use crate::backend::{BufferKind, ComputeBackend, LedgerSnapshot, SamplerDesc};
use crate::camera::{back_project, disparity_range, fit_within, rescale_image_and_camera, Camera};
use crate::config::{PassParams, ReconstructionConfig};
use crate::dmb::{
    read_cost, read_depth, read_normal, result_dir, result_path, write_cost, write_depth, write_normal,
    ConsistencyVariant, MapKind, NormalMap,
};
use crate::error::{DataError, Result};
use crate::image::Image;
use crate::ply::PointRecord;
use crate::problem::{ImageSource, Problem};

// ---------------------------------------------------------------------------
// Device-side records
// ---------------------------------------------------------------------------

/// Unit normal plus depth, read and written by kernels as one unit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PlaneHypothesis {
    pub nx: f32,
    pub ny: f32,
    pub nz: f32,
    pub depth: f32,
}

impl PlaneHypothesis {
    pub fn new(normal: [f32; 3], depth: f32) -> Self {
        PlaneHypothesis {
            nx: normal[0],
            ny: normal[1],
            nz: normal[2],
            depth,
        }
    }

    pub fn normal(&self) -> [f32; 3] {
        [self.nx, self.ny, self.nz]
    }
}

/// Camera as laid out in the device camera array. 112 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GpuCamera {
    pub k: [f32; 9],
    pub r: [f32; 9],
    pub t: [f32; 3],
    pub depth_min: f32,
    pub depth_max: f32,
    pub width: u32,
    pub height: u32,
    pub _pad: [u32; 3],
}

impl From<&Camera> for GpuCamera {
    fn from(c: &Camera) -> Self {
        GpuCamera {
            k: c.k,
            r: c.r,
            t: c.t,
            depth_min: c.depth_min,
            depth_max: c.depth_max,
            width: c.width as u32,
            height: c.height as u32,
            _pad: [0; 3],
        }
    }
}

/// Seed one xorshift128 state per pixel. States are never all-zero.
pub fn seed_rand_states(seed: u64, count: usize) -> Vec<[u32; 4]> {
    // splitmix64
    let mut z = seed;
    let mut next = move || {
        z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut x = z;
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^ (x >> 31)
    };
    (0..count)
        .map(|_| {
            let a = next();
            let b = next();
            let mut s = [a as u32, (a >> 32) as u32, b as u32, (b >> 32) as u32];
            if s == [0; 4] {
                s[0] = 1;
            }
            s
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Device resources
// ---------------------------------------------------------------------------

/// Fixed-capacity list of texture handles indexed by image position.
#[derive(Debug)]
pub struct TextureArena<T> {
    what: &'static str,
    capacity: usize,
    slots: Vec<T>,
}

impl<T> TextureArena<T> {
    pub fn new(what: &'static str, capacity: usize) -> Self {
        TextureArena {
            what,
            capacity,
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Append a handle; fails once `capacity` handles are held.
    pub fn push(&mut self, handle: T) -> std::result::Result<usize, (T, DataError)> {
        if self.slots.len() >= self.capacity {
            let err = DataError::CapacityExceeded {
                what: self.what,
                capacity: self.capacity,
                requested: self.slots.len() + 1,
            };
            return Err((handle, err));
        }
        self.slots.push(handle);
        Ok(self.slots.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.slots.drain(..)
    }
}

/// Per-image depth and normal-component textures (geometric consistency).
pub struct GeometryTextures<B: ComputeBackend> {
    pub depths: TextureArena<B::Texture>,
    pub normals_x: TextureArena<B::Texture>,
    pub normals_y: TextureArena<B::Texture>,
    pub normals_z: TextureArena<B::Texture>,
}

/// Coarse-pass prior (hierarchical mode).
pub struct HierarchyBuffers<B: ComputeBackend> {
    /// `scaled_width × scaled_height` hypotheses. The fourth component holds
    /// the coarse cost when upsampling is pending, the coarse depth
    /// otherwise.
    pub scaled_hypotheses: B::Buffer,
    /// `scaled_width × scaled_height` coarse costs.
    pub prior_costs: B::Buffer,
    pub scaled_width: usize,
    pub scaled_height: usize,
}

#[derive(Clone, Copy)]
enum Slot {
    Cameras,
    Hypotheses,
    PrevHypotheses,
    Costs,
    PrevCosts,
    RandStates,
    SelectedViews,
    Params,
}

const CORE_SLOTS: usize = 8;

/// Everything a pass binds on the device.
pub struct DeviceResources<B: ComputeBackend> {
    pub images: TextureArena<B::Texture>,
    core: Vec<B::Buffer>,
    pub geometry: Option<GeometryTextures<B>>,
    pub hierarchy: Option<HierarchyBuffers<B>>,
}

impl<B: ComputeBackend> DeviceResources<B> {
    fn new(capacity: usize) -> Self {
        DeviceResources {
            images: TextureArena::new("image textures", capacity),
            core: Vec::with_capacity(CORE_SLOTS),
            geometry: None,
            hierarchy: None,
        }
    }

    #[inline]
    fn slot(&self, s: Slot) -> &B::Buffer {
        &self.core[s as usize]
    }

    /// `GpuCamera` array, one per image.
    pub fn cameras(&self) -> &B::Buffer {
        self.slot(Slot::Cameras)
    }

    pub fn hypotheses(&self) -> &B::Buffer {
        self.slot(Slot::Hypotheses)
    }

    pub fn prev_hypotheses(&self) -> &B::Buffer {
        self.slot(Slot::PrevHypotheses)
    }

    pub fn costs(&self) -> &B::Buffer {
        self.slot(Slot::Costs)
    }

    pub fn prev_costs(&self) -> &B::Buffer {
        self.slot(Slot::PrevCosts)
    }

    /// xorshift128 states, `[u32; 4]` per pixel.
    pub fn rand_states(&self) -> &B::Buffer {
        self.slot(Slot::RandStates)
    }

    pub fn selected_views(&self) -> &B::Buffer {
        self.slot(Slot::SelectedViews)
    }

    /// `PassParams` uniform.
    pub fn params(&self) -> &B::Buffer {
        self.slot(Slot::Params)
    }
}

/// The opaque per-pass propagation routine.
pub trait PropagationKernel<B: ComputeBackend> {
    fn run(&mut self, backend: &B, resources: &DeviceResources<B>, params: &PassParams) -> Result<()>;
}

impl<B, F> PropagationKernel<B> for F
where
    B: ComputeBackend,
    F: FnMut(&B, &DeviceResources<B>, &PassParams) -> Result<()>,
{
    fn run(&mut self, backend: &B, resources: &DeviceResources<B>, params: &PassParams) -> Result<()> {
        self(backend, resources, params)
    }
}

// ---------------------------------------------------------------------------
// Host-side data
// ---------------------------------------------------------------------------

/// Prior depth and normal maps of every image, in problem order.
#[derive(Debug, Clone)]
pub struct GeometryMaps {
    pub depths: Vec<Image<f32>>,
    pub normals: Vec<NormalMap>,
}

/// Set when the hierarchical prior is coarser than the reference image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsampleRequest {
    pub scaled_width: usize,
    pub scaled_height: usize,
}

/// Priors read from disk before any device allocation.
struct DevicePlan {
    hypotheses: Vec<PlaneHypothesis>,
    costs: Vec<f32>,
    hierarchy: Option<HierarchyPlan>,
}

struct HierarchyPlan {
    scaled_hypotheses: Vec<PlaneHypothesis>,
    prior_costs: Vec<f32>,
    width: usize,
    height: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Created,
    InputsLoaded,
    DeviceReady,
    PassComplete,
}

fn expect_dims(what: &str, expected: (usize, usize), found: (usize, usize)) -> Result<()> {
    if expected != found {
        return Err(DataError::DimensionMismatch {
            what: what.to_string(),
            expected,
            found,
        }
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ReconstructionState
// ---------------------------------------------------------------------------

/// All state for reconstructing one problem on one backend.
pub struct ReconstructionState<'d, B: ComputeBackend> {
    backend: &'d B,
    config: ReconstructionConfig,
    dense_folder: PathBuf,
    stage: Stage,
    problem: Option<Problem>,

    images: Vec<Image<f32>>,
    cameras: Vec<Camera>,
    geometry: Option<GeometryMaps>,
    params: PassParams,
    upsample: Option<UpsampleRequest>,

    hypotheses: Vec<PlaneHypothesis>,
    costs: Vec<f32>,
    selected_views: Vec<u32>,

    device: Option<DeviceResources<B>>,
}

impl<'d, B: ComputeBackend> ReconstructionState<'d, B> {
    pub fn new(backend: &'d B, config: ReconstructionConfig, dense_folder: impl Into<PathBuf>) -> Self {
        ReconstructionState {
            backend,
            config,
            dense_folder: dense_folder.into(),
            stage: Stage::Created,
            problem: None,
            images: Vec::new(),
            cameras: Vec::new(),
            geometry: None,
            params: PassParams::default(),
            upsample: None,
            hypotheses: Vec::new(),
            costs: Vec::new(),
            selected_views: Vec::new(),
            device: None,
        }
    }

    fn variant(&self) -> ConsistencyVariant {
        if self.config.modes.multi_geometry {
            ConsistencyVariant::MultiGeometry
        } else {
            ConsistencyVariant::Plain
        }
    }

    fn map_path(&self, image_id: u32, kind: MapKind) -> PathBuf {
        result_path(&self.dense_folder, image_id, kind, &self.config.layout)
    }

    /// Load images and cameras for `problem`, derive the depth and
    /// disparity ranges, and in geometric-consistency mode load every
    /// image's prior depth and normal map.
    pub fn input_initialization(&mut self, problem: &Problem, source: &dyn ImageSource) -> Result<()> {
        if self.stage != Stage::Created {
            return Err(DataError::InvalidState("inputs already initialised").into());
        }
        let n = problem.num_images();
        if n > self.config.image_capacity {
            return Err(DataError::CapacityExceeded {
                what: "images per problem",
                capacity: self.config.image_capacity,
                requested: n,
            }
            .into());
        }

        let max_size = problem.cur_image_size as usize;
        let mut images = Vec::with_capacity(n);
        let mut cameras = Vec::with_capacity(n);
        for id in problem.image_ids() {
            let image = source.load_image(id)?;
            if image.is_empty() {
                return Err(DataError::EmptyImage {
                    what: format!("image {id}"),
                }
                .into());
            }
            let mut camera = source.load_camera(id)?;
            let (w, h) = image.dims();
            camera.width = w;
            camera.height = h;

            match fit_within(max_size, w, h) {
                Some(target) => {
                    let (scaled, scaled_cam) = rescale_image_and_camera(&image, target, &camera);
                    debug!("image {id}: {w}x{h} -> {}x{}", target.0, target.1);
                    images.push(scaled);
                    cameras.push(scaled_cam);
                }
                None => {
                    images.push(image);
                    cameras.push(camera);
                }
            }
        }

        let geometry = if self.config.modes.geom_consistency {
            let variant = self.variant();
            let mut depths = Vec::with_capacity(n);
            let mut normals = Vec::with_capacity(n);
            for id in problem.image_ids() {
                let depth_path = self.map_path(id, variant.depth());
                let normal_path = self.map_path(id, variant.normal());
                let depth = read_depth(&depth_path)?;
                let normal = read_normal(&normal_path)?;
                // Every map is uploaded as a texture and needs a pixel.
                for (path, dims) in [(&depth_path, depth.dims()), (&normal_path, normal.dims())] {
                    if dims.0 == 0 || dims.1 == 0 {
                        return Err(DataError::Truncated {
                            path: path.clone(),
                            reason: format!("map is {}x{}, textures need at least one pixel", dims.0, dims.1),
                        }
                        .into());
                    }
                }
                depths.push(depth);
                normals.push(normal);
            }
            Some(GeometryMaps { depths, normals })
        } else {
            None
        };

        let ref_cam = &cameras[0];
        let depth_min = ref_cam.depth_min * 0.6;
        let depth_max = ref_cam.depth_max * 1.4;
        let (disparity_min, disparity_max) =
            disparity_range(ref_cam.fx(), self.config.baseline, depth_min, depth_max);
        self.params = PassParams {
            depth_min,
            depth_max,
            disparity_min,
            disparity_max,
            num_images: n as u32,
            max_iterations: self.config.max_iterations,
            mode_bits: self.config.modes.bits(),
            normal_lambda: self.config.normal_lambda,
            ref_width: ref_cam.width as u32,
            ref_height: ref_cam.height as u32,
            baseline: self.config.baseline,
            ..PassParams::default()
        };
        info!("depth range: {depth_min} {depth_max}");
        info!("num images: {n}");

        self.images = images;
        self.cameras = cameras;
        self.geometry = geometry;
        self.problem = Some(problem.clone());
        self.stage = Stage::InputsLoaded;
        Ok(())
    }

    /// Read the reference priors the device phase needs and assemble the
    /// initial host hypotheses. No device work.
    fn plan_device(&mut self, ref_id: u32) -> Result<DevicePlan> {
        let ref_dims = self.images[0].dims();
        let (w, h) = ref_dims;
        let mut hypotheses = vec![PlaneHypothesis::default(); w * h];
        let mut costs = vec![0.0f32; w * h];

        if let Some(geometry) = &self.geometry {
            let depth = &geometry.depths[0];
            let normal = &geometry.normals[0];
            let cost = read_cost(&self.map_path(ref_id, MapKind::Cost))?;
            expect_dims("reference prior depth", ref_dims, depth.dims())?;
            expect_dims("reference prior normals", ref_dims, normal.dims())?;
            expect_dims("reference prior cost", ref_dims, cost.dims())?;
            for y in 0..h {
                for x in 0..w {
                    hypotheses[y * w + x] = PlaneHypothesis::new(normal.get(x, y), depth.get(x, y));
                }
            }
            costs.copy_from_slice(cost.as_slice());
        }

        let mut hierarchy = None;
        self.upsample = None;
        if self.config.modes.hierarchy {
            let depth = read_depth(&self.map_path(ref_id, MapKind::Depth))?;
            let normal = read_normal(&self.map_path(ref_id, MapKind::NormalGeom))?;
            let cost = read_cost(&self.map_path(ref_id, MapKind::Cost))?;
            let (sw, sh) = normal.dims();
            expect_dims("coarse prior cost", (sw, sh), cost.dims())?;
            expect_dims("hierarchical depth prior", ref_dims, depth.dims())?;

            let upsample = (sw, sh) != ref_dims;
            if upsample {
                self.upsample = Some(UpsampleRequest {
                    scaled_width: sw,
                    scaled_height: sh,
                });
                info!("hierarchical prior {sw}x{sh} is coarser than {w}x{h}; upsampling pending");
            }

            let mut scaled = vec![PlaneHypothesis::default(); sw * sh];
            for y in 0..sh {
                for x in 0..sw {
                    let fourth = if upsample { cost.get(x, y) } else { depth.get(x, y) };
                    scaled[y * sw + x] = PlaneHypothesis::new(normal.get(x, y), fourth);
                }
            }
            if upsample {
                for (hyp, &d) in hypotheses.iter_mut().zip(depth.as_slice()) {
                    hyp.depth = d;
                }
            } else {
                for y in 0..h {
                    for x in 0..w {
                        hypotheses[y * w + x] = PlaneHypothesis::new(normal.get(x, y), depth.get(x, y));
                    }
                }
                costs.copy_from_slice(cost.as_slice());
            }
            hierarchy = Some(HierarchyPlan {
                scaled_hypotheses: scaled,
                prior_costs: cost.into_vec(),
                width: sw,
                height: sh,
            });
        }

        Ok(DevicePlan {
            hypotheses,
            costs,
            hierarchy,
        })
    }

    /// Allocate and upload every device resource for the pass.
    pub fn device_initialization(&mut self) -> Result<()> {
        if self.stage != Stage::InputsLoaded {
            return Err(DataError::InvalidState("device initialisation requires loaded inputs").into());
        }
        if self.device.is_some() {
            return Err(DataError::InvalidState("device resources from a failed initialisation are still held").into());
        }
        let ref_id = self
            .problem
            .as_ref()
            .map(|p| p.ref_image_id)
            .ok_or(DataError::InvalidState("no problem loaded"))?;

        let plan = self.plan_device(ref_id)?;
        if let Some(req) = self.upsample {
            self.params.upsample = 1;
            self.params.scaled_width = req.scaled_width as u32;
            self.params.scaled_height = req.scaled_height as u32;
        }

        let backend = self.backend;
        let res = self.device.insert(DeviceResources::new(self.config.image_capacity));
        allocate(
            backend,
            &self.config,
            &self.images,
            &self.cameras,
            self.geometry.as_ref(),
            &plan,
            &self.params,
            res,
        )?;

        self.hypotheses = plan.hypotheses;
        self.costs = plan.costs;
        self.selected_views = vec![0; self.hypotheses.len()];
        self.stage = Stage::DeviceReady;
        let snap = backend.ledger().snapshot();
        info!(
            "{}: {} textures, {} buffers live",
            backend.name(),
            snap.live_textures(),
            snap.live_buffers()
        );
        Ok(())
    }

    /// Run the propagation kernel once and mirror its results on the host.
    pub fn run_pass<K: PropagationKernel<B>>(&mut self, kernel: &mut K) -> Result<()> {
        if self.stage != Stage::DeviceReady {
            return Err(DataError::InvalidState("a pass needs freshly initialised device resources").into());
        }
        let res = self
            .device
            .as_ref()
            .ok_or(DataError::InvalidState("device resources missing"))?;
        kernel.run(self.backend, res, &self.params)?;
        self.backend.synchronize()?;

        self.hypotheses = self.backend.read_pod(res.hypotheses())?;
        self.costs = self.backend.read_pod(res.costs())?;
        self.selected_views = self.backend.read_pod(res.selected_views())?;
        self.stage = Stage::PassComplete;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn reference_width(&self) -> usize {
        self.cameras.first().map_or(0, |c| c.width)
    }

    pub fn reference_height(&self) -> usize {
        self.cameras.first().map_or(0, |c| c.height)
    }

    pub fn reference_image(&self) -> Option<&Image<f32>> {
        self.images.first()
    }

    pub fn plane_hypothesis(&self, index: usize) -> Option<PlaneHypothesis> {
        self.hypotheses.get(index).copied()
    }

    pub fn cost(&self, index: usize) -> Option<f32> {
        self.costs.get(index).copied()
    }

    pub fn selected_views(&self, index: usize) -> Option<u32> {
        self.selected_views.get(index).copied()
    }

    pub fn plane_hypotheses(&self) -> &[PlaneHypothesis] {
        &self.hypotheses
    }

    pub fn costs(&self) -> &[f32] {
        &self.costs
    }

    /// Working depth search range `(min, max)`.
    pub fn depth_range(&self) -> (f32, f32) {
        (self.params.depth_min, self.params.depth_max)
    }

    pub fn disparity_range(&self) -> (f32, f32) {
        (self.params.disparity_min, self.params.disparity_max)
    }

    /// Cameras in problem order, reference first.
    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    /// Images in problem order, reference first.
    pub fn images(&self) -> &[Image<f32>] {
        &self.images
    }

    pub fn geometry_maps(&self) -> Option<&GeometryMaps> {
        self.geometry.as_ref()
    }

    pub fn upsample_request(&self) -> Option<UpsampleRequest> {
        self.upsample
    }

    pub fn params(&self) -> &PassParams {
        &self.params
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn dense_folder(&self) -> &Path {
        &self.dense_folder
    }

    pub fn device_resources(&self) -> Option<&DeviceResources<B>> {
        self.device.as_ref()
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.backend.ledger().snapshot()
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Write the reference depth, normal and cost maps of the completed
    /// pass. Returns the written paths.
    pub fn persist_results(&self) -> Result<Vec<PathBuf>> {
        if self.stage != Stage::PassComplete {
            return Err(DataError::InvalidState("no completed pass to persist").into());
        }
        let ref_id = self
            .problem
            .as_ref()
            .map(|p| p.ref_image_id)
            .ok_or(DataError::InvalidState("no problem loaded"))?;
        let (w, h) = (self.reference_width(), self.reference_height());

        let mut depth = Image::new(w, h);
        let mut normals = NormalMap::new(w, h);
        for (i, hyp) in self.hypotheses.iter().enumerate() {
            let (x, y) = (i % w, i / w);
            depth.set(x, y, hyp.depth);
            normals.set(x, y, hyp.normal());
        }
        let cost = Image::from_vec(w, h, self.costs.clone());

        let dir = result_dir(&self.dense_folder, ref_id, &self.config.layout);
        std::fs::create_dir_all(&dir).map_err(|e| DataError::io(&dir, e))?;

        let depth_kind = if self.config.modes.geom_consistency {
            MapKind::DepthGeom
        } else {
            MapKind::Depth
        };
        let depth_path = dir.join(depth_kind.file_name());
        let normal_path = dir.join(MapKind::Normal.file_name());
        let cost_path = dir.join(MapKind::Cost.file_name());
        write_depth(&depth_path, &depth)?;
        write_normal(&normal_path, &normals)?;
        write_cost(&cost_path, &cost)?;
        info!("results for image {ref_id} written to {}", dir.display());
        Ok(vec![depth_path, normal_path, cost_path])
    }

    /// Back-project every reference pixel with a positive finite depth,
    /// coloured by its gray level.
    pub fn point_records(&self) -> Vec<PointRecord> {
        let (Some(cam), Some(img)) = (self.cameras.first(), self.images.first()) else {
            return Vec::new();
        };
        let w = cam.width;
        self.hypotheses
            .iter()
            .enumerate()
            .filter(|(_, h)| h.depth.is_finite() && h.depth > 0.0)
            .map(|(i, h)| {
                let (x, y) = (i % w, i / w);
                let gray = img.get(x, y).clamp(0.0, 255.0) as u8;
                PointRecord {
                    position: back_project(x as f32, y as f32, h.depth, cam),
                    color: [gray; 3],
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn teardown(&mut self) {
        let Some(mut res) = self.device.take() else {
            return;
        };
        let b = self.backend;

        for tex in res.images.drain() {
            b.destroy_texture(tex);
        }
        for buf in res.core.drain(..) {
            b.free_buffer(buf);
        }

        if self.config.modes.geom_consistency {
            if let Some(mut g) = res.geometry.take() {
                for arena in [&mut g.depths, &mut g.normals_x, &mut g.normals_y, &mut g.normals_z] {
                    for tex in arena.drain() {
                        b.destroy_texture(tex);
                    }
                }
            }
        }
        if self.config.modes.hierarchy {
            if let Some(h) = res.hierarchy.take() {
                b.free_buffer(h.scaled_hypotheses);
                b.free_buffer(h.prior_costs);
            }
        }
        debug_assert!(
            res.geometry.is_none() && res.hierarchy.is_none(),
            "device resources allocated outside the configured modes"
        );
        debug!("{}: reconstruction state released", b.name());
    }
}

impl<B: ComputeBackend> Drop for ReconstructionState<'_, B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Allocate into `res`. On error, whatever was created stays in `res` for
/// teardown to release.
#[allow(clippy::too_many_arguments)]
fn allocate<B: ComputeBackend>(
    b: &B,
    config: &ReconstructionConfig,
    images: &[Image<f32>],
    cameras: &[Camera],
    geometry: Option<&GeometryMaps>,
    plan: &DevicePlan,
    params: &PassParams,
    res: &mut DeviceResources<B>,
) -> Result<()> {
    fn push_texture<B: ComputeBackend>(
        b: &B,
        arena: &mut TextureArena<B::Texture>,
        label: &str,
        image: &Image<f32>,
    ) -> Result<()> {
        let tex = b.create_texture(label, image, SamplerDesc::LOOKUP)?;
        arena.push(tex).map_err(|(tex, err)| {
            b.destroy_texture(tex);
            err
        })?;
        Ok(())
    }

    for (i, img) in images.iter().enumerate() {
        push_texture(b, &mut res.images, &format!("image {i}"), img)?;
    }

    let pixels = plan.hypotheses.len();
    let gpu_cameras: Vec<GpuCamera> = cameras.iter().map(GpuCamera::from).collect();
    let rand_states = seed_rand_states(config.rng_seed, pixels);
    let hyp_bytes = (pixels * std::mem::size_of::<PlaneHypothesis>()) as u64;
    let f32_bytes = (pixels * std::mem::size_of::<f32>()) as u64;
    let u32_bytes = (pixels * std::mem::size_of::<u32>()) as u64;

    // Order matches `Slot`.
    res.core.push(b.create_buffer_init("cameras", &gpu_cameras, BufferKind::Storage)?);
    res.core.push(b.create_buffer_init("hypotheses", &plan.hypotheses, BufferKind::Storage)?);
    res.core.push(b.create_buffer("prev hypotheses", hyp_bytes, BufferKind::Storage)?);
    res.core.push(b.create_buffer_init("costs", &plan.costs, BufferKind::Storage)?);
    res.core.push(b.create_buffer("prev costs", f32_bytes, BufferKind::Storage)?);
    res.core.push(b.create_buffer_init("rand states", &rand_states, BufferKind::Storage)?);
    res.core.push(b.create_buffer("selected views", u32_bytes, BufferKind::Storage)?);
    res.core.push(b.create_buffer_init("pass params", std::slice::from_ref(params), BufferKind::Uniform)?);
    debug_assert_eq!(res.core.len(), CORE_SLOTS);

    if config.modes.geom_consistency {
        if let Some(maps) = geometry {
            let cap = config.image_capacity;
            let g = res.geometry.insert(GeometryTextures {
                depths: TextureArena::new("depth textures", cap),
                normals_x: TextureArena::new("normal x textures", cap),
                normals_y: TextureArena::new("normal y textures", cap),
                normals_z: TextureArena::new("normal z textures", cap),
            });
            for (i, depth) in maps.depths.iter().enumerate() {
                push_texture(b, &mut g.depths, &format!("depth {i}"), depth)?;
            }
            for (i, n) in maps.normals.iter().enumerate() {
                push_texture(b, &mut g.normals_x, &format!("normal x {i}"), &n.x)?;
                push_texture(b, &mut g.normals_y, &format!("normal y {i}"), &n.y)?;
                push_texture(b, &mut g.normals_z, &format!("normal z {i}"), &n.z)?;
            }
        }
    }

    if config.modes.hierarchy {
        if let Some(h) = &plan.hierarchy {
            let scaled = b.create_buffer_init("scaled hypotheses", &h.scaled_hypotheses, BufferKind::Storage)?;
            let prior = match b.create_buffer_init("prior costs", &h.prior_costs, BufferKind::Storage) {
                Ok(p) => p,
                Err(e) => {
                    b.free_buffer(scaled);
                    return Err(e);
                }
            };
            res.hierarchy = Some(HierarchyBuffers {
                scaled_hypotheses: scaled,
                prior_costs: prior,
                scaled_width: h.width,
                scaled_height: h.height,
            });
        }
    }
    Ok(())
}
