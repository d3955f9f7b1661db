// tests/test_state.rs — Integration tests for the reconstruction state:
// input loading, device allocation under every mode combination, the
// propagation hand-off, persistence and teardown.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;

use patchmvs::backend::{BufferKind, ComputeBackend, JbuBindings, ResourceLedger, SamplerDesc};
use patchmvs::camera::Camera;
use patchmvs::config::{PassParams, ReconstructionConfig, ResultLayout};
use patchmvs::dmb::{read_cost, read_depth, read_normal, result_path, write_cost, write_depth, write_normal, MapKind, NormalMap};
use patchmvs::error::{DataError, MvsError, Result};
use patchmvs::host::{HostBackend, HostBuffer, HostTexture};
use patchmvs::image::Image;
use patchmvs::problem::{DenseFolder, ImageSource, Problem};
use patchmvs::state::{DeviceResources, PlaneHypothesis, ReconstructionState, UpsampleRequest};

const W: usize = 8;
const H: usize = 6;

fn pinhole(cx: f32) -> [f32; 9] {
    [100.0, 0.0, cx, 0.0, 100.0, 3.0, 0.0, 0.0, 1.0]
}

/// Images and cameras held in memory, keyed by id.
#[derive(Default)]
struct MemorySource {
    images: HashMap<u32, Image<f32>>,
    cameras: HashMap<u32, Camera>,
}

impl MemorySource {
    fn with_images(ids: &[u32], w: usize, h: usize) -> Self {
        let mut src = MemorySource::default();
        for &id in ids {
            let data = (0..w * h).map(|i| (id * 10) as f32 + (i % 7) as f32).collect();
            src.images.insert(id, Image::from_vec(w, h, data));
            src.cameras
                .insert(id, Camera::with_intrinsics(pinhole(id as f32 + 4.0), w, h, 0.1, 10.0));
        }
        src
    }
}

fn not_found(id: u32) -> MvsError {
    DataError::Io {
        path: format!("memory/{id}").into(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such image"),
    }
    .into()
}

impl ImageSource for MemorySource {
    fn load_image(&self, image_id: u32) -> Result<Image<f32>> {
        self.images.get(&image_id).cloned().ok_or_else(|| not_found(image_id))
    }

    fn load_camera(&self, image_id: u32) -> Result<Camera> {
        self.cameras.get(&image_id).copied().ok_or_else(|| not_found(image_id))
    }
}

fn map_path(dense: &Path, id: u32, kind: MapKind) -> std::path::PathBuf {
    result_path(dense, id, kind, &ResultLayout::default())
}

fn ensure_dir(dense: &Path, id: u32) {
    let p = map_path(dense, id, MapKind::Depth);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
}

fn uniform_normals(w: usize, h: usize, n: [f32; 3]) -> NormalMap {
    let mut normals = NormalMap::new(w, h);
    for y in 0..h {
        for x in 0..w {
            normals.set(x, y, n);
        }
    }
    normals
}

/// Prior depth/normal for every id plus the reference cost, as a previous
/// plain pass would have left them.
fn write_geometry_priors(dense: &Path, ids: &[u32], ref_id: u32) {
    for &id in ids {
        ensure_dir(dense, id);
        write_depth(&map_path(dense, id, MapKind::Depth), &Image::filled(W, H, 2.5f32)).unwrap();
        write_normal(&map_path(dense, id, MapKind::Normal), &uniform_normals(W, H, [0.0, 0.0, -1.0])).unwrap();
    }
    write_cost(&map_path(dense, ref_id, MapKind::Cost), &Image::filled(W, H, 0.75f32)).unwrap();
}

/// Coarse-pass prior for the reference image: full-resolution depth plus
/// normals and cost at `coarse` size.
fn write_hierarchy_priors(dense: &Path, ref_id: u32, coarse: (usize, usize)) {
    ensure_dir(dense, ref_id);
    let (cw, ch) = coarse;
    write_depth(&map_path(dense, ref_id, MapKind::Depth), &Image::filled(W, H, 4.0f32)).unwrap();
    write_normal(
        &map_path(dense, ref_id, MapKind::NormalGeom),
        &uniform_normals(cw, ch, [0.0, 1.0, 0.0]),
    )
    .unwrap();
    write_cost(&map_path(dense, ref_id, MapKind::Cost), &Image::filled(cw, ch, 0.75f32)).unwrap();
}

fn config_for(geom: bool, hierarchy: bool) -> ReconstructionConfig {
    let mut cfg = ReconstructionConfig::default();
    if geom {
        cfg = cfg.with_geom_consistency(false);
    }
    if hierarchy {
        cfg = cfg.with_hierarchy();
    }
    cfg
}

fn is_invalid_state(e: MvsError) -> bool {
    matches!(e.as_data(), Some(DataError::InvalidState(_)))
}

/// Host backend whose `fail_at`-th allocation (textures and buffers
/// counted together, from zero) fails like a device out of memory.
struct FailingBackend {
    inner: HostBackend,
    fail_at: usize,
    attempts: Cell<usize>,
}

impl FailingBackend {
    fn new(fail_at: usize) -> Self {
        FailingBackend {
            inner: HostBackend::new(),
            fail_at,
            attempts: Cell::new(0),
        }
    }

    fn check(&self, op: &str, label: &str) -> Result<()> {
        let n = self.attempts.get();
        self.attempts.set(n + 1);
        if n == self.fail_at {
            return Err(MvsError::device(op, format!("{label}: out of memory")));
        }
        Ok(())
    }
}

impl ComputeBackend for FailingBackend {
    type Texture = HostTexture;
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "failing-host"
    }

    fn ledger(&self) -> &ResourceLedger {
        self.inner.ledger()
    }

    fn create_texture(&self, label: &str, image: &Image<f32>, sampler: SamplerDesc) -> Result<HostTexture> {
        self.check("create_texture", label)?;
        self.inner.create_texture(label, image, sampler)
    }

    fn destroy_texture(&self, texture: HostTexture) {
        self.inner.destroy_texture(texture)
    }

    fn create_buffer(&self, label: &str, size: u64, kind: BufferKind) -> Result<HostBuffer> {
        self.check("create_buffer", label)?;
        self.inner.create_buffer(label, size, kind)
    }

    fn write_buffer(&self, buffer: &HostBuffer, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_buffer(buffer, offset, data)
    }

    fn read_buffer(&self, buffer: &HostBuffer) -> Result<Vec<u8>> {
        self.inner.read_buffer(buffer)
    }

    fn free_buffer(&self, buffer: HostBuffer) {
        self.inner.free_buffer(buffer)
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    fn joint_bilateral(&self, b: &JbuBindings<'_, Self>) -> Result<()> {
        self.inner.joint_bilateral(&JbuBindings {
            guide: b.guide,
            coarse: b.coarse,
            params: b.params,
            output: b.output,
            width: b.width,
            height: b.height,
        })
    }
}

// ===== Resource ledger =====

#[test]
fn every_mode_combination_releases_what_it_allocates() {
    // (geom, hierarchy, textures, buffers) for a 2-image problem.
    let cases = [
        (false, false, 2, 8),
        (true, false, 2 + 4 * 2, 8),
        (false, true, 2, 8 + 2),
        (true, true, 2 + 4 * 2, 8 + 2),
    ];

    for (geom, hierarchy, textures, buffers) in cases {
        let dense = tempfile::tempdir().unwrap();
        if geom {
            write_geometry_priors(dense.path(), &[0, 1], 0);
        }
        if hierarchy {
            write_hierarchy_priors(dense.path(), 0, (W, H));
        }

        let backend = HostBackend::new();
        let source = MemorySource::with_images(&[0, 1], W, H);
        {
            let mut state = ReconstructionState::new(&backend, config_for(geom, hierarchy), dense.path());
            state
                .input_initialization(&Problem::new(0, vec![1], 3200), &source)
                .unwrap();
            state.device_initialization().unwrap();

            let snap = state.ledger();
            assert_eq!(snap.textures_created, textures, "geom={geom} hierarchy={hierarchy}");
            assert_eq!(snap.buffers_created, buffers, "geom={geom} hierarchy={hierarchy}");
            assert!(!snap.is_balanced());
        }

        let snap = backend.ledger().snapshot();
        assert!(snap.is_balanced(), "leak with geom={geom} hierarchy={hierarchy}: {snap:?}");
        assert_eq!(snap.allocations(), textures + buffers);
    }
}

#[test]
fn allocation_failure_partway_through_is_fatal_and_released() {
    // (geom, hierarchy, total allocations) for a 2-image problem.
    for (geom, hierarchy, total) in [(true, false, 10 + 8), (true, true, 10 + 10)] {
        let dense = tempfile::tempdir().unwrap();
        write_geometry_priors(dense.path(), &[0, 1], 0);
        if hierarchy {
            write_hierarchy_priors(dense.path(), 0, (W, H));
        }
        let source = MemorySource::with_images(&[0, 1], W, H);

        for fail_at in 0..total {
            let backend = FailingBackend::new(fail_at);
            {
                let mut state = ReconstructionState::new(&backend, config_for(geom, hierarchy), dense.path());
                state
                    .input_initialization(&Problem::new(0, vec![1], 3200), &source)
                    .unwrap();
                let err = state.device_initialization().unwrap_err();
                assert!(err.is_fatal(), "fail_at={fail_at}: {err}");
                assert_eq!(backend.ledger().snapshot().allocations(), fail_at);
            }
            let snap = backend.ledger().snapshot();
            assert!(
                snap.is_balanced(),
                "geom={geom} hierarchy={hierarchy} fail_at={fail_at}: {snap:?}"
            );
        }

        // One past the last allocation nothing fails.
        let backend = FailingBackend::new(total);
        {
            let mut state = ReconstructionState::new(&backend, config_for(geom, hierarchy), dense.path());
            state
                .input_initialization(&Problem::new(0, vec![1], 3200), &source)
                .unwrap();
            state.device_initialization().unwrap();
        }
        assert!(backend.ledger().is_balanced());
    }
}

#[test]
fn state_dropped_before_device_initialisation_allocates_nothing() {
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    {
        let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), "/unused");
        state
            .input_initialization(&Problem::new(0, vec![1], 3200), &source)
            .unwrap();
    }
    assert_eq!(backend.ledger().snapshot().allocations(), 0);
}

#[test]
fn missing_prior_fails_before_any_allocation() {
    let dense = tempfile::tempdir().unwrap();
    // Depth/normal priors exist, reference cost does not.
    for id in [0, 1] {
        ensure_dir(dense.path(), id);
        write_depth(&map_path(dense.path(), id, MapKind::Depth), &Image::filled(W, H, 1.0f32)).unwrap();
        write_normal(&map_path(dense.path(), id, MapKind::Normal), &NormalMap::new(W, H)).unwrap();
    }

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, config_for(true, false), dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();
    let err = state.device_initialization().unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(backend.ledger().snapshot().allocations(), 0);
}

// ===== Input initialisation =====

#[test]
fn end_to_end_inputs_from_a_dense_folder() {
    let dense = tempfile::tempdir().unwrap();
    let root = dense.path();
    std::fs::create_dir_all(root.join("images")).unwrap();
    std::fs::create_dir_all(root.join("cams")).unwrap();

    for id in 0u32..3 {
        let gray = image::GrayImage::from_pixel(50, 50, image::Luma([40 + 60 * id as u8]));
        gray.save(root.join("images").join(format!("{id:08}.jpg"))).unwrap();
        let cam = format!(
            "extrinsic\n1 0 0 {id}\n0 1 0 0\n0 0 1 0\n0 0 0 1\n\n\
             intrinsic\n100 0 25\n0 100 25\n0 0 1\n\n0.1 0.05 192 10\n"
        );
        std::fs::write(root.join("cams").join(format!("{id:08}_cam.txt")), cam).unwrap();
    }

    let backend = HostBackend::new();
    let folder = DenseFolder::new(root);
    let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), root);
    state
        .input_initialization(&Problem::new(0, vec![1, 2], 3200), &folder)
        .unwrap();

    let (dmin, dmax) = state.depth_range();
    assert!((dmin - 0.06).abs() < 1e-6, "depth_min {dmin}");
    assert!((dmax - 14.0).abs() < 1e-5, "depth_max {dmax}");

    assert_eq!(state.cameras().len(), 3);
    assert_eq!(state.images().len(), 3);
    for (i, (cam, img)) in state.cameras().iter().zip(state.images()).enumerate() {
        assert_eq!(img.dims(), (50, 50));
        assert_eq!((cam.width, cam.height), (50, 50));
        // Translation x encodes the id; loaded order is ref, src[0], src[1].
        assert_eq!(cam.t[0], i as f32);
        let expected = 40.0 + 60.0 * i as f32;
        assert!((img.get(25, 25) - expected).abs() < 3.0, "image {i}: {}", img.get(25, 25));
    }
    assert_eq!(state.reference_width(), 50);
    assert_eq!(state.reference_height(), 50);
    assert_eq!(state.params().num_images, 3);
}

#[test]
fn disparity_range_follows_the_working_depth_range() {
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), "/unused");
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();

    let (dmin, dmax) = state.depth_range();
    let (lo, hi) = state.disparity_range();
    assert!((lo - 100.0 * 0.54 / dmax).abs() < 1e-4);
    assert!((hi - 100.0 * 0.54 / dmin).abs() < 1e-2);
    assert!(lo < hi);
}

#[test]
fn oversized_images_are_shrunk_with_their_cameras() {
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], 100, 60);
    let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), "/unused");
    state
        .input_initialization(&Problem::new(0, vec![1], 50), &source)
        .unwrap();

    for cam in state.cameras() {
        assert_eq!((cam.width, cam.height), (50, 30));
        assert!((cam.fx() - 50.0).abs() < 1e-4);
        assert!((cam.fy() - 50.0).abs() < 1e-4);
    }
    assert!(state.images().iter().all(|img| img.dims() == (50, 30)));
    assert_eq!((state.params().ref_width, state.params().ref_height), (50, 30));
}

#[test]
fn problems_beyond_image_capacity_are_rejected() {
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1, 2], W, H);
    let cfg = ReconstructionConfig::default().with_image_capacity(2);
    let mut state = ReconstructionState::new(&backend, cfg, "/unused");
    let err = state
        .input_initialization(&Problem::new(0, vec![1, 2], 3200), &source)
        .unwrap_err();
    assert!(matches!(
        err.as_data(),
        Some(DataError::CapacityExceeded { capacity: 2, requested: 3, .. })
    ));
}

#[test]
fn missing_source_image_is_recoverable() {
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0], W, H);
    let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), "/unused");
    let err = state
        .input_initialization(&Problem::new(0, vec![5], 3200), &source)
        .unwrap_err();
    assert!(err.is_recoverable());
}

// ===== Device initialisation =====

#[test]
fn geometric_consistency_seeds_hypotheses_from_priors() {
    let dense = tempfile::tempdir().unwrap();
    write_geometry_priors(dense.path(), &[0, 1], 0);

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, config_for(true, false), dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();

    let maps = state.geometry_maps().unwrap();
    assert_eq!(maps.depths.len(), 2);
    assert_eq!(maps.normals[1].get(3, 2), [0.0, 0.0, -1.0]);
    assert_eq!(state.params().max_iterations, 2);

    state.device_initialization().unwrap();
    let hyp = state.plane_hypothesis(W * 2 + 3).unwrap();
    assert_eq!(hyp, PlaneHypothesis::new([0.0, 0.0, -1.0], 2.5));
    assert_eq!(state.cost(0), Some(0.75));
    assert_eq!(state.plane_hypothesis(W * H), None);

    let res = state.device_resources().unwrap();
    let geometry = res.geometry.as_ref().unwrap();
    assert_eq!(geometry.depths.len(), 2);
    assert_eq!(geometry.normals_z.len(), 2);
    assert!(res.hierarchy.is_none());
}

#[test]
fn multi_geometry_reads_the_geom_suffixed_maps() {
    let dense = tempfile::tempdir().unwrap();
    for id in [0, 1] {
        ensure_dir(dense.path(), id);
        write_depth(&map_path(dense.path(), id, MapKind::DepthGeom), &Image::filled(W, H, 6.0f32)).unwrap();
        write_normal(
            &map_path(dense.path(), id, MapKind::NormalGeom),
            &uniform_normals(W, H, [1.0, 0.0, 0.0]),
        )
        .unwrap();
    }
    write_cost(&map_path(dense.path(), 0, MapKind::Cost), &Image::filled(W, H, 0.1f32)).unwrap();

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let cfg = ReconstructionConfig::default().with_geom_consistency(true);
    let mut state = ReconstructionState::new(&backend, cfg, dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();
    state.device_initialization().unwrap();
    assert_eq!(state.plane_hypothesis(0).unwrap().depth, 6.0);
    assert_eq!(state.plane_hypothesis(0).unwrap().normal(), [1.0, 0.0, 0.0]);
}

#[test]
fn hierarchy_at_full_resolution_needs_no_upsampling() {
    let dense = tempfile::tempdir().unwrap();
    write_hierarchy_priors(dense.path(), 0, (W, H));

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, config_for(false, true), dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();
    state.device_initialization().unwrap();

    assert_eq!(state.upsample_request(), None);
    assert_eq!(state.params().upsample, 0);
    // The whole prior triple lands in the full-resolution buffers.
    assert_eq!(state.plane_hypothesis(5), Some(PlaneHypothesis::new([0.0, 1.0, 0.0], 4.0)));
    assert_eq!(state.cost(5), Some(0.75));
    let res = state.device_resources().unwrap();
    let on_device: Vec<PlaneHypothesis> = backend.read_pod(res.hypotheses()).unwrap();
    assert!(on_device.iter().all(|h| *h == PlaneHypothesis::new([0.0, 1.0, 0.0], 4.0)));
    let costs: Vec<f32> = backend.read_pod(res.costs()).unwrap();
    assert!(costs.iter().all(|&c| c == 0.75));
    let h = res.hierarchy.as_ref().unwrap();
    assert_eq!((h.scaled_width, h.scaled_height), (W, H));
}

#[test]
fn coarser_hierarchy_prior_requests_upsampling() {
    let dense = tempfile::tempdir().unwrap();
    write_hierarchy_priors(dense.path(), 0, (W / 2, H / 2));

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, config_for(false, true), dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();
    state.device_initialization().unwrap();

    assert_eq!(
        state.upsample_request(),
        Some(UpsampleRequest {
            scaled_width: W / 2,
            scaled_height: H / 2
        })
    );
    let p = state.params();
    assert_eq!((p.upsample, p.scaled_width, p.scaled_height), (1, 4, 3));

    let res = state.device_resources().unwrap();
    let h = res.hierarchy.as_ref().unwrap();
    let scaled: Vec<PlaneHypothesis> = backend.read_pod(&h.scaled_hypotheses).unwrap();
    assert_eq!(scaled.len(), 4 * 3);
    // Pending upsampling: the fourth component carries the coarse cost.
    assert_eq!(scaled[0], PlaneHypothesis::new([0.0, 1.0, 0.0], 0.75));
    let prior: Vec<f32> = backend.read_pod(&h.prior_costs).unwrap();
    assert_eq!(prior.len(), 4 * 3);
}

#[test]
fn empty_source_geometry_maps_are_a_data_error() {
    let dense = tempfile::tempdir().unwrap();
    write_geometry_priors(dense.path(), &[0, 1], 0);
    write_depth(&map_path(dense.path(), 1, MapKind::Depth), &Image::new(0, 0)).unwrap();
    write_normal(&map_path(dense.path(), 1, MapKind::Normal), &NormalMap::new(0, 0)).unwrap();

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, config_for(true, false), dense.path());
    let err = state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap_err();
    assert!(err.is_recoverable(), "{err}");
    assert!(matches!(err.as_data(), Some(DataError::Truncated { .. })));
    assert!(is_invalid_state(state.device_initialization().unwrap_err()));
    assert_eq!(backend.ledger().snapshot().allocations(), 0);
}

#[test]
fn empty_input_image_is_a_data_error() {
    let backend = HostBackend::new();
    let mut source = MemorySource::with_images(&[0, 1], W, H);
    source.images.insert(1, Image::new(0, 0));
    let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), "/unused");
    let err = state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap_err();
    assert!(err.is_recoverable());
    assert!(matches!(err.as_data(), Some(DataError::EmptyImage { .. })));
    assert_eq!(backend.ledger().snapshot().allocations(), 0);
}

#[test]
fn hierarchy_depth_at_the_wrong_size_is_rejected() {
    let dense = tempfile::tempdir().unwrap();
    ensure_dir(dense.path(), 0);
    write_depth(&map_path(dense.path(), 0, MapKind::Depth), &Image::filled(3, 3, 1.0f32)).unwrap();
    write_normal(&map_path(dense.path(), 0, MapKind::NormalGeom), &NormalMap::new(3, 3)).unwrap();
    write_cost(&map_path(dense.path(), 0, MapKind::Cost), &Image::filled(3, 3, 1.0f32)).unwrap();

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, config_for(false, true), dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();
    let err = state.device_initialization().unwrap_err();
    assert!(matches!(err.as_data(), Some(DataError::DimensionMismatch { .. })));
    assert_eq!(backend.ledger().snapshot().allocations(), 0);
}

// ===== Lifecycle =====

#[test]
fn operations_out_of_order_are_invalid_state() {
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), "/unused");

    let is_invalid = is_invalid_state;
    assert!(is_invalid(state.device_initialization().unwrap_err()));
    assert!(is_invalid(state.persist_results().unwrap_err()));

    let problem = Problem::new(0, vec![1], 3200);
    state.input_initialization(&problem, &source).unwrap();
    assert!(is_invalid(state.input_initialization(&problem, &source).unwrap_err()));

    let mut noop = |_: &HostBackend, _: &DeviceResources<HostBackend>, _: &PassParams| -> Result<()> { Ok(()) };
    assert!(is_invalid(state.run_pass(&mut noop).unwrap_err()));

    state.device_initialization().unwrap();
    assert!(is_invalid(state.device_initialization().unwrap_err()));
    state.run_pass(&mut noop).unwrap();
    assert!(is_invalid(state.run_pass(&mut noop).unwrap_err()));
}

// ===== Pass and persistence =====

#[test]
fn pass_results_are_mirrored_persisted_and_exported() {
    let dense = tempfile::tempdir().unwrap();
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();
    state.device_initialization().unwrap();

    let mut calls = 0;
    let mut kernel = |b: &HostBackend, res: &DeviceResources<HostBackend>, p: &PassParams| -> Result<()> {
        calls += 1;
        let n = (p.ref_width * p.ref_height) as usize;
        let hyps: Vec<PlaneHypothesis> = (0..n)
            .map(|i| PlaneHypothesis::new([0.0, 0.0, -1.0], 1.0 + i as f32 * 0.01))
            .collect();
        let costs: Vec<f32> = (0..n).map(|i| (i % 3) as f32).collect();
        let views: Vec<u32> = vec![0b1; n];
        b.write_buffer(res.hypotheses(), 0, bytemuck::cast_slice(&hyps))?;
        b.write_buffer(res.costs(), 0, bytemuck::cast_slice(&costs))?;
        b.write_buffer(res.selected_views(), 0, bytemuck::cast_slice(&views))?;
        Ok(())
    };
    state.run_pass(&mut kernel).unwrap();
    assert_eq!(calls, 1);

    assert!((state.plane_hypothesis(10).unwrap().depth - 1.1).abs() < 1e-6);
    assert_eq!(state.cost(4), Some(1.0));
    assert_eq!(state.selected_views(7), Some(1));

    let written = state.persist_results().unwrap();
    assert_eq!(written.len(), 3);
    let depth = read_depth(&map_path(dense.path(), 0, MapKind::Depth)).unwrap();
    assert_eq!(depth.dims(), (W, H));
    assert_eq!(depth.get(2, 1), 1.0 + 10.0 * 0.01);
    let normals = read_normal(&map_path(dense.path(), 0, MapKind::Normal)).unwrap();
    assert_eq!(normals.get(7, 5), [0.0, 0.0, -1.0]);
    let cost = read_cost(&map_path(dense.path(), 0, MapKind::Cost)).unwrap();
    assert_eq!(cost.get(1, 0), 1.0);

    let points = state.point_records();
    assert_eq!(points.len(), W * H);
    // Identity pose: the world point sits at the hypothesis depth.
    assert!((points[0].position[2] - 1.0).abs() < 1e-6);
    let gray = state.reference_image().unwrap().get(0, 0) as u8;
    assert_eq!(points[0].color, [gray; 3]);
}

#[test]
fn geometric_pass_persists_the_geom_depth() {
    let dense = tempfile::tempdir().unwrap();
    write_geometry_priors(dense.path(), &[0, 1], 0);

    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    let mut state = ReconstructionState::new(&backend, config_for(true, false), dense.path());
    state
        .input_initialization(&Problem::new(0, vec![1], 3200), &source)
        .unwrap();
    state.device_initialization().unwrap();
    let mut noop = |_: &HostBackend, _: &DeviceResources<HostBackend>, _: &PassParams| -> Result<()> { Ok(()) };
    state.run_pass(&mut noop).unwrap();

    let written = state.persist_results().unwrap();
    assert_eq!(written[0], map_path(dense.path(), 0, MapKind::DepthGeom));
    // Untouched hypotheses round-trip the seeded prior.
    let depth = read_depth(&written[0]).unwrap();
    assert!(depth.as_slice().iter().all(|&d| d == 2.5));
}

#[test]
fn kernel_failure_still_releases_everything() {
    let backend = HostBackend::new();
    let source = MemorySource::with_images(&[0, 1], W, H);
    {
        let mut state = ReconstructionState::new(&backend, ReconstructionConfig::default(), "/unused");
        state
            .input_initialization(&Problem::new(0, vec![1], 3200), &source)
            .unwrap();
        state.device_initialization().unwrap();
        let mut failing = |_: &HostBackend, _: &DeviceResources<HostBackend>, _: &PassParams| -> Result<()> {
            Err(MvsError::device("propagate", "launch failed"))
        };
        let err = state.run_pass(&mut failing).unwrap_err();
        assert!(err.is_fatal());
    }
    assert!(backend.ledger().is_balanced());
}
